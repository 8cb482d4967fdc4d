//! Layout of the Ebb id space.
//!
//! ```text
//! 0 .. FIRST_FREE_ID                 static ids of the runtime's own Ebbs
//! FIRST_FREE_ID .. FIRST_STATIC_USER_ID   locally allocated ids
//! FIRST_STATIC_USER_ID ..= LAST_LOCAL_ID  static ids chosen by applications
//! (space << 16) ..= ((space + 1) << 16) - 1   global ids of one id space
//! ```

use static_assertions::const_assert;

pub const FIRST_LOCAL_ID: u32 = 0;
pub const FIRST_STATIC_USER_ID: u32 = 1 << 15;
pub const LAST_LOCAL_ID: u32 = (1 << 16) - 1;

/// Number of bits of a global id that index within its id space.
pub const ID_SPACE_SHIFT: u32 = 16;

/// Id space 0 overlaps the local ids, so global spaces start at 1.
pub const FIRST_GLOBAL_ID_SPACE: u16 = 1;

const_assert!(FIRST_STATIC_USER_ID < LAST_LOCAL_ID);
const_assert!(LAST_LOCAL_ID < (FIRST_GLOBAL_ID_SPACE as u32) << ID_SPACE_SHIFT);
