use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use spin::Mutex;
use std::sync::Arc;

struct Shared<T> {
    value: Option<T>,
    waker: Option<Waker>,
    closed: bool,
}

/// Creates a one-shot channel: the [`Promise`] is fulfilled once, from any
/// core, and the [`PromiseFuture`] resolves to the value.
pub fn promise<T: Send>() -> (Promise<T>, PromiseFuture<T>) {
    let shared = Arc::new(Mutex::new(Shared { value: None, waker: None, closed: false }));
    (Promise { shared: shared.clone() }, PromiseFuture { shared })
}

pub struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.complete(Some(value));
    }

    fn complete(&self, value: Option<T>) {
        let waker = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.value = value;
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.complete(None);
    }
}

/// Resolves to the promised value, or `None` if the [`Promise`] was dropped unfulfilled.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct PromiseFuture<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> PromiseFuture<T> {
    pub fn is_ready(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut shared = self.shared.lock();
        if shared.closed {
            Poll::Ready(shared.value.take())
        } else {
            shared.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
