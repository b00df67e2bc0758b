//! Timer primitives that work in the browser and natively
//!
//! The browser has no blocking sleep, so the wasm path rides on JS timers
//! (`gloo-timers`); the native path, used by the test suite, hand-rolls a
//! thread-backed timer future. Everything else in the crate talks only to
//! `sleep` and `timeout`.

use crate::error::{Result, TorError};
use futures::future::Either;
use std::future::Future;
use std::time::Duration;
use web_time::SystemTime;

/// Current wall-clock time as Unix seconds.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolve after `duration`.
#[cfg(target_arch = "wasm32")]
pub async fn sleep(duration: Duration) {
    gloo_timers::future::TimeoutFuture::new(duration.as_millis() as u32).await;
}

/// Resolve after `duration`.
#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(duration: Duration) {
    native_sleep::Sleep::new(duration).await
}

#[cfg(not(target_arch = "wasm32"))]
mod native_sleep {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll, Waker};
    use std::time::Duration;

    struct Shared {
        fired: bool,
        waker: Option<Waker>,
    }

    /// A timer future backed by a detached sleeper thread.
    pub struct Sleep {
        duration: Duration,
        shared: Option<Arc<Mutex<Shared>>>,
    }

    impl Sleep {
        pub fn new(duration: Duration) -> Self {
            Self {
                duration,
                shared: None,
            }
        }
    }

    impl Future for Sleep {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if let Some(ref shared) = self.shared {
                let mut s = shared.lock().unwrap();
                if s.fired {
                    return Poll::Ready(());
                }
                s.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            if self.duration.is_zero() {
                return Poll::Ready(());
            }

            let shared = Arc::new(Mutex::new(Shared {
                fired: false,
                waker: Some(cx.waker().clone()),
            }));
            let thread_shared = Arc::clone(&shared);
            let duration = self.duration;
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                let mut s = thread_shared.lock().unwrap();
                s.fired = true;
                if let Some(w) = s.waker.take() {
                    w.wake();
                }
            });
            self.shared = Some(shared);
            Poll::Pending
        }
    }
}

/// Race `fut` against a deadline. On expiry the future is dropped and a
/// `Timeout` carrying `label` is returned.
pub async fn timeout<T>(
    label: &'static str,
    duration: Duration,
    fut: impl Future<Output = T>,
) -> Result<T> {
    futures::pin_mut!(fut);
    let deadline = sleep(duration);
    futures::pin_mut!(deadline);

    match futures::future::select(fut, deadline).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(((), _)) => Err(TorError::Timeout(label)),
    }
}
