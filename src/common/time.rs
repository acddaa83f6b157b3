use std::sync::Arc;
use std::{fmt, pin::Pin, time::Instant};

use crate::rt::{Sleep, Timer, TokioTimer};

/// A shared handle to a [`Timer`], cloned into every component that needs to
/// wait or measure elapsed time, so tests can swap in a fake clock once and
/// have it observed consistently by the transport, the idle-ping cadence,
/// and the backoff ladder.
#[derive(Clone)]
pub(crate) struct Time {
    timer: Arc<dyn Timer>,
}

impl Time {
    pub(crate) fn new<T: Timer + 'static>(timer: T) -> Time {
        Time {
            timer: Arc::new(timer),
        }
    }

    pub(crate) fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
        self.timer.sleep(duration)
    }

    pub(crate) fn now(&self) -> Instant {
        self.timer.now()
    }
}

impl Default for Time {
    fn default() -> Time {
        Time::new(TokioTimer)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Time").finish()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A fake timer used by tests to control backoff/idle-ping waits without
    //! real wall-clock delay.
    use super::*;
    use std::future::Future;
    use std::sync::Mutex;
    use std::task::{Context, Poll, Waker};

    #[derive(Default)]
    struct Inner {
        now: Instant,
        wakers: Vec<(Instant, Waker)>,
    }

    /// A manually-advanced clock. `advance` resolves any pending sleeps whose
    /// deadline has passed.
    #[derive(Clone)]
    pub(crate) struct FakeTimer {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeTimer {
        pub(crate) fn new() -> FakeTimer {
            FakeTimer {
                inner: Arc::new(Mutex::new(Inner {
                    now: Instant::now(),
                    wakers: Vec::new(),
                })),
            }
        }

        pub(crate) fn advance(&self, by: std::time::Duration) {
            let mut inner = self.inner.lock().unwrap();
            inner.now += by;
            let now = inner.now;
            inner.wakers.retain(|(deadline, waker)| {
                if *deadline <= now {
                    waker.wake_by_ref();
                    false
                } else {
                    true
                }
            });
        }
    }

    impl Timer for FakeTimer {
        fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
            let now = self.now();
            self.sleep_until(now + duration)
        }

        fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
            Box::pin(FakeSleep {
                inner: self.inner.clone(),
                deadline,
            })
        }

        fn now(&self) -> Instant {
            self.inner.lock().unwrap().now
        }
    }

    struct FakeSleep {
        inner: Arc<Mutex<Inner>>,
        deadline: Instant,
    }

    impl Future for FakeSleep {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.now >= self.deadline {
                Poll::Ready(())
            } else {
                inner.wakers.push((self.deadline, cx.waker().clone()));
                Poll::Pending
            }
        }
    }

    impl Sleep for FakeSleep {}

    fn noop_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};

        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { Waker::from_raw(raw()) }
    }

    #[test]
    fn advance_wakes_pending_sleep() {
        let timer = FakeTimer::new();
        let time = Time::new(timer.clone());
        let mut sleep = time.sleep(std::time::Duration::from_secs(5));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(sleep.as_mut().poll(&mut cx).is_pending());

        timer.advance(std::time::Duration::from_secs(5));
        assert!(sleep.as_mut().poll(&mut cx).is_ready());
    }
}
