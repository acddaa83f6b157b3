//! Runtime abstractions.
//!
//! The transport core does not call `tokio::spawn` or `tokio::time::sleep`
//! directly; it goes through the traits in this module so that the session
//! state machine can be driven by a deterministic fake clock in tests (see
//! [`FakeTimer`] in the `common::time` tests) without touching real time.

mod timer;

pub use timer::{Sleep, Timer};

use std::future::Future;
use std::pin::Pin;

/// An executor of futures, abstracting over the async runtime in use.
///
/// A `TokioExecutor` is provided as the default; callers embedding this
/// crate under a different runtime may supply their own.
pub trait Executor<Fut> {
    /// Place the future onto the executor to be run to completion.
    fn execute(&self, fut: Fut);
}

pub(crate) type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Default [`Executor`] backed by `tokio::spawn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}
