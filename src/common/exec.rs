use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::rt::{BoxSendFuture, Executor, TokioExecutor};

/// A type-erased handle to whatever [`Executor`] the caller supplied.
#[derive(Clone)]
pub(crate) struct Exec {
    inner: Arc<dyn Executor<BoxSendFuture> + Send + Sync>,
}

impl Exec {
    pub(crate) fn new<E>(executor: E) -> Exec
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
    {
        Exec {
            inner: Arc::new(executor),
        }
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.execute(Box::pin(fut));
    }
}

impl Default for Exec {
    fn default() -> Exec {
        Exec::new(TokioExecutor)
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}
