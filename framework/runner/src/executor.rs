use std::future::Future;

use cloudbench_core::prelude::{AbortHandle, AbortedError};

#[derive(Debug)]
pub struct Executor {
    runtime: tokio::runtime::Runtime,
    abort: AbortHandle,
}

impl Executor {
    pub(crate) fn new(runtime: tokio::runtime::Runtime, abort: AbortHandle) -> Self {
        Self { runtime, abort }
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Runtime {
        &self.runtime
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// Note that the future will be cancelled if the task is hard aborted. You do not need to do
    /// anything special to handle this, but you should be aware that submitting a future which does
    /// not support cancelling may prevent the runner from shutting down.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let abort_listener = self.abort.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                result = fut => result,
                _ = abort_listener.wait_for_hard_abort() => {
                    Err(anyhow::anyhow!(AbortedError::default()))
                },
            }
        })
    }

    /// Submit async code to be run in the background.
    ///
    /// Note that the future will not be cancelled if the task is aborted. It is also not
    /// guaranteed that the runner will wait for the future to complete before shutting down.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(fut);
    }
}
