use std::{
    any::Any,
    future::Future,
    pin::Pin,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result};
use shared::AppError;
use tokio::{
    runtime::Handle,
    task::{JoinError, JoinHandle},
};

const DEFAULT_STREAM_BUFFER: usize = 16;

/// Handle to the shared worker pool that operations, streams and event
/// handlers run on. Cloning is cheap; every clone schedules onto the same pool.
#[derive(Debug, Clone)]
pub struct BackgroundContext {
    handle: Handle,
    stream_buffer: usize,
}

impl BackgroundContext {
    /// Binds to the runtime the caller is running on.
    ///
    /// Panics when called outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    pub fn try_current() -> Result<Self> {
        let handle = Handle::try_current().context("no tokio runtime available for background work")?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }

    pub(crate) fn spawn<F>(&self, future: F) -> TaskGuard<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskGuard {
            handle: self.handle.spawn(future),
        }
    }
}

/// Join handle that aborts its task when dropped, so cancelling whoever
/// awaits the work cancels the work too.
pub(crate) struct TaskGuard<T> {
    handle: JoinHandle<T>,
}

impl<T> Future for TaskGuard<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) fn join_failure(err: JoinError, what: &str) -> AppError {
    if err.is_panic() {
        let payload = err.into_panic();
        AppError::unknown(format!("{what} panicked: {}", panic_message(payload.as_ref())))
    } else {
        AppError::unknown(format!("{what} was cancelled"))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
