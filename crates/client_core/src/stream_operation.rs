use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    stream::{BoxStream, Stream},
    StreamExt,
};
use shared::{AppError, Outcome};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::{join_failure, BackgroundContext, TaskGuard};

/// Logic that produces a sequence of values over time instead of one
/// terminal value.
pub trait StreamOperation: Send + Sync + 'static {
    type Params: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn execute(&self, params: Self::Params) -> BoxStream<'static, anyhow::Result<Self::Output>>;
}

impl BackgroundContext {
    /// Lazily runs `execute` on the worker pool once the returned stream is
    /// first polled.
    ///
    /// The first fault becomes one failure envelope and ends the stream;
    /// nothing is emitted after it. Dropping the stream aborts the producer.
    pub fn invoke_stream<O: StreamOperation>(
        &self,
        operation: Arc<O>,
        params: O::Params,
    ) -> BoxStream<'static, Outcome<O::Output>> {
        let name = operation.name();
        let context = self.clone();
        let launch = move || {
            let (tx, rx) = mpsc::channel(context.stream_buffer());
            debug!(operation = name, "starting stream operation");
            let task = context.spawn(async move {
                let mut source = operation.execute(params);
                while let Some(item) = source.next().await {
                    match item {
                        Ok(value) => {
                            if tx.send(Ok(value)).await.is_err() {
                                debug!(operation = name, "stream subscriber went away");
                                return;
                            }
                        }
                        Err(err) => {
                            let err = AppError::from(err);
                            warn!(operation = name, code = ?err.code(), error = %err, "stream operation failed");
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
                debug!(operation = name, "stream operation completed");
            });
            Forwarding { rx, task }
        };

        ForwardedStream {
            name,
            launch: Some(Box::new(launch)),
            active: None,
            finished: false,
        }
        .boxed()
    }
}

struct Forwarding<T> {
    rx: mpsc::Receiver<Outcome<T>>,
    task: TaskGuard<()>,
}

struct ForwardedStream<T> {
    name: &'static str,
    launch: Option<Box<dyn FnOnce() -> Forwarding<T> + Send>>,
    active: Option<Forwarding<T>>,
    finished: bool,
}

impl<T> Unpin for ForwardedStream<T> {}

impl<T> ForwardedStream<T> {
    fn finish(&mut self) {
        self.finished = true;
        self.active = None;
    }
}

impl<T> Stream for ForwardedStream<T> {
    type Item = Outcome<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.active.is_none() {
            if let Some(launch) = this.launch.take() {
                this.active = Some(launch());
            }
        }
        let Some(active) = this.active.as_mut() else {
            this.finished = true;
            return Poll::Ready(None);
        };

        let received = active.rx.poll_recv(cx);
        match received {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            // The producer dropped its sender: it either returned or panicked.
            Poll::Ready(None) => {
                let joined = Pin::new(&mut active.task).poll(cx);
                match joined {
                    Poll::Ready(Ok(())) => {
                        this.finish();
                        Poll::Ready(None)
                    }
                    Poll::Ready(Err(err)) => {
                        let err = join_failure(err, this.name);
                        warn!(operation = this.name, error = %err, "stream operation aborted");
                        this.finish();
                        Poll::Ready(Some(Err(err)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

type BoxedStreamExecute<P, R> =
    Box<dyn Fn(P) -> BoxStream<'static, anyhow::Result<R>> + Send + Sync>;

pub struct FnStreamOperation<P, R> {
    name: &'static str,
    execute: BoxedStreamExecute<P, R>,
}

/// Builds a [`StreamOperation`] from a closure returning a stream.
pub fn stream_fn<P, R, F, S>(name: &'static str, execute: F) -> Arc<FnStreamOperation<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> S + Send + Sync + 'static,
    S: Stream<Item = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(FnStreamOperation {
        name,
        execute: Box::new(move |params| execute(params).boxed()),
    })
}

impl<P, R> StreamOperation for FnStreamOperation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    type Params = P;
    type Output = R;

    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, params: P) -> BoxStream<'static, anyhow::Result<R>> {
        (self.execute)(params)
    }
}

#[cfg(test)]
#[path = "tests/stream_operation_tests.rs"]
mod tests;
