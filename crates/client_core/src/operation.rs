use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use shared::{AppError, Outcome, OutcomeExt};
use tracing::{debug, warn};

use crate::context::{join_failure, BackgroundContext};

/// A single parameterized unit of business logic producing one value.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    type Params: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn execute(&self, params: Self::Params) -> anyhow::Result<Self::Output>;
}

impl BackgroundContext {
    /// Runs `execute` on the worker pool and returns exactly one envelope.
    ///
    /// Returned errors and panics alike come back as a failure envelope.
    pub async fn invoke<O: Operation>(
        &self,
        operation: Arc<O>,
        params: O::Params,
    ) -> Outcome<O::Output> {
        let name = operation.name();
        debug!(operation = name, "invoking operation");
        let task = self.spawn(async move { operation.execute(params).await });
        let outcome: Outcome<O::Output> = match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(AppError::from(err)),
            Err(err) => Err(join_failure(err, name)),
        };
        outcome.inspect_failure(|err| {
            warn!(operation = name, code = ?err.code(), error = %err, "operation failed");
        })
    }
}

type BoxedExecute<P, R> = Box<dyn Fn(P) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

pub struct FnOperation<P, R> {
    name: &'static str,
    execute: BoxedExecute<P, R>,
}

/// Builds an [`Operation`] from an async closure.
pub fn operation_fn<P, R, F, Fut>(name: &'static str, execute: F) -> Arc<FnOperation<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(FnOperation {
        name,
        execute: Box::new(move |params| execute(params).boxed()),
    })
}

#[async_trait]
impl<P, R> Operation for FnOperation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    type Params = P;
    type Output = R;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, params: P) -> anyhow::Result<R> {
        (self.execute)(params).await
    }
}

#[cfg(test)]
#[path = "tests/operation_tests.rs"]
mod tests;
