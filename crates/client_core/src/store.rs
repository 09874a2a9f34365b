use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_stream::stream;
use futures::{stream::BoxStream, StreamExt};
use shared::{AppError, Outcome};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{cache::Cache, origin::Origin, stream_operation::StreamOperation};

/// Reconciles a local cache with a remote origin for one resource.
///
/// `get_data` emits cached snapshots first (unless forced), then exactly one
/// terminal envelope from a single origin fetch. A successful fetch is
/// written to the cache before it is emitted.
pub struct SynchronizedStore<T> {
    name: &'static str,
    cache: Arc<dyn Cache<T>>,
    origin: Arc<dyn Origin<T>>,
    writes: Arc<WriteOrder>,
}

impl<T> Clone for SynchronizedStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            cache: Arc::clone(&self.cache),
            origin: Arc::clone(&self.origin),
            writes: Arc::clone(&self.writes),
        }
    }
}

/// Orders cache writes by the moment each fetch started, so a slow fetch
/// never overwrites a value from a fetch that began after it.
struct WriteOrder {
    next_ticket: AtomicU64,
    last_written: Mutex<u64>,
}

impl WriteOrder {
    fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(1),
            last_written: Mutex::new(0),
        }
    }

    fn issue(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_if_newest<T>(&self, ticket: u64, cache: &dyn Cache<T>, value: T) -> anyhow::Result<bool> {
        let mut last_written = self.last_written.lock().await;
        if ticket < *last_written {
            return Ok(false);
        }
        cache.write(value).await?;
        *last_written = ticket;
        Ok(true)
    }
}

enum Step<T> {
    Fetched(Outcome<T>),
    Cached(Option<anyhow::Result<Option<T>>>),
}

impl<T> SynchronizedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, cache: Arc<dyn Cache<T>>, origin: Arc<dyn Origin<T>>) -> Self {
        Self {
            name,
            cache,
            origin,
            writes: Arc::new(WriteOrder::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get_data(&self, force_refresh: bool) -> BoxStream<'static, Outcome<T>> {
        let name = self.name;
        let cache = Arc::clone(&self.cache);
        let origin = Arc::clone(&self.origin);
        let writes = Arc::clone(&self.writes);

        stream! {
            let (ticket, fetched) = if force_refresh {
                debug!(store = name, "forced refresh, skipping cache");
                let ticket = writes.issue();
                (ticket, origin.fetch().await)
            } else {
                let mut updates = cache.observe();
                match updates.next().await {
                    Some(Ok(Some(snapshot))) => yield Ok(snapshot),
                    Some(Ok(None)) | None => debug!(store = name, "cache empty"),
                    Some(Err(err)) => {
                        yield Err(cache_fault(err));
                        return;
                    }
                }

                let ticket = writes.issue();
                let mut fetch = origin.fetch();
                let mut watching = true;
                let fetched = loop {
                    let step = tokio::select! {
                        biased;
                        result = &mut fetch => Step::Fetched(result),
                        update = updates.next(), if watching => Step::Cached(update),
                    };
                    match step {
                        Step::Fetched(result) => break result,
                        Step::Cached(Some(Ok(Some(snapshot)))) => yield Ok(snapshot),
                        Step::Cached(Some(Ok(None))) => {}
                        Step::Cached(Some(Err(err))) => {
                            yield Err(cache_fault(err));
                            return;
                        }
                        Step::Cached(None) => watching = false,
                    }
                };
                (ticket, fetched)
            };

            match fetched {
                Ok(value) => {
                    match writes.write_if_newest(ticket, cache.as_ref(), value.clone()).await {
                        Ok(true) => debug!(store = name, ticket, "cache updated from origin"),
                        Ok(false) => debug!(store = name, ticket, "newer fetch already written, skipping cache write"),
                        Err(err) => {
                            let err = cache_fault(err);
                            warn!(store = name, error = %err, "cache write failed");
                            yield Err(err);
                            return;
                        }
                    }
                    yield Ok(value);
                }
                Err(err) => {
                    warn!(store = name, code = ?err.code(), error = %err, "origin fetch failed");
                    yield Err(err);
                }
            }
        }
        .boxed()
    }
}

fn cache_fault(err: anyhow::Error) -> AppError {
    match AppError::from(err) {
        AppError::Unknown { message, .. } => AppError::cache(message),
        classified => classified,
    }
}

/// Exposes a store as a [`StreamOperation`] whose parameter is the
/// force-refresh flag.
pub struct StoreOperation<T> {
    store: SynchronizedStore<T>,
}

impl<T> StoreOperation<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(store: SynchronizedStore<T>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

impl<T> StreamOperation for StoreOperation<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Params = bool;
    type Output = T;

    fn name(&self) -> &'static str {
        self.store.name
    }

    fn execute(&self, force_refresh: bool) -> BoxStream<'static, anyhow::Result<T>> {
        self.store
            .get_data(force_refresh)
            .map(|outcome| outcome.map_err(anyhow::Error::from))
            .boxed()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
