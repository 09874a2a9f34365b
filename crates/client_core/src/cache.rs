use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Local cache collaborator for one resource.
#[async_trait]
pub trait Cache<T>: Send + Sync {
    /// Emits the current snapshot immediately and then again on every change.
    /// `None` means nothing is cached.
    fn observe(&self) -> BoxStream<'static, anyhow::Result<Option<T>>>;

    async fn write(&self, value: T) -> anyhow::Result<()>;
}

/// Process-local cache backed by a `watch` channel. Intermediate values may
/// be coalesced when observers are slower than writers.
pub struct MemoryCache<T> {
    current: watch::Sender<Option<T>>,
}

impl<T> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn with_value(value: T) -> Self {
        let (current, _) = watch::channel(Some(value));
        Self { current }
    }

    pub fn snapshot(&self) -> Option<T> {
        self.current.borrow().clone()
    }

    pub fn clear(&self) {
        self.current.send_replace(None);
    }

    pub fn observer_count(&self) -> usize {
        self.current.receiver_count()
    }
}

impl<T> Default for MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Cache<T> for MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn observe(&self) -> BoxStream<'static, anyhow::Result<Option<T>>> {
        WatchStream::new(self.current.subscribe()).map(Ok).boxed()
    }

    async fn write(&self, value: T) -> anyhow::Result<()> {
        self.current.send_replace(Some(value));
        Ok(())
    }
}
