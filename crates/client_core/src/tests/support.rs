use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use shared::{AppError, Outcome};
use tokio::sync::{oneshot, Semaphore};

use crate::{cache::Cache, origin::Origin};

struct Scripted<T> {
    outcome: Outcome<T>,
    gate: Option<Arc<Semaphore>>,
}

/// Origin replaying queued outcomes in call order. A gated outcome is held
/// until a permit is added to its semaphore.
pub struct ScriptedOrigin<T> {
    script: Mutex<VecDeque<Scripted<T>>>,
    fallback: Option<Outcome<T>>,
    calls: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> ScriptedOrigin<T> {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(outcome: Outcome<T>) -> Self {
        Self {
            fallback: Some(outcome),
            ..Self::new()
        }
    }

    pub fn push(&self, outcome: Outcome<T>) {
        self.script.lock().expect("script").push_back(Scripted { outcome, gate: None });
    }

    pub fn push_gated(&self, outcome: Outcome<T>, gate: Arc<Semaphore>) {
        self.script.lock().expect("script").push_back(Scripted {
            outcome,
            gate: Some(gate),
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Origin<T> for ScriptedOrigin<T> {
    async fn fetch(&self) -> Outcome<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script").pop_front();
        let Some(scripted) = next else {
            return self
                .fallback
                .clone()
                .unwrap_or_else(|| Err(AppError::unknown("origin script exhausted")));
        };
        if let Some(gate) = scripted.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        scripted.outcome
    }
}

/// Cache whose reads or writes fail on demand.
pub struct FaultyCache {
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub snapshot: Option<Vec<String>>,
}

#[async_trait]
impl Cache<Vec<String>> for FaultyCache {
    fn observe(&self) -> BoxStream<'static, anyhow::Result<Option<Vec<String>>>> {
        if self.fail_reads {
            stream::once(async { Err(anyhow::anyhow!("cache table is corrupt")) }).boxed()
        } else {
            stream::iter(vec![Ok::<_, anyhow::Error>(self.snapshot.clone())])
                .chain(stream::pending())
                .boxed()
        }
    }

    async fn write(&self, _value: Vec<String>) -> anyhow::Result<()> {
        if self.fail_writes {
            anyhow::bail!("disk quota exceeded");
        }
        Ok(())
    }
}

/// Cache that serves one snapshot and then loses its connection.
pub struct FlakyCache {
    pub snapshot: Vec<String>,
}

#[async_trait]
impl Cache<Vec<String>> for FlakyCache {
    fn observe(&self) -> BoxStream<'static, anyhow::Result<Option<Vec<String>>>> {
        stream::iter(vec![
            Ok(Some(self.snapshot.clone())),
            Err(anyhow::anyhow!("cache connection lost")),
        ])
        .chain(stream::pending())
        .boxed()
    }

    async fn write(&self, _value: Vec<String>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fires when dropped; used to observe that aborted work was torn down.
pub struct DropSignal(Option<oneshot::Sender<()>>);

impl DropSignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }
}

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
