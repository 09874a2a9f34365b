use std::{
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_core::{Cache, ClientSettings};
use futures::{stream::BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const CHANGE_BUFFER: usize = 64;

/// SQLite database holding cached resources, one row per resource key.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<String>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid cache database url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to an in-memory database sees its own empty
        // database, so those pools keep exactly one connection alive.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open cache database '{database_url}'"))?;

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let storage = Self { pool, changes };
        storage.ensure_cache_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Typed cache over the row stored under `resource_key`.
    pub fn cache<T>(&self, resource_key: impl Into<String>) -> SqliteCache<T> {
        SqliteCache {
            storage: self.clone(),
            key: resource_key.into(),
            _resource: PhantomData,
        }
    }

    pub async fn resource_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT resource_key FROM cache_entries ORDER BY resource_key")
            .fetch_all(&self.pool)
            .await
            .context("failed to list cached resources")?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("resource_key").map_err(Into::into))
            .collect()
    }

    async fn ensure_cache_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                resource_key TEXT PRIMARY KEY NOT NULL,
                payload      TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure cache_entries table exists")?;
        Ok(())
    }

    fn notify(&self, resource_key: &str) {
        // No receivers just means nobody is observing right now.
        let _ = self.changes.send(resource_key.to_string());
    }
}

/// `Cache` implementation persisting one JSON-encoded resource in SQLite.
///
/// Observers get the stored row first and a fresh read after every write or
/// removal of the same key, whichever handle performed it.
pub struct SqliteCache<T> {
    storage: Storage,
    key: String,
    _resource: PhantomData<fn() -> T>,
}

impl<T> Clone for SqliteCache<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            key: self.key.clone(),
            _resource: PhantomData,
        }
    }
}

impl<T> SqliteCache<T>
where
    T: DeserializeOwned,
{
    pub fn resource_key(&self) -> &str {
        &self.key
    }

    pub async fn read(&self) -> Result<Option<T>> {
        read_entry(&self.storage.pool, &self.key).await
    }

    pub async fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT updated_at FROM cache_entries WHERE resource_key = ?")
            .bind(&self.key)
            .fetch_optional(&self.storage.pool)
            .await
            .with_context(|| format!("failed to read timestamp for '{}'", self.key))?;
        row.map(|row| row.try_get::<DateTime<Utc>, _>("updated_at"))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn remove(&self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE resource_key = ?")
            .bind(&self.key)
            .execute(&self.storage.pool)
            .await
            .with_context(|| format!("failed to remove cached '{}'", self.key))?;
        let removed = result.rows_affected() > 0;
        if removed {
            self.storage.notify(&self.key);
        }
        Ok(removed)
    }
}

#[async_trait]
impl<T> Cache<T> for SqliteCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn observe(&self) -> BoxStream<'static, Result<Option<T>>> {
        let pool = self.storage.pool.clone();
        let key = self.key.clone();
        // Subscribe before the first read so a write landing in between is
        // still seen.
        let mut changes = self.storage.changes.subscribe();
        let updates = async_stream::try_stream! {
            yield read_entry::<T>(&pool, &key).await?;
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == key => {
                        yield read_entry::<T>(&pool, &key).await?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(resource = %key, skipped, "cache observer lagged; re-reading");
                        yield read_entry::<T>(&pool, &key).await?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        updates.boxed()
    }

    async fn write(&self, value: T) -> Result<()> {
        let payload = serde_json::to_string(&value)
            .with_context(|| format!("failed to encode '{}' for the cache", self.key))?;
        sqlx::query(
            "INSERT INTO cache_entries (resource_key, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(resource_key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(&self.key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.storage.pool)
        .await
        .with_context(|| format!("failed to write cached '{}'", self.key))?;
        debug!(resource = %self.key, "cache entry written");
        self.storage.notify(&self.key);
        Ok(())
    }
}

async fn read_entry<T: DeserializeOwned>(pool: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let row = sqlx::query("SELECT payload FROM cache_entries WHERE resource_key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to read cached '{key}'"))?;
    let Some(row) = row else {
        return Ok(None);
    };
    let payload: String = row.try_get("payload")?;
    match serde_json::from_str(&payload) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            warn!(resource = %key, error = %err, "cached payload no longer decodes");
            Err(anyhow::Error::new(err).context(format!("cached '{key}' is unreadable")))
        }
    }
}

/// Normalizes a configured cache location into a `sqlite://` URL and makes
/// sure its parent directory exists.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    format!("sqlite://{path}")
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
