use std::time::Duration;

use super::*;

async fn next_snapshot<T>(updates: &mut BoxStream<'static, Result<Option<T>>>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("cache notification in time")
        .expect("observer still open")
        .expect("cache read")
}

fn titles(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage
        .cache::<Vec<String>>("trending")
        .write(titles(&["Heat"]))
        .await
        .expect("write");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn entries_survive_reopening_a_file_database() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let database_url = prepare_database_url(&temp_root.path().join("cache.db").to_string_lossy())
        .expect("database url");

    let storage = Storage::new(&database_url).await.expect("db");
    storage
        .cache::<Vec<String>>("trending")
        .write(titles(&["Heat", "Ronin"]))
        .await
        .expect("write");
    storage.pool().close().await;

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let cache = reopened.cache::<Vec<String>>("trending");
    assert_eq!(cache.read().await.expect("read"), Some(titles(&["Heat", "Ronin"])));
    assert!(cache.updated_at().await.expect("timestamp").is_some());
    assert_eq!(reopened.resource_keys().await.expect("keys"), vec!["trending"]);
}

#[tokio::test]
async fn observe_emits_current_row_then_every_write() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let cache = storage.cache::<Vec<String>>("trending");
    let mut updates = cache.observe();

    assert_eq!(next_snapshot(&mut updates).await, None);

    cache.write(titles(&["Heat"])).await.expect("write");
    assert_eq!(next_snapshot(&mut updates).await, Some(titles(&["Heat"])));

    // A second handle over the same key notifies the same observers.
    let other_handle = storage.cache::<Vec<String>>("trending");
    other_handle.write(titles(&["Ronin"])).await.expect("write");
    assert_eq!(next_snapshot(&mut updates).await, Some(titles(&["Ronin"])));
}

#[tokio::test]
async fn writes_to_other_keys_are_not_forwarded() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let trending = storage.cache::<Vec<String>>("trending");
    let popular = storage.cache::<Vec<String>>("popular");
    let mut updates = trending.observe();
    assert_eq!(next_snapshot(&mut updates).await, None);

    popular.write(titles(&["Alien"])).await.expect("write popular");
    trending.write(titles(&["Heat"])).await.expect("write trending");

    assert_eq!(next_snapshot(&mut updates).await, Some(titles(&["Heat"])));
    assert_eq!(popular.read().await.expect("read"), Some(titles(&["Alien"])));
}

#[tokio::test]
async fn remove_notifies_observers_with_empty_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let cache = storage.cache::<Vec<String>>("trending");
    cache.write(titles(&["Heat"])).await.expect("write");

    let mut updates = cache.observe();
    assert_eq!(next_snapshot(&mut updates).await, Some(titles(&["Heat"])));

    assert!(cache.remove().await.expect("remove"));
    assert_eq!(next_snapshot(&mut updates).await, None);
    assert!(!cache.remove().await.expect("second remove"));
    assert!(cache.updated_at().await.expect("timestamp").is_none());
}

#[tokio::test]
async fn undecodable_row_is_a_read_fault() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .cache::<String>("trending")
        .write("not a list".to_string())
        .await
        .expect("write");

    let mut updates = storage.cache::<Vec<u32>>("trending").observe();
    let first = updates.next().await.expect("first item");
    let err = first.expect_err("decode failure");
    assert!(format!("{err:#}").contains("unreadable"), "{err:#}");
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/cache.db"),
        "sqlite://./data/cache.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data\\cache.db"),
        "sqlite://data/cache.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("  "),
        ClientSettings::default().cache_database_url
    );
}

#[test]
fn memory_urls_have_no_parent_directory() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert!(sqlite_path("sqlite://file:catalog?mode=memory&cache=shared").is_none());
    assert_eq!(
        sqlite_path("sqlite://./data/cache.db?mode=rwc"),
        Some(PathBuf::from("./data/cache.db"))
    );
}

#[test]
fn prepare_creates_parent_directory() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("data").join("cache.db");

    let database_url = prepare_database_url(&db_path.to_string_lossy()).expect("prepare db url");
    assert!(database_url.starts_with("sqlite://"));
    assert!(temp_root.path().join("data").exists());
}
