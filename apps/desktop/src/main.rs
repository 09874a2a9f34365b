mod catalog;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, BackgroundContext, Cache, Controller, HttpOrigin, JsonClient, Origin,
    SynchronizedStore,
};
use shared::{
    domain::{MediaId, MediaSummary, MediaType},
    protocol::SearchRequest,
};
use storage::{prepare_database_url, Storage};
use tracing::{error, info};

use crate::catalog::{CatalogEvent, CatalogScreen, CatalogState};

#[derive(Parser, Debug)]
#[command(about = "Browse the media catalog through the local cache")]
struct Args {
    /// Settings file; `client.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip the cached list and go straight to the origin.
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    search: Option<String>,
    #[arg(long, value_parser = parse_media_type)]
    media_type: Option<MediaType>,
    /// Show details for one catalog id.
    #[arg(long)]
    select: Option<i64>,
}

fn parse_media_type(raw: &str) -> Result<MediaType, String> {
    MediaType::parse(raw).ok_or_else(|| format!("unknown media type '{raw}' (movie, tv, person)"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let database_url = prepare_database_url(&settings.cache_database_url)?;

    let workers = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.worker_threads)
        .thread_name("catalog-worker")
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;
    let background = BackgroundContext::from_handle(workers.handle().clone())
        .with_stream_buffer(settings.stream_buffer);

    // The pool's maintenance tasks belong on the worker runtime that runs the queries.
    let storage = workers
        .spawn({
            let database_url = database_url.clone();
            async move { Storage::new(&database_url).await }
        })
        .await
        .context("cache database task failed")?
        .map_err(|error| {
            error!(%database_url, error = %error, "failed to open cache database");
            error
        })?;
    info!(%database_url, origin = %settings.origin_base_url, "catalog client ready");

    let client = JsonClient::new(&settings.origin_base_url, settings.request_timeout())?;
    let store = SynchronizedStore::new(
        "trending",
        Arc::new(storage.cache::<Vec<MediaSummary>>("trending"))
            as Arc<dyn Cache<Vec<MediaSummary>>>,
        Arc::new(HttpOrigin::new(client.clone(), "trending"))
            as Arc<dyn Origin<Vec<MediaSummary>>>,
    );
    let controller = Controller::new(CatalogScreen::new(store, client), background);

    let mut events = vec![if args.refresh {
        CatalogEvent::Refresh
    } else {
        CatalogEvent::Load
    }];
    if let Some(query) = args.search {
        events.push(CatalogEvent::Search(SearchRequest {
            query,
            media_type: args.media_type,
        }));
    }
    if let Some(id) = args.select {
        events.push(CatalogEvent::Select(MediaId(id)));
    }

    for event in events {
        run_until_idle(&controller, event).await;
    }

    controller.close();
    drop(controller);
    workers.shutdown_background();
    Ok(())
}

/// Dispatches one event and prints every state it produces until loading ends.
async fn run_until_idle(controller: &Controller<CatalogScreen>, event: CatalogEvent) {
    let label = format!("{event:?}");
    let mut states = controller.state();
    states.borrow_and_update();
    let mut loading = controller.loading();

    if controller.dispatch(event).is_none() {
        return;
    }
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                print_state(&state);
            }
            _ = loading.wait_for(|loading| !*loading) => break,
        }
    }
    if states.has_changed().unwrap_or(false) {
        let state = states.borrow_and_update().clone();
        print_state(&state);
    }

    match controller.error() {
        Some(err) => eprintln!("{label} failed ({:?}): {err}", err.code()),
        None => println!("{label} done"),
    }
}

fn print_state(state: &CatalogState) {
    if let Some(refreshed) = state.last_refreshed {
        println!(
            "trending ({} items, refreshed {}):",
            state.items.len(),
            refreshed.format("%H:%M:%S")
        );
    }
    for item in &state.items {
        println!("  {}", describe(item));
    }
    if !state.search_results.is_empty() {
        println!("search results:");
        for item in &state.search_results {
            println!("  {}", describe(item));
        }
    }
    if let Some(detail) = &state.selected {
        println!("selected: {}", describe(&detail.summary));
        if let Some(runtime) = detail.runtime_minutes {
            println!("  runtime: {runtime} min");
        }
        if let Some(overview) = &detail.overview {
            println!("  {overview}");
        }
    }
}

fn describe(item: &MediaSummary) -> String {
    let year = item
        .release_date
        .map(|date| date.format(" (%Y)").to_string())
        .unwrap_or_default();
    let rating = item
        .vote_average
        .map(|vote| format!(" {vote:.1}/10"))
        .unwrap_or_default();
    format!(
        "#{} [{}] {}{year}{rating}",
        item.id.0,
        item.media_type.as_query_value(),
        item.title
    )
}
