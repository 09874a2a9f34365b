use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_core::{
    AppError, EventScope, JsonClient, Operation, Screen, ScreenEvent, StoreOperation,
    SynchronizedStore,
};
use futures::StreamExt;
use shared::{
    domain::{MediaDetail, MediaId, MediaSummary},
    protocol::{SearchRequest, SearchResponse},
};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogState {
    pub items: Vec<MediaSummary>,
    pub search_results: Vec<MediaSummary>,
    pub selected: Option<MediaDetail>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum CatalogEvent {
    Load,
    Refresh,
    Search(SearchRequest),
    Select(MediaId),
}

impl ScreenEvent for CatalogEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Load | Self::Refresh => "trending",
            Self::Search(_) => "search",
            Self::Select(_) => "detail",
        }
    }
}

pub struct SearchOperation {
    client: JsonClient,
}

#[async_trait]
impl Operation for SearchOperation {
    type Params = SearchRequest;
    type Output = SearchResponse;

    fn name(&self) -> &'static str {
        "search"
    }

    async fn execute(&self, request: SearchRequest) -> anyhow::Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(AppError::validation("search query must not be empty", Some("query")).into());
        }
        Ok(self.client.get("search/multi", &request.query_pairs()).await?)
    }
}

pub struct DetailOperation {
    client: JsonClient,
}

#[async_trait]
impl Operation for DetailOperation {
    type Params = MediaId;
    type Output = MediaDetail;

    fn name(&self) -> &'static str {
        "detail"
    }

    async fn execute(&self, id: MediaId) -> anyhow::Result<MediaDetail> {
        Ok(self.client.get(&format!("media/{}", id.0), &[]).await?)
    }
}

/// Trending list backed by the store, plus search and detail lookups.
pub struct CatalogScreen {
    trending: Arc<StoreOperation<Vec<MediaSummary>>>,
    search: Arc<SearchOperation>,
    detail: Arc<DetailOperation>,
}

impl CatalogScreen {
    pub fn new(trending: SynchronizedStore<Vec<MediaSummary>>, client: JsonClient) -> Self {
        Self {
            trending: StoreOperation::new(trending),
            search: Arc::new(SearchOperation {
                client: client.clone(),
            }),
            detail: Arc::new(DetailOperation { client }),
        }
    }
}

#[async_trait]
impl Screen for CatalogScreen {
    type State = CatalogState;
    type Event = CatalogEvent;

    fn initial_state(&self) -> CatalogState {
        CatalogState::default()
    }

    async fn handle_event(
        &self,
        event: CatalogEvent,
        scope: EventScope<CatalogState>,
    ) -> anyhow::Result<()> {
        match event {
            CatalogEvent::Load | CatalogEvent::Refresh => {
                let force_refresh = matches!(event, CatalogEvent::Refresh);
                let mut updates = scope.invoke_stream(Arc::clone(&self.trending), force_refresh);
                while let Some(update) = updates.next().await {
                    let items = update?;
                    info!(count = items.len(), force_refresh, "trending list updated");
                    scope.reduce(|state| CatalogState {
                        items,
                        last_refreshed: Some(Utc::now()),
                        ..state.clone()
                    });
                }
            }
            CatalogEvent::Search(request) => {
                let response = scope.invoke(Arc::clone(&self.search), request).await?;
                scope.reduce(|state| CatalogState {
                    search_results: response.results,
                    ..state.clone()
                });
            }
            CatalogEvent::Select(id) => {
                let detail = scope.invoke(Arc::clone(&self.detail), id).await?;
                scope.reduce(|state| CatalogState {
                    selected: Some(detail),
                    ..state.clone()
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use client_core::{BackgroundContext, Cache, Controller, ErrorCode, MemoryCache, Origin, Outcome};
    use shared::domain::MediaType;

    use super::*;

    struct FixedOrigin(Outcome<Vec<MediaSummary>>);

    #[async_trait]
    impl Origin<Vec<MediaSummary>> for FixedOrigin {
        async fn fetch(&self) -> Outcome<Vec<MediaSummary>> {
            self.0.clone()
        }
    }

    fn movie(id: i64, title: &str) -> MediaSummary {
        MediaSummary {
            id: MediaId(id),
            media_type: MediaType::Movie,
            title: title.to_string(),
            release_date: None,
            vote_average: None,
        }
    }

    fn controller(
        cache: MemoryCache<Vec<MediaSummary>>,
        origin: FixedOrigin,
    ) -> Controller<CatalogScreen> {
        let store = SynchronizedStore::new(
            "trending",
            Arc::new(cache) as Arc<dyn Cache<Vec<MediaSummary>>>,
            Arc::new(origin) as Arc<dyn Origin<Vec<MediaSummary>>>,
        );
        // Nothing listens on this port; only the trending store is exercised.
        let client = JsonClient::new("http://127.0.0.1:9/api/", Duration::from_millis(200))
            .expect("client");
        Controller::new(CatalogScreen::new(store, client), BackgroundContext::current())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_shows_cached_list_then_fresh_one() {
        let controller = controller(
            MemoryCache::with_value(vec![movie(1, "Heat")]),
            FixedOrigin(Ok(vec![movie(1, "Heat"), movie(2, "Ronin")])),
        );

        controller.dispatch(CatalogEvent::Load).expect("dispatched");
        controller.wait_idle().await;

        let state = controller.current_state();
        assert_eq!(state.items.len(), 2);
        assert!(state.last_refreshed.is_some());
        assert!(controller.error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_failure_keeps_listed_items() {
        let cache = MemoryCache::with_value(vec![movie(1, "Heat")]);
        let controller = controller(
            cache,
            FixedOrigin(Err(AppError::server(503, "catalog unavailable"))),
        );

        controller.dispatch(CatalogEvent::Load).expect("dispatched");
        controller.wait_idle().await;

        assert_eq!(controller.current_state().items, vec![movie(1, "Heat")]);
        assert_eq!(controller.error_message().as_deref(), Some("catalog unavailable"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blank_search_is_rejected_before_any_request() {
        let controller = controller(MemoryCache::new(), FixedOrigin(Ok(Vec::new())));

        controller
            .dispatch(CatalogEvent::Search(SearchRequest {
                query: "   ".into(),
                media_type: None,
            }))
            .expect("dispatched");
        controller.wait_idle().await;

        let err = controller.error().expect("validation error");
        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(controller.current_state().search_results.is_empty());
    }

    #[test]
    fn load_and_refresh_share_a_kind() {
        assert_eq!(CatalogEvent::Load.kind(), CatalogEvent::Refresh.kind());
        assert_ne!(CatalogEvent::Load.kind(), CatalogEvent::Select(MediaId(1)).kind());
    }
}
