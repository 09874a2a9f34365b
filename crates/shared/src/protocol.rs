use serde::{Deserialize, Serialize};

use crate::domain::{MediaSummary, MediaType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
}

impl SearchRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("query", self.query.clone())];
        if let Some(media_type) = self.media_type {
            pairs.push(("media_type", media_type.as_query_value().to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default = "first_page")]
    pub page: u32,
    pub results: Vec<MediaSummary>,
    #[serde(default)]
    pub total_results: u64,
}

fn first_page() -> u32 {
    1
}

/// Body returned by the catalog API alongside a non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    #[serde(default)]
    pub status_message: Option<String>,
}
