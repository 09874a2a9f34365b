use std::{marker::PhantomData, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use shared::{protocol::ApiFailure, AppError, Outcome};
use tracing::debug;
use url::Url;

/// Remote source of truth for one resource.
#[async_trait]
pub trait Origin<T>: Send + Sync {
    async fn fetch(&self) -> Outcome<T>;
}

/// JSON-over-HTTP client shared by origins and single-shot operations.
#[derive(Clone)]
pub struct JsonClient {
    http: Client,
    base_url: Url,
}

impl JsonClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid origin base url '{base_url}'"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("origin base url must start with http:// or https://");
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Outcome<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| AppError::validation(format!("invalid endpoint '{path}': {err}"), Some("path")))
    }

    pub async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Outcome<R> {
        let url = self.endpoint(path)?;
        debug!(%url, "origin request");
        let response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiFailure>(&body)
                .ok()
                .and_then(|failure| failure.status_message)
                .unwrap_or_else(|| format!("{} returned {status}", url.path()));
            return Err(classify_status(status, message));
        }

        let bytes = response.bytes().await.map_err(classify_transport_error)?;
        serde_json::from_slice(&bytes).map_err(AppError::from)
    }
}

pub fn classify_status(status: StatusCode, message: String) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED => AppError::authentication(message),
        StatusCode::FORBIDDEN => AppError::permission(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AppError::timeout(message),
        status => AppError::server(status.as_u16(), message),
    }
}

pub fn classify_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::timeout(err.to_string())
    } else if err.is_decode() {
        AppError::Codec {
            message: err.to_string(),
            format: Some("json".to_string()),
        }
    } else if let Some(status) = err.status() {
        classify_status(status, err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        AppError::network(err.to_string())
    } else {
        AppError::unknown(err.to_string())
    }
}

/// Origin fetching one JSON resource from a fixed endpoint.
pub struct HttpOrigin<T> {
    client: JsonClient,
    path: String,
    query: Vec<(&'static str, String)>,
    _resource: PhantomData<fn() -> T>,
}

impl<T> HttpOrigin<T> {
    pub fn new(client: JsonClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            query: Vec::new(),
            _resource: PhantomData,
        }
    }

    pub fn with_query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }
}

#[async_trait]
impl<T> Origin<T> for HttpOrigin<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(&self) -> Outcome<T> {
        self.client.get(&self.path, &self.query).await
    }
}

#[cfg(test)]
#[path = "tests/origin_tests.rs"]
mod tests;
