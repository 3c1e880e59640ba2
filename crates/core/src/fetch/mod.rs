//! Network fetching abstraction used for update checks and downloads.

mod http;

pub use http::{HttpFetcher, HttpFetcherFactory};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// HTTP method of a [`FetchRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    Post,
}

/// A single request to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Post,
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Errors from fetching.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Invalid URL {0}")]
    InvalidUrl(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),
}

/// One in-flight fetch.
#[async_trait]
pub trait Fetcher: Send {
    async fn fetch(self: Box<Self>) -> Result<FetchResponse, FetchError>;
}

/// Creates fetchers for requests.
pub trait FetcherFactory: Send + Sync {
    fn create_fetcher(&self, request: FetchRequest) -> Box<dyn Fetcher>;
}

/// Fetch `request` with a fresh fetcher from `factory`.
pub async fn fetch_with(
    factory: &dyn FetcherFactory,
    request: FetchRequest,
) -> Result<FetchResponse, FetchError> {
    factory.create_fetcher(request).fetch().await
}
