//! Mock fetcher factory for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, FetcherFactory};

/// Canned answer to a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// HTTP 200 with this body.
    Data(Vec<u8>),
    /// Any status with this body.
    Status(u16, Vec<u8>),
    /// A network error.
    Error(String),
    /// Never completes.
    Hang,
}

impl MockResponse {
    pub fn data(body: Vec<u8>) -> Self {
        MockResponse::Data(body)
    }

    pub fn status(status: u16, body: Vec<u8>) -> Self {
        MockResponse::Status(status, body)
    }

    pub fn error(message: impl Into<String>) -> Self {
        MockResponse::Error(message.into())
    }
}

/// Mock implementation of the FetcherFactory trait.
///
/// Every request gets the response routed for its URL, or the default
/// response. Clones share the request log.
///
/// # Example
///
/// ```rust,ignore
/// use keystone_core::testing::{MockFetcherFactory, MockResponse};
///
/// let fetchers = MockFetcherFactory::always_fail_with_error("offline")
///     .with_route("https://x.example.com/check", MockResponse::data(body));
///
/// // Run a check...
///
/// let requests = fetchers.recorded_requests().await;
/// assert_eq!(requests[0].url, "https://x.example.com/check");
/// ```
#[derive(Debug, Clone)]
pub struct MockFetcherFactory {
    /// Response for URLs without a route.
    default: MockResponse,
    /// Per-URL responses.
    routes: Arc<HashMap<String, MockResponse>>,
    /// Requests in the order they were fetched.
    requests: Arc<RwLock<Vec<FetchRequest>>>,
}

impl MockFetcherFactory {
    fn with_default(default: MockResponse) -> Self {
        Self {
            default,
            routes: Arc::new(HashMap::new()),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Answer every request with HTTP 200 and `body`.
    pub fn always_finish_with_data(body: Vec<u8>) -> Self {
        Self::with_default(MockResponse::Data(body))
    }

    /// Fail every request with a network error.
    pub fn always_fail_with_error(message: &str) -> Self {
        Self::with_default(MockResponse::error(message))
    }

    /// Answer every request with `status` and `body`.
    pub fn always_finish_with_status(status: u16, body: Vec<u8>) -> Self {
        Self::with_default(MockResponse::Status(status, body))
    }

    /// Never answer.
    pub fn always_hang() -> Self {
        Self::with_default(MockResponse::Hang)
    }

    /// Answer requests for `url` with `response` instead of the default.
    pub fn with_route(mut self, url: impl Into<String>, response: MockResponse) -> Self {
        Arc::make_mut(&mut self.routes).insert(url.into(), response);
        self
    }

    /// Get all fetched requests.
    pub async fn recorded_requests(&self) -> Vec<FetchRequest> {
        self.requests.read().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Clear the request log.
    pub async fn clear_recorded(&self) {
        self.requests.write().await.clear();
    }

    fn response_for(&self, url: &str) -> MockResponse {
        self.routes.get(url).unwrap_or(&self.default).clone()
    }
}

impl FetcherFactory for MockFetcherFactory {
    fn create_fetcher(&self, request: FetchRequest) -> Box<dyn Fetcher> {
        Box::new(MockFetcher {
            response: self.response_for(&request.url),
            request,
            requests: Arc::clone(&self.requests),
        })
    }
}

struct MockFetcher {
    request: FetchRequest,
    response: MockResponse,
    requests: Arc<RwLock<Vec<FetchRequest>>>,
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(self: Box<Self>) -> Result<FetchResponse, FetchError> {
        let MockFetcher {
            request,
            response,
            requests,
        } = *self;
        let url = request.url.clone();
        requests.write().await.push(request);

        match response {
            MockResponse::Data(body) => Ok(FetchResponse {
                url,
                status: 200,
                body,
            }),
            MockResponse::Status(status, body) => Ok(FetchResponse { url, status, body }),
            MockResponse::Error(message) => Err(FetchError::Network(message)),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}
