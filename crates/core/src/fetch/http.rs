//! reqwest-backed fetcher.

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::debug;

use super::{FetchError, FetchMethod, FetchRequest, FetchResponse, Fetcher, FetcherFactory};
use crate::config::HttpConfig;

/// Creates [`HttpFetcher`]s sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpFetcherFactory {
    client: Client,
}

impl HttpFetcherFactory {
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn create_fetcher(&self, request: FetchRequest) -> Box<dyn Fetcher> {
        Box::new(HttpFetcher {
            client: self.client.clone(),
            request,
        })
    }
}

/// Performs one request with reqwest.
pub struct HttpFetcher {
    client: Client,
    request: FetchRequest,
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(self: Box<Self>) -> Result<FetchResponse, FetchError> {
        let url = reqwest::Url::parse(&self.request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", self.request.url, e)))?;
        let method = match self.request.method {
            FetchMethod::Get => Method::GET,
            FetchMethod::Post => Method::POST,
        };

        debug!(url = %url, method = %method, "Fetching");
        let mut builder = self.client.request(method, url);
        for (name, value) in &self.request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = self.request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.bytes().await.map_err(map_error)?;

        debug!(url = %url, status, bytes = body.len(), "Fetched");
        Ok(FetchResponse {
            url,
            status,
            body: body.to_vec(),
        })
    }
}

fn map_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}
