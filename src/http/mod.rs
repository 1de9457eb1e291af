//! HTTP plumbing shared by the GitHub, coverage and dashboard clients.
//!
//! Every request goes through a [`Transport`] so the retry logic can be
//! exercised without touching the network.

pub mod agents;
pub mod backoff;

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use crate::{Error, Result};

pub use backoff::{ApiClient, BackoffPolicy};

/// Per-request timeout of the production transport
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A fully buffered HTTP response. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: HashMap::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Gone for good: retrying will not help.
    pub fn is_missing(&self) -> bool {
        matches!(self.status, 404 | 410 | 451)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.status, 403 | 429)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// Production transport backed by `reqwest`
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("GET {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("Failed to read body of {}: {}", url, e)))?
            .to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for unit tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves canned responses by exact URL; each URL may queue several
    /// responses which are consumed in order (the last one repeats).
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
        pub requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(self, url: &str, response: HttpResponse) -> Self {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
            self
        }

        pub fn route_json(self, url: &str, body: serde_json::Value) -> Self {
            self.route(url, HttpResponse::new(200, body.to_string()))
        }

        pub fn hits(&self, url: &str) -> usize {
            self.requests.lock().unwrap().iter().filter(|(u, _)| u == url).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push((url.to_string(), headers.to_vec()));
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
                Some(queue) => Ok(queue.front().cloned().unwrap()),
                None => Ok(HttpResponse::new(404, "{\"message\":\"Not Found\"}")),
            }
        }
    }
}
