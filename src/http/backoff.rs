//! Retrying GET with client-side throttling and GitHub-aware rate limiting

use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use crate::config::Settings;
use crate::{Error, Result};
use super::{agents, HttpResponse, Transport};

/// Waits longer than this get a visible countdown instead of a silent sleep.
const COUNTDOWN_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Throttle: at most this many attempts per second (0 disables)
    pub requests_per_second: f64,
    /// First retry delay, doubled after every failed attempt
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
    /// Upper bound of the random extra delay added to every retry wait
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            base_delay: Duration::from_secs(1),
            max_retries: 5,
            max_backoff: Duration::from_secs(60),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            requests_per_second: settings.requests_per_second,
            base_delay: Duration::from_secs_f64(settings.base_delay_secs.max(0.0)),
            max_retries: settings.max_retries,
            max_backoff: Duration::from_secs_f64(settings.max_backoff_secs.max(0.0)),
            ..Self::default()
        }
    }

    /// No waiting at all (tests, local files)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            requests_per_second: 0.0,
            base_delay: Duration::ZERO,
            max_retries,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn throttle(&self) -> Duration {
        if self.requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.requests_per_second)
        } else {
            Duration::ZERO
        }
    }

    fn jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..=self.jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// How long to wait after a 403/429. Honors `X-RateLimit-Reset` when the
/// quota is exhausted, otherwise falls back to the current backoff delay.
pub fn rate_limit_wait(response: &HttpResponse, delay: Duration, max_backoff: Duration, now_epoch: i64) -> Duration {
    let remaining = response.header("x-ratelimit-remaining").unwrap_or("1");
    let reset = response
        .header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<f64>().ok());

    match reset {
        Some(reset) if remaining.trim() == "0" => {
            Duration::from_secs_f64((reset - now_epoch as f64).max(0.0))
        }
        _ => delay.min(max_backoff),
    }
}

/// GET client shared by every external API.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    default_headers: Vec<(String, String)>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Self {
        Self {
            transport,
            policy,
            default_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_bearer_token(self, token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => self.with_header("Authorization", &format!("Bearer {}", token)),
            _ => self,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = self.default_headers.clone();
        headers.push(("User-Agent".to_string(), agents::random_user_agent().to_string()));
        headers
    }

    /// GET `url` with retry and exponential backoff.
    ///
    /// Returns successful responses and terminal misses (404/410/451);
    /// everything else is retried until `max_retries` attempts are spent.
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        let mut delay = self.policy.base_delay;
        let mut last_error: Option<Error> = None;
        let attempts = self.policy.max_retries.max(1);

        for attempt in 1..=attempts {
            pause(self.policy.throttle(), "Throttling").await;

            let wait = match self.transport.get(url, &self.headers()).await {
                Ok(response) if response.is_success() || response.is_missing() => return Ok(response),
                Ok(response) if response.is_rate_limited() => {
                    let now = chrono::Utc::now().timestamp();
                    let wait = rate_limit_wait(&response, delay, self.policy.max_backoff, now);
                    tracing::warn!("Rate limited on {} (attempt {}/{}), waiting {:.0?}", url, attempt, attempts, wait);
                    last_error = Some(Error::RateLimited(url.to_string()));
                    wait
                }
                Ok(response) => {
                    tracing::debug!("GET {} returned {} (attempt {}/{})", url, response.status, attempt, attempts);
                    last_error = Some(Error::Status { status: response.status, url: url.to_string() });
                    delay.min(self.policy.max_backoff)
                }
                Err(e) => {
                    tracing::debug!("GET {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                    last_error = Some(e);
                    delay.min(self.policy.max_backoff)
                }
            };

            if attempt < attempts {
                pause(wait + self.policy.jitter(), "Waiting").await;
            }
            delay *= 2;
        }

        Err(last_error.unwrap_or_else(|| Error::Http(format!("Unknown error fetching {}", url))))
    }

    /// GET and decode JSON; `Ok(None)` for terminal misses.
    pub async fn get_json(&self, url: &str) -> Result<Option<serde_json::Value>> {
        let response = self.get(url).await?;
        if response.is_missing() {
            return Ok(None);
        }
        Ok(Some(response.json()?))
    }
}

async fn pause(duration: Duration, label: &str) {
    if duration.is_zero() {
        return;
    }
    if duration >= COUNTDOWN_THRESHOLD {
        crate::ui::countdown(duration, label).await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;

    const URL: &str = "https://api.github.com/repos/a/b";

    #[tokio::test]
    async fn test_success_first_try() {
        let transport = Arc::new(ScriptedTransport::new().route_json(URL, serde_json::json!({"ok": true})));
        let client = ApiClient::new(transport.clone(), BackoffPolicy::immediate(5));

        let value = client.get_json(URL).await.unwrap().unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(transport.hits(URL), 1);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(URL, HttpResponse::new(502, "bad gateway"))
                .route(URL, HttpResponse::new(429, ""))
                .route(URL, HttpResponse::new(200, "[]")),
        );
        let client = ApiClient::new(transport.clone(), BackoffPolicy::immediate(5));

        let response = client.get(URL).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.hits(URL), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let transport = Arc::new(ScriptedTransport::new().route(URL, HttpResponse::new(500, "")));
        let client = ApiClient::new(transport.clone(), BackoffPolicy::immediate(3));

        let err = client.get(URL).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }));
        assert_eq!(transport.hits(URL), 3);
    }

    #[tokio::test]
    async fn test_missing_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = ApiClient::new(transport.clone(), BackoffPolicy::immediate(5));

        assert!(client.get_json(URL).await.unwrap().is_none());
        assert_eq!(transport.hits(URL), 1);
    }

    #[tokio::test]
    async fn test_sends_auth_and_user_agent() {
        let transport = Arc::new(ScriptedTransport::new().route_json(URL, serde_json::json!({})));
        let client = ApiClient::new(transport.clone(), BackoffPolicy::immediate(1))
            .with_header("Accept", "application/vnd.github+json")
            .with_bearer_token(Some("secret"));

        client.get(URL).await.unwrap();
        let requests = transport.requests.lock().unwrap();
        let headers = &requests[0].1;
        assert!(headers.contains(&("Authorization".to_string(), "Bearer secret".to_string())));
        assert!(headers.iter().any(|(k, v)| k == "User-Agent" && agents::USER_AGENTS.contains(&v.as_str())));
    }

    #[test]
    fn test_rate_limit_wait_uses_reset_header() {
        let response = HttpResponse::new(403, "")
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", "1030");
        let wait = rate_limit_wait(&response, Duration::from_secs(2), Duration::from_secs(60), 1000);
        assert_eq!(wait, Duration::from_secs(30));

        // Reset already passed
        let wait = rate_limit_wait(&response, Duration::from_secs(2), Duration::from_secs(60), 2000);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_rate_limit_wait_falls_back_to_delay() {
        let response = HttpResponse::new(429, "").with_header("X-RateLimit-Remaining", "12");
        let wait = rate_limit_wait(&response, Duration::from_secs(128), Duration::from_secs(60), 0);
        assert_eq!(wait, Duration::from_secs(60));
    }
}
