//! Rate-limited HTTP client used by the static scrape strategy.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, header};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::retry::{RetryPolicy, with_retry};

/// A cookie-keeping client that never exceeds its request quota and keeps a
/// fixed gap between consecutive requests.
pub struct PoliteClient {
    client: Client,
    limiter: DefaultDirectRateLimiter,
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
    retry: RetryPolicy,
    user_agent: String,
}

impl PoliteClient {
    pub fn new(config: &ScrapeConfig) -> Result<Self, ScrapeError> {
        // Cookie store so warm-up requests can establish a session.
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &ScrapeConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            client,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            min_delay: Duration::from_millis(config.min_delay_ms),
            last_request: Mutex::new(None),
            retry: config.retry_policy(),
            user_agent: config.user_agent.clone(),
        }
    }

    async fn pace(&self) {
        self.limiter.until_ready().await;
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_delay;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET a page as text, retrying transient failures.
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        self.get_text_with(url, &[], None).await
    }

    pub async fn get_text_with(
        &self,
        url: &str,
        query: &[(&str, &str)],
        accept: Option<&str>,
    ) -> Result<String, ScrapeError> {
        with_retry(&self.retry, url, |attempt| async move {
            self.pace().await;
            debug!(url, attempt, "GET");
            let mut request = self
                .client
                .get(url)
                .header(header::USER_AGENT, self.user_agent.as_str())
                .header(header::ACCEPT_LANGUAGE, "en-GB,en;q=0.9");
            if let Some(accept) = accept {
                request = request.header(header::ACCEPT, accept);
            }
            if !query.is_empty() {
                request = request.query(query);
            }
            let resp = request.send().await?.error_for_status()?;
            Ok(resp.text().await?)
        })
        .await
    }
}

/// Resolves `href` against `base` the way listing pages use relative links.
pub fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    let base = base.trim_end_matches('/');
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{}", rest)
    } else if href.starts_with('/') {
        let origin = origin_of(base);
        format!("{}{}", origin, href)
    } else {
        format!("{}/{}", base, href)
    }
}

fn origin_of(url: &str) -> &str {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(slash) => &url[..after_scheme + slash],
        None => url,
    }
}
