//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with proper user agent strings
//! - Holding a rate limiter permit for the whole of every request
//! - Following redirects one permitted hop at a time
//! - Classifying outcomes as success, transient or permanent failure

use crate::config::{CrawlerConfig, UserAgentConfig};
use crate::crawler::rate_limiter::{Permit, RateLimiter};
use crate::{CorpusError, FetchError};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, LOCATION};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Redirect hops followed before a fetch gives up
const MAX_REDIRECTS: usize = 10;

/// Raw content of a fetched page
#[derive(Debug, Clone)]
pub struct RawPage {
    /// URL that was requested
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub status_code: u16,
    pub body: String,
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - The user agent configuration
/// * `crawler` - Crawler settings (timeout and optional cookie)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(CorpusError)` - Failed to build client or the cookie is not a valid header
///
/// # Example
///
/// ```no_run
/// use sumi_corpus::config::{CrawlerConfig, UserAgentConfig};
/// use sumi_corpus::crawler::build_http_client;
///
/// let user_agent = UserAgentConfig {
///     crawler_name: "SumiCorpus".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&user_agent, &CrawlerConfig::default()).unwrap();
/// ```
pub fn build_http_client(
    user_agent: &UserAgentConfig,
    crawler: &CrawlerConfig,
) -> Result<Client, CorpusError> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = &crawler.cookie {
        let value = HeaderValue::from_str(cookie).map_err(|e| {
            CorpusError::Config(crate::ConfigError::Validation(format!(
                "cookie is not a valid header value: {}",
                e
            )))
        })?;
        headers.insert(COOKIE, value);
    }

    let client = Client::builder()
        .user_agent(user_agent.header_value())
        .default_headers(headers)
        .timeout(Duration::from_secs(crawler.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::none()) // Followed in `Fetcher::fetch` under the rate limiter
        .gzip(true)
        .brotli(true)
        .build()?;

    Ok(client)
}

/// Outcome of a single request
enum Response {
    Page(RawPage),
    Redirect(String),
}

/// Fetches pages under the global request budget
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl Fetcher {
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self { client, limiter }
    }

    /// Fetches one URL, following redirects hop by hop
    ///
    /// Every request (each redirect hop and each retry) takes its own permit,
    /// held until that response has been read, so all of them spend budget.
    ///
    /// # Classification
    ///
    /// | Condition | Result |
    /// |-----------|--------|
    /// | 2xx with a body | `RawPage` |
    /// | 2xx with an empty body | Transient |
    /// | 429, 5xx | Transient |
    /// | 403, 404, 410, other 4xx | Permanent |
    /// | Redirect loop, more than 10 hops, no `Location` | Permanent |
    /// | Timeout, connect error, reset | Transient |
    pub async fn fetch(&self, url: &str) -> Result<RawPage, FetchError> {
        let mut current = url.to_string();
        let mut visited = HashSet::new();

        for _ in 0..=MAX_REDIRECTS {
            visited.insert(current.clone());

            let permit = self.permit(&current).await?;
            let result = self.send(url, &current).await;
            self.limiter.release(permit);

            match result? {
                Response::Page(page) => return Ok(page),
                Response::Redirect(next) => {
                    if visited.contains(&next) {
                        return Err(FetchError::Permanent {
                            url: url.to_string(),
                            reason: format!("redirect loop at {}", next),
                        });
                    }
                    tracing::debug!("Following redirect {} -> {}", current, next);
                    current = next;
                }
            }
        }

        Err(FetchError::Permanent {
            url: url.to_string(),
            reason: format!("more than {} redirects", MAX_REDIRECTS),
        })
    }

    async fn permit(&self, target: &str) -> Result<Permit, FetchError> {
        match self.limiter.try_acquire() {
            Ok(permit) => Ok(permit),
            Err(_) => {
                tracing::trace!("Request budget exhausted, waiting to fetch {}", target);
                self.limiter
                    .acquire()
                    .await
                    .map_err(|e| FetchError::Transient {
                        url: target.to_string(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Issues one request for `current` on behalf of the task URL `url`
    async fn send(&self, url: &str, current: &str) -> Result<Response, FetchError> {
        let response = self
            .client
            .get(current)
            .send()
            .await
            .map_err(|e| classify_transport_error(url, &e))?;

        let status = response.status();

        if status.is_redirection() {
            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| Url::parse(current).ok()?.join(location).ok());
            return match next {
                Some(next) => Ok(Response::Redirect(next.to_string())),
                None => Err(FetchError::Permanent {
                    url: url.to_string(),
                    reason: format!("HTTP {} without a usable Location", status.as_u16()),
                }),
            };
        }

        if let Some(error) = classify_status(url, status) {
            return Err(error);
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(url, &e))?;

        if body.trim().is_empty() {
            return Err(FetchError::Transient {
                url: url.to_string(),
                reason: format!("HTTP {} with empty body", status.as_u16()),
            });
        }

        tracing::debug!("Fetched {} ({} bytes)", current, body.len());

        Ok(Response::Page(RawPage {
            url: url.to_string(),
            final_url: current.to_string(),
            status_code: status.as_u16(),
            body,
        }))
    }
}

/// Maps a non-success status to its failure class
pub fn classify_status(url: &str, status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }

    let reason = format!("HTTP {}", status.as_u16());
    let url = url.to_string();

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(FetchError::Transient { url, reason })
    } else {
        Some(FetchError::Permanent { url, reason })
    }
}

fn classify_transport_error(url: &str, error: &reqwest::Error) -> FetchError {
    let reason = if error.is_timeout() {
        "request timeout".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.to_string()
    };

    // A redirect loop or a malformed URL will not heal on retry
    if error.is_redirect() || error.is_builder() {
        FetchError::Permanent {
            url: url.to_string(),
            reason,
        }
    } else {
        FetchError::Transient {
            url: url.to_string(),
            reason,
        }
    }
}
