//! Authenticated client for the HSP opendata endpoints.
//!
//! One request is in flight at a time; a fresh uniform draw from the
//! configured interval separates consecutive requests, and retryable
//! failures back off exponentially with jitter.

pub mod error;
pub mod types;

pub use error::HspError;
pub use types::{
    DetailsQuery, MetricsQuery, ServiceDetailsResponse, ServiceMetricsResponse,
};

use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Credentials, HspConfig, RequestInterval, RetryConfig};

/// Bearer tokens are refreshed after this long even without a 401.
const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

struct Token {
    value: String,
    issued_at: Instant,
}

pub struct HspClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    interval: RequestInterval,
    retry: RetryConfig,
    token: Option<Token>,
    last_request: Option<Instant>,
    /// Set after the first successful call; gates the lazy re-auth path.
    had_success: bool,
}

impl HspClient {
    pub fn new(
        config: &HspConfig,
        credentials: Credentials,
        interval: RequestInterval,
        retry: RetryConfig,
    ) -> Result<Self, HspError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            interval,
            retry,
            token: None,
            last_request: None,
            had_success: false,
        })
    }

    /// Obtain a bearer token from POST /authenticate.
    pub async fn authenticate(&mut self) -> Result<(), HspError> {
        self.pace().await;
        let url = format!("{}/authenticate", self.base_url);
        let body = types::AuthRequest {
            username: &self.credentials.email,
            password: &self.credentials.password,
        };
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(HspError::from_status(status.as_u16(), &text, retry_after));
        }
        let auth: types::AuthResponse = response
            .json()
            .await
            .map_err(|e| HspError::Protocol(e.to_string()))?;
        self.token = Some(Token {
            value: auth.token,
            issued_at: Instant::now(),
        });
        info!("Authenticated with HSP service");
        Ok(())
    }

    pub async fn service_metrics(
        &mut self,
        query: &MetricsQuery,
    ) -> Result<ServiceMetricsResponse, HspError> {
        self.post_with_retry("/serviceMetrics", query).await
    }

    pub async fn service_details(
        &mut self,
        rid: &str,
    ) -> Result<ServiceDetailsResponse, HspError> {
        let query = DetailsQuery {
            rid: rid.to_string(),
        };
        self.post_with_retry("/serviceDetails", &query).await
    }

    /// POST with token management, pacing, and the retry policy.
    async fn post_with_retry<B, R>(&mut self, endpoint: &str, body: &B) -> Result<R, HspError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        if self.token_expired() {
            self.authenticate().await?;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.post_once(endpoint, body).await {
                Ok(result) => {
                    self.had_success = true;
                    if attempt > 0 {
                        info!(endpoint, attempt = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(result);
                }
                // A 401 after earlier success usually means the token aged
                // out server-side; refresh once and replay the request.
                Err(HspError::Authentication(status)) if self.had_success => {
                    warn!(status, "Token rejected, re-authenticating");
                    self.had_success = false;
                    self.token = None;
                    self.authenticate().await?;
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = match &err {
                        HspError::RateLimit {
                            retry_after: Some(hint),
                        } => *hint,
                        _ => self.backoff_delay(attempt),
                    };
                    warn!(
                        endpoint,
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_once<B, R>(&mut self, endpoint: &str, body: &B) -> Result<R, HspError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let token = self
            .token
            .as_ref()
            .ok_or(HspError::NotAuthenticated)?
            .value
            .clone();
        self.pace().await;
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, "HSP request");
        let response = self
            .http
            .post(&url)
            .header("X-Auth-Token", token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(HspError::from_status(status.as_u16(), &text, retry_after));
        }
        response
            .json()
            .await
            .map_err(|e| HspError::Protocol(e.to_string()))
    }

    fn token_expired(&self) -> bool {
        match &self.token {
            None => true,
            Some(token) => token.issued_at.elapsed() >= TOKEN_LIFETIME,
        }
    }

    /// Sleep until a fresh uniform draw from the interval has elapsed since
    /// the previous request.
    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let required = {
                let mut rng = rand::thread_rng();
                Duration::from_secs_f64(rng.gen_range(self.interval.min..=self.interval.max))
            };
            let elapsed = last.elapsed();
            if elapsed < required {
                let wait = required - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "Pacing upstream request");
                tokio::time::sleep(wait).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.initial_delay * self.retry.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.retry.max_delay);
        let jittered = if self.retry.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.retry.max_delay))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, HspConfig};

    fn test_client(retry: RetryConfig) -> HspClient {
        HspClient::new(
            &HspConfig::default(),
            Credentials {
                email: "test@example.com".into(),
                password: "secret".into(),
            },
            RequestInterval { min: 1.0, max: 3.0 },
            retry,
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_exponentially_within_cap() {
        let client = test_client(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(client.backoff_delay(0), Duration::from_secs_f64(1.0));
        assert_eq!(client.backoff_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(client.backoff_delay(2), Duration::from_secs_f64(4.0));
        // Capped at max_delay.
        assert_eq!(client.backoff_delay(10), Duration::from_secs_f64(30.0));
    }

    #[test]
    fn jittered_backoff_stays_in_band() {
        let client = test_client(RetryConfig::default());
        for attempt in 0..5 {
            let base = 1.0_f64 * 2.0_f64.powi(attempt).min(30.0);
            let delay = client.backoff_delay(attempt as u32).as_secs_f64();
            assert!(delay >= base * 0.5 - 1e-9, "delay {delay} below jitter band");
            assert!(delay <= 30.0 + 1e-9, "delay {delay} above max_delay");
        }
    }

    #[test]
    fn fresh_client_has_no_token() {
        let client = test_client(RetryConfig::default());
        assert!(client.token_expired());
    }
}
