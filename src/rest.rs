use crate::backoff::Backoff;
use crate::config::BackoffConfig;
use crate::error::{RecorderError, Result};
use crate::types::{RestDepthSnapshot, Snapshot};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// REST API client for depth snapshots
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    retry: BackoffConfig,
}

impl RestClient {
    /// Create a new REST client with custom base URL
    pub fn new(base_url: &str, retry: BackoffConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("depth-recorder/0.1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Retry policy for snapshot fetches: `attempts` tries in total
    pub fn default_retry(attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base_ms: 500,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: attempts.saturating_sub(1),
        }
    }

    /// Fetch a full-depth snapshot, retrying transient failures.
    ///
    /// The snapshot is stamped with the wall-clock time the successful
    /// response was received.
    pub async fn get_depth_snapshot(&self, symbol: &str, limit: u32) -> Result<Snapshot> {
        let mut backoff = Backoff::new(self.retry.clone());
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.fetch_depth(symbol, limit).await {
                Ok(body) => {
                    let snapshot = Snapshot::from_rest(symbol, body, chrono::Utc::now());
                    info!(
                        symbol,
                        last_update_id = snapshot.last_update_id,
                        bids = snapshot.bids.len(),
                        asks = snapshot.asks.len(),
                        attempts,
                        "Fetched depth snapshot"
                    );
                    return Ok(snapshot);
                }
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(symbol, attempt = attempts, error = %e, ?delay, "Snapshot fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(symbol, attempts, error = %e, "Snapshot fetch retries exhausted");
                        return Err(RecorderError::SnapshotFetch {
                            symbol: symbol.to_string(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    error!(symbol, attempts, error = %e, "Snapshot fetch failed");
                    return Err(RecorderError::SnapshotFetch {
                        symbol: symbol.to_string(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn fetch_depth(&self, symbol: &str, limit: u32) -> Result<RestDepthSnapshot> {
        let url = format!("{}/depth", self.base_url);
        debug!("Fetching depth snapshot for {} from {}", symbol, url);

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.to_uppercase()), ("limit", limit.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("HTTP {}: {}", status, error_text);
            // 429 and 418 are rate limiting, 5xx are server side: both worth retrying
            if status.is_server_error()
                || status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::IM_A_TEAPOT
            {
                return Err(RecorderError::ApiError(message));
            }
            return Err(RecorderError::Protocol(message));
        }

        let body: RestDepthSnapshot = response.json().await?;
        Ok(body)
    }
}
