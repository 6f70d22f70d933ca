// ABOUTME: Dual-protocol readiness prober for sandbox health endpoints
// ABOUTME: Retries secure and plain candidate URLs, preferring secure when both answer

use crate::error::Result;
use crate::types::ReadinessResult;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_ATTEMPTS: u32 = 30;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
// Each probe carries its own short timeout, independent of the retry budget
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes candidate public URLs for a serving `/health` endpoint.
///
/// Sandbox TLS termination commonly uses a self-signed certificate, so
/// certificate validation is disabled for the probe client. The prober
/// never fails hard: an exhausted retry budget yields a negative
/// [`ReadinessResult`], and the caller proceeds without a readiness
/// guarantee.
pub struct ReadinessProber {
    client: Client,
    attempts: u32,
    retry_delay: Duration,
}

impl ReadinessProber {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Shrink (or grow) the retry budget; tests use a small one
    pub fn with_budget(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// One GET against `<url>/health`; any transport error counts as down
    pub async fn check(&self, url: &str) -> bool {
        let health = format!("{}/health", url.trim_end_matches('/'));
        match self.client.get(&health).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Probe of {} failed: {}", health, e);
                false
            }
        }
    }

    /// Probe both candidates once. The secure candidate is canonical when
    /// both answer; `plain_url = None` means plain probing is disabled.
    pub async fn probe_once(&self, secure_url: &str, plain_url: Option<&str>) -> ReadinessResult {
        let secure_ok = self.check(secure_url).await;
        let plain_ok = match plain_url {
            Some(url) => self.check(url).await,
            None => false,
        };

        let healthy_url = if secure_ok {
            Some(secure_url.to_string())
        } else if plain_ok {
            plain_url.map(|u| u.to_string())
        } else {
            None
        };

        ReadinessResult {
            secure_ok,
            plain_ok,
            healthy_url,
        }
    }

    /// Retry until a candidate answers or the budget is spent
    pub async fn wait_until_ready(
        &self,
        secure_url: &str,
        plain_url: Option<&str>,
    ) -> ReadinessResult {
        for attempt in 1..=self.attempts {
            let result = self.probe_once(secure_url, plain_url).await;
            if result.any_ok() {
                info!(
                    "Health check passed on attempt {}/{} ({})",
                    attempt,
                    self.attempts,
                    result.healthy_url.as_deref().unwrap_or("?")
                );
                return result;
            }
            debug!("Health check attempt {}/{} failed", attempt, self.attempts);
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        warn!(
            "No candidate URL became healthy within {} attempts",
            self.attempts
        );
        ReadinessResult::unreachable()
    }
}
