use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::config::HttpSettings;

/// Source of remote asset bytes. Implementations must be shareable across the worker pool.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Attempt limit and linear backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            retry_delay_ms: settings.retry_delay_ms,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (zero-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt) + 1))
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted.
/// The error of the final attempt is returned.
pub fn with_retries<T, F>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None::<anyhow::Error>;
    for attempt in 0..attempts {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt + 1 < attempts {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        target_url = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "fetch failed; retrying"
                    );
                    sleep(delay);
                }
                last_error = Some(error);
            }
        }
    }
    match last_error {
        Some(error) => Err(error),
        None => bail!("no attempts made for {label}"),
    }
}

/// Blocking HTTP fetcher for CDN assets.
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build asset HTTP client")?;
        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
        })
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "fetching asset");
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .header("Accept", "image/*,*/*;q=0.8")
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while fetching {}", status.as_u16(), url);
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read response body from {url}"))?;
        if bytes.is_empty() {
            bail!("empty response body from {url}");
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            retry_delay_ms: 0,
        }
    }

    #[test]
    fn delay_scales_linearly() {
        let policy = RetryPolicy {
            attempts: 3,
            retry_delay_ms: 2000,
        };
        assert_eq!(policy.delay_after(0), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(4000));
    }

    #[test]
    fn always_failing_operation_runs_exactly_attempts_times() {
        let calls = Cell::new(0u32);
        let result: Result<()> = with_retries(&policy(3), "https://cdn.example/a.png", |attempt| {
            calls.set(calls.get() + 1);
            bail!("boom {attempt}")
        });
        assert_eq!(calls.get(), 3);
        assert_eq!(result.expect_err("must fail").to_string(), "boom 2");
    }

    #[test]
    fn success_stops_retrying() {
        let calls = Cell::new(0u32);
        let value = with_retries(&policy(5), "x", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 1 {
                bail!("transient");
            }
            Ok(attempt)
        })
        .expect("success");
        assert_eq!(value, 1);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let calls = Cell::new(0u32);
        let _ = with_retries(&policy(0), "x", |_| -> Result<()> {
            calls.set(calls.get() + 1);
            bail!("nope")
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_policy_uses_settings() {
        let settings = HttpSettings {
            user_agent: "test".to_string(),
            timeout_ms: 10,
            attempts: 0,
            retry_delay_ms: 7,
            workers: 1,
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.retry_delay_ms, 7);
        assert!(HttpFetcher::new(&settings).is_ok());
    }
}
