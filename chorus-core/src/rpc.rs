//! JSON RPC helper with deadlines and jittered exponential backoff.
//!
//! All inter-node traffic goes through here so retry behavior is uniform:
//! transient transport failures are retried until the caller's deadline,
//! protocol-level outcomes (NACKs, redirects) are returned to the caller.

use std::time::{Duration, Instant};

use error_stack::{Report, ResultExt};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::RpcError;

/// Configuration for exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Backoff duration for a given retry count, jittered to 50%-150%.
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Shared HTTP client for cluster RPCs.
#[derive(Clone, Default)]
pub struct RpcClient {
    http: reqwest::Client,
    backoff: BackoffConfig,
}

impl RpcClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// POST a JSON body and parse the JSON response, regardless of HTTP
    /// status (protocol outcomes ride on non-2xx statuses too).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] if the request does not complete within `timeout`
    /// or the body cannot be parsed.
    pub async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, Report<RpcError>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .change_context(RpcError)
            .attach_printable_lazy(|| format!("POST {url}"))?;

        response
            .json()
            .await
            .change_context(RpcError)
            .attach_printable_lazy(|| format!("POST {url}: invalid response body"))
    }

    /// GET a JSON resource.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] on transport failure, non-success status, or an
    /// unparseable body.
    pub async fn get_json<T>(&self, url: &str, timeout: Duration) -> Result<T, Report<RpcError>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .change_context(RpcError)
            .attach_printable_lazy(|| format!("GET {url}"))?
            .error_for_status()
            .change_context(RpcError)?;

        response
            .json()
            .await
            .change_context(RpcError)
            .attach_printable_lazy(|| format!("GET {url}: invalid response body"))
    }

    /// POST with retries until `deadline`. Each attempt gets `per_try`,
    /// clamped to the time remaining; attempts are spaced by jittered
    /// exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the last transport error once the deadline is exhausted.
    pub async fn post_json_retry<B, T>(
        &self,
        url: &str,
        body: &B,
        per_try: Duration,
        deadline: Instant,
    ) -> Result<T, Report<RpcError>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut retries = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Report::new(RpcError).attach_printable(format!("POST {url}: deadline expired")));
            }

            match self.post_json(url, body, per_try.min(remaining)).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let pause = {
                        let mut rng = rand::rng();
                        self.backoff.duration(retries, &mut rng)
                    };
                    if Instant::now() + pause >= deadline {
                        return Err(error);
                    }
                    trace!(url, retries, ?pause, "rpc failed, backing off");
                    retries += 1;
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        let first = config.duration(0, &mut rng);
        assert!(first >= Duration::from_millis(10));
        assert!(first <= Duration::from_millis(30));

        // Far past the cap: jitter bounds the result to 0.5x-1.5x of max.
        let late = config.duration(20, &mut rng);
        assert!(late >= Duration::from_millis(500));
        assert!(late <= Duration::from_millis(1500));
    }
}
