use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, ProviderError};
use crate::record::Coordinate;

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// The one capability the pipeline needs from a geocoding service.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// `Ok(None)` means the service answered and found nothing.
    async fn resolve(&self, query: &str) -> Result<Option<Coordinate>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Match(Coordinate),
    NoMatch,
    /// Every attempt hit a timeout or transient fault.
    Exhausted { attempts: u32 },
}

impl GeocodeOutcome {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            GeocodeOutcome::Match(coord) => Some(*coord),
            _ => None,
        }
    }
}

/// Throttled, retrying front for a [`GeocodeProvider`]. All calls funnel
/// through one rate limiter regardless of tier or record.
pub struct GeocodeClient {
    provider: Arc<dyn GeocodeProvider>,
    rate_limiter: RateLimiter,
    call_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    jitter_rng: Mutex<StdRng>,
    calls: AtomicU64,
}

impl GeocodeClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let provider = NominatimProvider::new(config)?;
        Ok(Self::with_provider(Arc::new(provider), config))
    }

    pub fn with_provider(provider: Arc<dyn GeocodeProvider>, config: &AppConfig) -> Self {
        Self {
            provider,
            rate_limiter: RateLimiter::new(config.min_request_interval()),
            call_timeout: config.request_timeout(),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
            calls: AtomicU64::new(0),
        }
    }

    /// Number of provider calls issued so far, retries included.
    pub fn calls_made(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves one query. Timeouts and transient faults are retried with
    /// backoff and end in `Exhausted`; any other provider error is returned.
    pub async fn resolve(&self, query: &str) -> AppResult<GeocodeOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            trace!(query, attempt, "geocode request");

            let result = match timeout(self.call_timeout, self.provider.resolve(query)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            match result {
                Ok(Some(coordinate)) if coordinate.is_valid() => {
                    return Ok(GeocodeOutcome::Match(coordinate));
                }
                Ok(Some(coordinate)) => {
                    warn!(query, %coordinate, "provider returned an unusable coordinate");
                    return Ok(GeocodeOutcome::NoMatch);
                }
                Ok(None) => return Ok(GeocodeOutcome::NoMatch),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ?err,
                        query, attempt, "geocode lookup failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    warn!(?err, query, attempt, "geocode retries exhausted");
                    return Ok(GeocodeOutcome::Exhausted { attempts: attempt });
                }
                Err(err) => return Err(AppError::from(err)),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.backoff_base * (1 << exponent);
        let base_ms = self.backoff_base.as_millis() as u64;
        if base_ms == 0 {
            return base;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..base_ms);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Enforces a minimum spacing between the starts of consecutive calls.
struct RateLimiter {
    interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Nominatim-compatible search endpoint
/// (`GET ?q=..&format=json&limit=1`).
pub struct NominatimProvider {
    http: Client,
    endpoint: String,
    country_codes: Option<String>,
    api_key: Option<SecretString>,
}

impl NominatimProvider {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| AppError::Config(format!("failed to build geocoder client: {err}")))?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            country_codes: config.geocoder_country_codes.clone(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    async fn resolve(&self, query: &str) -> Result<Option<Coordinate>, ProviderError> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: Degrees,
            lon: Degrees,
        }

        // Nominatim sends strings; some mirrors send numbers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Degrees {
            Text(String),
            Number(f64),
        }

        impl Degrees {
            fn value(&self) -> Option<f64> {
                match self {
                    Degrees::Text(text) => text.trim().parse().ok(),
                    Degrees::Number(value) => Some(*value),
                }
            }
        }

        let mut params: Vec<(&str, &str)> = vec![("q", query), ("format", "json"), ("limit", "1")];
        if let Some(codes) = self.country_codes.as_deref() {
            params.push(("countrycodes", codes));
        }
        if let Some(key) = self.api_key.as_ref() {
            params.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let hits: Vec<SearchHit> = response.json().await?;

        let Some(hit) = hits.into_iter().next() else {
            debug!(query, "geocoder returned no candidates");
            return Ok(None);
        };
        match (hit.lat.value(), hit.lon.value()) {
            (Some(lat), Some(lng)) => Ok(Some(Coordinate::new(lat, lng))),
            _ => Err(ProviderError::Unexpected(format!(
                "unparsable coordinate in response for {query}"
            ))),
        }
    }
}
