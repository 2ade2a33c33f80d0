use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = concat!("location-enricher/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_CHECKPOINT_INTERVAL: usize = 10;
const DEFAULT_JITTER_RADIUS_KM: f64 = 35.0;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_country_codes: Option<String>,
    pub min_request_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub checkpoint_interval: usize,
    pub jitter_radius_km: f64,
    pub jitter_seed: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_country_codes: Option<String>,
    pub min_request_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub checkpoint_interval: usize,
    pub jitter_radius_km: f64,
    pub has_geocoder_api_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoder_endpoint: DEFAULT_ENDPOINT.to_string(),
            geocoder_user_agent: DEFAULT_USER_AGENT.to_string(),
            geocoder_api_key: None,
            geocoder_country_codes: Some("us".to_string()),
            min_request_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            jitter_radius_km: DEFAULT_JITTER_RADIUS_KM,
            jitter_seed: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            geocoder_endpoint: parse_string("GEOCODER_ENDPOINT")
                .unwrap_or(defaults.geocoder_endpoint),
            geocoder_user_agent: parse_string("GEOCODER_USER_AGENT")
                .unwrap_or(defaults.geocoder_user_agent),
            geocoder_api_key: parse_string("GEOCODER_API_KEY").map(SecretString::from),
            geocoder_country_codes: match env::var("GEOCODER_COUNTRY_CODES") {
                Ok(value) if value.trim().is_empty() => None,
                Ok(value) => Some(value.trim().to_string()),
                Err(_) => defaults.geocoder_country_codes,
            },
            min_request_interval_ms: parse_u64(
                "GEOCODER_MIN_INTERVAL_MS",
                DEFAULT_MIN_INTERVAL_MS,
            ),
            request_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS).max(1),
            max_attempts: parse_u32("GEOCODER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            backoff_base_ms: parse_u64("GEOCODER_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            checkpoint_interval: parse_usize("CHECKPOINT_INTERVAL", DEFAULT_CHECKPOINT_INTERVAL)
                .max(1),
            jitter_radius_km: parse_f64("JITTER_RADIUS_KM", DEFAULT_JITTER_RADIUS_KM).max(0.0),
            jitter_seed: env::var("JITTER_SEED")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok()),
        }
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            geocoder_country_codes: self.geocoder_country_codes.clone(),
            min_request_interval_ms: self.min_request_interval_ms,
            request_timeout_secs: self.request_timeout_secs,
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            checkpoint_interval: self.checkpoint_interval,
            jitter_radius_km: self.jitter_radius_km,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
