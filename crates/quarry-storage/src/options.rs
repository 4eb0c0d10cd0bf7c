//! Store configuration.
//!
//! [`StoreOptions`] carries every tunable of a store. All fields have
//! defaults, so a partial JSON document or an empty environment yields a
//! working configuration.
//!
//! Environment variables read by [`StoreOptions::from_env`]:
//! - `QUARRY_SENSITIVE_LOGGING`: log SQL parameter values (`true`/`1`)
//! - `QUARRY_MAX_BATCH_SIZE`: commands per batch
//! - `QUARRY_RETRY_MAX_ATTEMPTS`: store-creation attempt budget
//! - `QUARRY_RETRY_BASE_DELAY_MS`: first backoff delay

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default store-creation attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
/// Default number of commands sent in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 42;

/// Retry budget and backoff for transient errors during store creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// A config that retries `max_attempts` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryConfig {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    ///
    /// `min(max_delay, base_delay * 2^retry)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponential = self.base_delay_ms.saturating_mul(1u64 << retry.min(31));
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }
}

/// Configuration for a data store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Include parameter values in SQL log events.
    #[serde(default)]
    pub sensitive_data_logging: bool,
    /// Maximum number of commands in one batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// In-memory stores share the database they were opened with when set;
    /// otherwise each store gets a private database.
    #[serde(default = "default_true")]
    pub persist_in_memory: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            sensitive_data_logging: false,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry: RetryConfig::default(),
            persist_in_memory: true,
        }
    }
}

impl StoreOptions {
    /// Reads options from `QUARRY_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = StoreOptions::default();
        if let Some(v) = lookup("QUARRY_SENSITIVE_LOGGING") {
            options.sensitive_data_logging = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(n) = lookup("QUARRY_MAX_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            options.max_batch_size = n;
        }
        if let Some(n) = lookup("QUARRY_RETRY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            options.retry.max_attempts = n;
        }
        if let Some(n) = lookup("QUARRY_RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            options.retry.base_delay_ms = n;
        }
        options
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }
}
