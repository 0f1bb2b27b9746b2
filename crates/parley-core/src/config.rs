//! Core configuration loaded from environment variables.
//!
//! Every setting has a default so the core starts with zero configuration.

use std::path::PathBuf;

use chrono::Duration;

use parley_shared::constants::TIMESTAMP_MARKER_GAP_SECS;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite database file.
    /// Env: `PARLEY_DB_PATH`
    /// Default: `None`, meaning the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Capacity of every broadcast channel (conversation events, payment
    /// notifications).
    /// Env: `PARLEY_EVENT_CAPACITY`
    /// Default: `256`
    pub event_capacity: usize,

    /// Gap after which a timestamp marker precedes a new message.
    /// Env: `PARLEY_TIMESTAMP_GAP_SECS`
    /// Default: 15 minutes.
    pub timestamp_gap: Duration,

    /// Whether failed payments are published as notifications.
    /// Env: `PARLEY_NOTIFY_PAYMENT_FAILURES` (true/false)
    /// Default: `true`
    pub notify_payment_failures: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            event_capacity: 256,
            timestamp_gap: Duration::seconds(TIMESTAMP_MARKER_GAP_SECS),
            notify_payment_failures: true,
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("PARLEY_EVENT_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_EVENT_CAPACITY, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_TIMESTAMP_GAP_SECS") {
            match val.parse::<i64>() {
                Ok(secs) if secs >= 0 => config.timestamp_gap = Duration::seconds(secs),
                _ => tracing::warn!(value = %val, "Invalid PARLEY_TIMESTAMP_GAP_SECS, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_NOTIFY_PAYMENT_FAILURES") {
            config.notify_payment_failures = val != "false" && val != "0";
        }

        config
    }
}
