use crate::retry::RetryPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} retry policy needs at least one attempt")]
    ZeroAttempts(&'static str),
    #[error("{0} timeout must be positive")]
    ZeroTimeout(&'static str),
    #[error("cadence must be positive")]
    ZeroCadence,
    #[error("reminder lead time cannot be negative")]
    NegativeLead,
}

/// Réglages opérateur : relances, délais, cadence. Tous les champs ont une
/// valeur par défaut ; un fichier JSON partiel suffit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub load_retry: RetryPolicy,
    pub save_retry: RetryPolicy,
    pub send_retry: RetryPolicy,
    pub load_timeout_ms: u64,
    pub save_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Intervalle entre deux cycles en mode `serve`.
    pub cadence_secs: u64,
    pub reminder_lead_hours: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            load_retry: RetryPolicy::default(),
            save_retry: RetryPolicy::default(),
            send_retry: RetryPolicy {
                max_attempts: 4,
                ..RetryPolicy::default()
            },
            load_timeout_ms: 5_000,
            save_timeout_ms: 5_000,
            send_timeout_ms: 10_000,
            cadence_secs: 300,
            reminder_lead_hours: 24,
        }
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let settings: Settings = serde_json::from_slice(&data)
            .with_context(|| format!("parsing settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in [
            ("load", &self.load_retry),
            ("save", &self.save_retry),
            ("send", &self.send_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::ZeroAttempts(name));
            }
        }
        for (name, ms) in [
            ("load", self.load_timeout_ms),
            ("save", self.save_timeout_ms),
            ("send", self.send_timeout_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        if self.cadence_secs == 0 {
            return Err(ConfigError::ZeroCadence);
        }
        if self.reminder_lead_hours < 0 {
            return Err(ConfigError::NegativeLead);
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }
    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reminder_lead_hours)
    }
}
