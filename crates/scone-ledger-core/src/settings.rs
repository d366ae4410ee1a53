use anyhow::{bail, Context, Result};
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::dedup::DuplicatePolicy;
use crate::ledger::QuotaPolicy;

/// Environment-driven configuration for the ledger, poller and notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSettings {
    pub db_path: PathBuf,
    pub notify_threshold: f64,
    pub duplicate_policy: DuplicatePolicy,
    pub scan_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub poll_timeout: Duration,
    pub webhook_url: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub quota_limit: u32,
    pub quota_window: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(Self::DEFAULT_DB),
            notify_threshold: Self::DEFAULT_THRESHOLD,
            duplicate_policy: DuplicatePolicy::default(),
            scan_endpoint: None,
            api_key: None,
            poll_timeout: Duration::from_secs(30),
            webhook_url: None,
            artifacts_dir: None,
            quota_limit: 100,
            quota_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl LedgerSettings {
    pub const DB_ENV: &'static str = "SCONE_LEDGER_DB";
    pub const THRESHOLD_ENV: &'static str = "SCONE_LEDGER_NOTIFY_THRESHOLD";
    pub const POLICY_ENV: &'static str = "SCONE_LEDGER_DUPLICATE_POLICY";
    pub const ENDPOINT_ENV: &'static str = "SCONE_LEDGER_SCAN_ENDPOINT";
    pub const API_KEY_ENV: &'static str = "SCONE_LEDGER_API_KEY";
    pub const POLL_TIMEOUT_ENV: &'static str = "SCONE_LEDGER_POLL_TIMEOUT";
    pub const WEBHOOK_ENV: &'static str = "SCONE_LEDGER_WEBHOOK_URL";
    pub const ARTIFACTS_ENV: &'static str = "SCONE_LEDGER_ARTIFACTS_DIR";
    pub const QUOTA_LIMIT_ENV: &'static str = "SCONE_LEDGER_QUOTA_LIMIT";
    pub const QUOTA_WINDOW_ENV: &'static str = "SCONE_LEDGER_QUOTA_WINDOW";

    pub const DEFAULT_DB: &'static str = "scone-ledger.db";
    pub const DEFAULT_THRESHOLD: f64 = 0.70;

    /// Load settings from environment variables.
    ///
    /// * `SCONE_LEDGER_DB` — SQLite database path (default: `scone-ledger.db`).
    /// * `SCONE_LEDGER_NOTIFY_THRESHOLD` — minimum confidence to alert (default: `0.70`).
    /// * `SCONE_LEDGER_DUPLICATE_POLICY` — `first-report-wins` or `upgrade[:gain]`.
    /// * `SCONE_LEDGER_SCAN_ENDPOINT` / `SCONE_LEDGER_API_KEY` — scanning service.
    /// * `SCONE_LEDGER_POLL_TIMEOUT` — humantime duration (default: `30s`).
    /// * `SCONE_LEDGER_QUOTA_LIMIT` / `SCONE_LEDGER_QUOTA_WINDOW` — session quota
    ///   (default: 100 per `24h`; whole seconds only).
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let value = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let db_path = value(Self::DB_ENV)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let notify_threshold = match value(Self::THRESHOLD_ENV) {
            Some(raw) => {
                let threshold: f64 = raw.parse().with_context(|| {
                    format!("{} must be a number (got `{raw}`)", Self::THRESHOLD_ENV)
                })?;
                if !(0.0..=1.0).contains(&threshold) {
                    bail!(
                        "{} must be within 0.0..=1.0 (got {threshold})",
                        Self::THRESHOLD_ENV
                    );
                }
                threshold
            }
            None => defaults.notify_threshold,
        };
        let duplicate_policy = value(Self::POLICY_ENV)
            .map(|raw| raw.parse::<DuplicatePolicy>())
            .transpose()
            .with_context(|| format!("invalid {}", Self::POLICY_ENV))?
            .unwrap_or_default();
        let poll_timeout = value(Self::POLL_TIMEOUT_ENV)
            .map(|raw| humantime::parse_duration(&raw))
            .transpose()
            .with_context(|| format!("invalid {}", Self::POLL_TIMEOUT_ENV))?
            .unwrap_or(defaults.poll_timeout);
        let quota_limit = value(Self::QUOTA_LIMIT_ENV)
            .map(|raw| raw.parse::<u32>())
            .transpose()
            .with_context(|| format!("invalid {}", Self::QUOTA_LIMIT_ENV))?
            .unwrap_or(defaults.quota_limit);
        let quota_window = value(Self::QUOTA_WINDOW_ENV)
            .map(|raw| humantime::parse_duration(&raw))
            .transpose()
            .with_context(|| format!("invalid {}", Self::QUOTA_WINDOW_ENV))?
            .unwrap_or(defaults.quota_window);
        if quota_window.as_secs() == 0 || quota_window.subsec_nanos() != 0 {
            bail!(
                "{} must be a whole number of seconds, at least 1s (got {})",
                Self::QUOTA_WINDOW_ENV,
                humantime::format_duration(quota_window)
            );
        }

        Ok(Self {
            db_path,
            notify_threshold,
            duplicate_policy,
            scan_endpoint: value(Self::ENDPOINT_ENV),
            api_key: value(Self::API_KEY_ENV),
            poll_timeout,
            webhook_url: value(Self::WEBHOOK_ENV),
            artifacts_dir: value(Self::ARTIFACTS_ENV).map(PathBuf::from),
            quota_limit,
            quota_window,
        })
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            name: QuotaPolicy::SESSIONS.to_string(),
            limit: self.quota_limit,
            window: self.quota_window,
        }
    }
}
