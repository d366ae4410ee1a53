use std::{fmt, str::FromStr, sync::Arc};

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::ledger::{
    Acceptance, Finding, Fingerprint, FingerprintRecord, FingerprintStore, LedgerError,
};

/// What to do when a duplicate arrives with a higher confidence than the stored first report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The first accepted report is kept as-is.
    #[default]
    FirstReportWins,
    /// Raise the stored confidence when a duplicate beats it by at least `min_gain`.
    /// The duplicate is still reported as `Duplicate` and never re-notifies.
    UpgradeConfidence { min_gain: f64 },
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstReportWins => f.write_str("first-report-wins"),
            Self::UpgradeConfidence { min_gain } => write!(f, "upgrade:{min_gain}"),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = anyhow::Error;

    /// Accepts `first-report-wins`, `upgrade` or `upgrade:<min_gain>`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.split_once(':') {
            None if raw == "first-report-wins" || raw == "first" => Ok(Self::FirstReportWins),
            None if raw == "upgrade" => Ok(Self::UpgradeConfidence { min_gain: 0.0 }),
            Some(("upgrade", gain)) => {
                let min_gain: f64 = gain
                    .parse()
                    .with_context(|| format!("invalid confidence gain `{gain}`"))?;
                if !(0.0..=1.0).contains(&min_gain) {
                    return Err(anyhow!(
                        "confidence gain must be within 0.0..=1.0 (got {min_gain})"
                    ));
                }
                Ok(Self::UpgradeConfidence { min_gain })
            }
            _ => Err(anyhow!(
                "unknown duplicate policy `{raw}` (expected first-report-wins or upgrade[:gain])"
            )),
        }
    }
}

/// Rejects repeat reports of the same real-world issue.
pub struct Deduplicator<S: FingerprintStore + ?Sized> {
    store: Arc<S>,
    policy: DuplicatePolicy,
}

impl<S: FingerprintStore + ?Sized> Deduplicator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, DuplicatePolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: DuplicatePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Accept the finding if its fingerprint has never been seen, otherwise report a duplicate.
    ///
    /// Acceptance is decided by the store's atomic insert, so among concurrent
    /// callers carrying the same fingerprint exactly one sees `Accepted`.
    #[instrument(
        name = "ingest_finding",
        skip(self, finding),
        fields(contract = %finding.contract, kind = %finding.vulnerability_kind)
    )]
    pub fn ingest(&self, finding: &Finding) -> Result<Acceptance, LedgerError> {
        finding.validate()?;
        let record = FingerprintRecord::first_report(finding, Utc::now());

        if self.store.insert_if_absent(&record)? {
            info!(
                fingerprint = %record.fingerprint.short(),
                session_id = %finding.session_id,
                "accepted new finding"
            );
            return Ok(Acceptance::Accepted);
        }

        if let DuplicatePolicy::UpgradeConfidence { min_gain } = self.policy {
            if self
                .store
                .raise_confidence(&record.fingerprint, finding.confidence, min_gain)?
            {
                info!(
                    fingerprint = %record.fingerprint.short(),
                    confidence = finding.confidence,
                    "raised stored confidence from duplicate report"
                );
            }
        }
        debug!(fingerprint = %record.fingerprint.short(), "duplicate finding");
        Ok(Acceptance::Duplicate)
    }

    /// The stored first report for `fingerprint`, if any.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<FingerprintRecord>, LedgerError> {
        self.store.get_fingerprint(fingerprint)
    }

    /// The stored first report for this finding's fingerprint, if any.
    pub fn lookup(&self, finding: &Finding) -> Result<Option<FingerprintRecord>, LedgerError> {
        self.get(&finding.fingerprint())
    }
}
