mod render;
mod webhook;

use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{Acceptance, BountyRange, ContractId, Finding};

pub use render::{explorer_url, format_usd, render_alert, AlertFormat};
pub use webhook::WebhookChannel;

pub const DEFAULT_NOTIFY_THRESHOLD: f64 = 0.70;

/// Fixed message shape handed to alert channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub contract: ContractId,
    pub chain: String,
    pub vulnerability_kind: String,
    pub confidence: f64,
    pub bounty: Option<BountyRange>,
    pub reference: String,
}

impl Alert {
    /// Build the alert for a finding, linking the block explorer when the
    /// finding carries no reference of its own.
    pub fn from_finding(finding: &Finding) -> Self {
        let reference = finding
            .reference
            .clone()
            .filter(|link| !link.trim().is_empty())
            .unwrap_or_else(|| {
                explorer_url(finding.contract.chain(), finding.contract.address())
            });
        Self {
            contract: finding.contract.clone(),
            chain: finding.contract.chain().to_string(),
            vulnerability_kind: finding.vulnerability_kind.clone(),
            confidence: finding.confidence,
            bounty: finding.bounty,
            reference,
        }
    }
}

/// Destination for alerts (chat webhook, log, pager).
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn dispatch(&self, alert: &Alert) -> AnyResult<()>;
}

/// Emits alerts through `tracing` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    async fn dispatch(&self, alert: &Alert) -> AnyResult<()> {
        let rendered = render_alert(alert, AlertFormat::Human)?;
        info!(contract = %alert.contract, kind = %alert.vulnerability_kind, "{rendered}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Notify,
    Suppress,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The alert channel rejected the alert. The finding stays accepted.
    #[error("alert dispatch for `{contract}` failed: {reason}")]
    DispatchFailed { contract: String, reason: String },
    #[error("notify threshold must be within 0.0..=1.0 (got {0})")]
    InvalidThreshold(f64),
}

/// Decides whether an ingested finding warrants an alert and delivers it.
pub struct NotifierGate<C: AlertChannel + ?Sized> {
    channel: Arc<C>,
    threshold: f64,
}

impl<C: AlertChannel + ?Sized> NotifierGate<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            threshold: DEFAULT_NOTIFY_THRESHOLD,
        }
    }

    pub fn with_threshold(channel: Arc<C>, threshold: f64) -> Result<Self, NotifyError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(NotifyError::InvalidThreshold(threshold));
        }
        Ok(Self { channel, threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Pure decision without side effects.
    pub fn decide(&self, finding: &Finding, acceptance: Acceptance) -> Decision {
        match acceptance {
            Acceptance::Accepted if finding.confidence >= self.threshold => Decision::Notify,
            _ => Decision::Suppress,
        }
    }

    /// Decide and, on `Notify`, dispatch exactly once. Failures are not retried.
    #[instrument(
        name = "evaluate_finding",
        skip(self, finding),
        fields(contract = %finding.contract, kind = %finding.vulnerability_kind)
    )]
    pub async fn evaluate(
        &self,
        finding: &Finding,
        acceptance: Acceptance,
    ) -> Result<Decision, NotifyError> {
        let decision = self.decide(finding, acceptance);
        if decision == Decision::Suppress {
            debug!(
                confidence = finding.confidence,
                threshold = self.threshold,
                "suppressed"
            );
            return Ok(decision);
        }

        let alert = Alert::from_finding(finding);
        if let Err(err) = self.channel.dispatch(&alert).await {
            warn!(error = %err, "alert dispatch failed");
            return Err(NotifyError::DispatchFailed {
                contract: finding.contract.to_string(),
                reason: format!("{err:#}"),
            });
        }
        info!(confidence = finding.confidence, "alert dispatched");
        Ok(Decision::Notify)
    }
}
