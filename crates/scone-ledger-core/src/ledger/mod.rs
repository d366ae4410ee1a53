use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fingerprint;
pub mod listing;
pub mod memory_store;
pub mod quota;
pub mod sqlite_store;

pub use fingerprint::Fingerprint;
pub use listing::{PageToken, SessionListing, SessionPage};
pub use quota::{QuotaPolicy, QuotaStore, QuotaWindow};

/// Canonical `chain:address` identifier for a deployed contract.
///
/// Both halves are trimmed and lower-cased so the same contract always maps to
/// the same identifier regardless of checksum casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractId {
    chain: String,
    address: String,
}

impl ContractId {
    pub fn new(
        chain: impl AsRef<str>,
        address: impl AsRef<str>,
    ) -> Result<Self, TargetValidationError> {
        let chain = chain.as_ref().trim().to_ascii_lowercase();
        let address = address.as_ref().trim().to_ascii_lowercase();
        if chain.is_empty() {
            return Err(TargetValidationError::EmptyChain);
        }
        if chain.contains(':') {
            return Err(TargetValidationError::InvalidChain { chain });
        }
        if address.is_empty() {
            return Err(TargetValidationError::EmptyAddress { chain });
        }
        Ok(Self { chain, address })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

impl FromStr for ContractId {
    type Err = TargetValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (chain, address) =
            raw.split_once(':')
                .ok_or_else(|| TargetValidationError::MalformedIdentifier {
                    raw: raw.to_string(),
                })?;
        Self::new(chain, address)
    }
}

impl TryFrom<String> for ContractId {
    type Error = TargetValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<ContractId> for String {
    fn from(id: ContractId) -> Self {
        id.to_string()
    }
}

/// Who controls the privileged functions of a target, as judged by an external classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminControl {
    Eoa,
    Multisig,
    Timelock,
    #[default]
    Unknown,
}

impl AdminControl {
    /// Multisig and timelock admins are considered already protected.
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Multisig | Self::Timelock)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eoa => "eoa",
            Self::Multisig => "multisig",
            Self::Timelock => "timelock",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for AdminControl {
    type Err = TargetValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "eoa" => Ok(Self::Eoa),
            "multisig" => Ok(Self::Multisig),
            "timelock" => Ok(Self::Timelock),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(TargetValidationError::UnknownAdminControl {
                value: other.to_string(),
            }),
        }
    }
}

/// A candidate contract selected for scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub contract: ContractId,
    pub discovered_at: DateTime<Utc>,
    pub priority_score: f64,
    #[serde(default)]
    pub admin_control: AdminControl,
}

impl Target {
    pub fn new(contract: ContractId, priority_score: f64) -> Self {
        Self {
            contract,
            discovered_at: Utc::now(),
            priority_score,
            admin_control: AdminControl::Unknown,
        }
    }

    pub fn with_admin_control(mut self, admin_control: AdminControl) -> Self {
        self.admin_control = admin_control;
        self
    }

    /// Copy of this target carrying a score recomputed by an external ranker.
    pub fn rescored(&self, priority_score: f64) -> Self {
        Self {
            priority_score,
            ..self.clone()
        }
    }
}

/// Errors emitted while validating target identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetValidationError {
    #[error("contract chain must not be blank")]
    EmptyChain,
    #[error("contract chain `{chain}` must not contain `:`")]
    InvalidChain { chain: String },
    #[error("contract address on `{chain}` must not be blank")]
    EmptyAddress { chain: String },
    #[error("contract identifier `{raw}` must look like `chain:address`")]
    MalformedIdentifier { raw: String },
    #[error("unknown admin control `{value}` (expected eoa, multisig, timelock or unknown)")]
    UnknownAdminControl { value: String },
}

/// Lifecycle of one scan attempt. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionState {
    pub const ALL: [SessionState; 4] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the monotonic order; both terminal states share the last slot.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether `next` may follow `self`. Skipping `Running` is allowed, repeats are not.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown session state `{0}`")]
pub struct UnknownSessionState(pub String);

impl FromStr for SessionState {
    type Err = UnknownSessionState;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(UnknownSessionState(raw.to_string())),
        }
    }
}

/// One scan attempt against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub target: Target,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Handle the scanning service knows this job by.
    pub external_ref: Option<String>,
    /// Failed session this one retries, if any.
    pub retry_of: Option<String>,
    /// Set once every finding of a completed session has been ingested.
    #[serde(default)]
    pub harvested_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn service_ref(&self) -> &str {
        self.external_ref.as_deref().unwrap_or(&self.id)
    }
}

/// Parameters for inserting a new session record.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub target: Target,
    pub external_ref: Option<String>,
    pub retry_of: Option<String>,
}

impl NewSession {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            external_ref: None,
            retry_of: None,
        }
    }

    pub(crate) fn into_session(self, id: String, created_at: DateTime<Utc>) -> Session {
        Session {
            id,
            target: self.target,
            state: SessionState::Pending,
            created_at,
            completed_at: None,
            external_ref: self.external_ref,
            retry_of: self.retry_of,
            harvested_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl FromStr for Severity {
    type Err = FindingValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" | "informational" => Ok(Self::Info),
            other => Err(FindingValidationError::UnknownSeverity {
                value: other.to_string(),
            }),
        }
    }
}

/// Estimated payout window for a finding, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BountyRange {
    pub min_usd: u64,
    pub max_usd: u64,
}

/// A reported vulnerability extracted from a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub contract: ContractId,
    pub vulnerability_kind: String,
    /// Reporter confidence within `0.0..=1.0`.
    pub confidence: f64,
    pub session_id: String,
    pub description: String,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub bounty: Option<BountyRange>,
    /// Link to the evidence (pull request, report) backing the finding.
    #[serde(default)]
    pub reference: Option<String>,
}

impl Finding {
    /// Construct a finding, validating invariants before returning.
    pub fn new(
        contract: ContractId,
        vulnerability_kind: impl Into<String>,
        confidence: f64,
        session_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, FindingValidationError> {
        let finding = Self {
            contract,
            vulnerability_kind: vulnerability_kind.into(),
            confidence,
            session_id: session_id.into(),
            description: description.into(),
            severity: None,
            bounty: None,
            reference: None,
        };
        finding.validate()?;
        Ok(finding)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_bounty(mut self, bounty: BountyRange) -> Self {
        self.bounty = Some(bounty);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Validate confidence bounds and required fields.
    pub fn validate(&self) -> Result<(), FindingValidationError> {
        if self.vulnerability_kind.trim().is_empty() {
            return Err(FindingValidationError::EmptyKind {
                contract: self.contract.to_string(),
            });
        }
        if self.session_id.trim().is_empty() {
            return Err(FindingValidationError::MissingSession {
                contract: self.contract.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(FindingValidationError::InvalidConfidence {
                contract: self.contract.to_string(),
                confidence: self.confidence,
            });
        }
        if let Some(bounty) = self.bounty {
            if bounty.min_usd > bounty.max_usd {
                return Err(FindingValidationError::InvertedBounty {
                    min_usd: bounty.min_usd,
                    max_usd: bounty.max_usd,
                });
            }
        }
        Ok(())
    }

    pub fn description_hash(&self) -> String {
        fingerprint::description_hash(&self.description)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Validation errors for findings handed to the ledger.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FindingValidationError {
    #[error("finding for `{contract}` must name a vulnerability kind")]
    EmptyKind { contract: String },
    #[error("finding for `{contract}` must reference the session it came from")]
    MissingSession { contract: String },
    #[error("finding for `{contract}` confidence must be within 0.0..=1.0 (got {confidence})")]
    InvalidConfidence { contract: String, confidence: f64 },
    #[error("bounty range minimum {min_usd} exceeds maximum {max_usd}")]
    InvertedBounty { min_usd: u64, max_usd: u64 },
    #[error("unknown severity `{value}`")]
    UnknownSeverity { value: String },
}

/// Result of offering a finding to the deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceptance {
    Accepted,
    Duplicate,
}

/// First accepted report for a fingerprint, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: Fingerprint,
    pub contract: ContractId,
    pub vulnerability_kind: String,
    pub confidence: f64,
    pub session_id: String,
    pub description_hash: String,
    pub first_seen: DateTime<Utc>,
}

impl FingerprintRecord {
    pub fn first_report(finding: &Finding, first_seen: DateTime<Utc>) -> Self {
        Self {
            fingerprint: Fingerprint::of(finding),
            contract: finding.contract.clone(),
            vulnerability_kind: fingerprint::normalize_kind(&finding.vulnerability_kind),
            confidence: finding.confidence,
            session_id: finding.session_id.clone(),
            description_hash: finding.description_hash(),
            first_seen,
        }
    }
}

/// Failures raised by ledger storage and the operations layered on it.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("session `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionState,
        to: SessionState,
    },
    #[error("session `{0}` not found")]
    NotFound(String),
    #[error("session `{id}` was already retried by `{retry_id}`")]
    AlreadyRetried { id: String, retry_id: String },
    #[error("session `{id}` is {state}; findings are only extracted from COMPLETED sessions")]
    SessionNotCompleted { id: String, state: SessionState },
    #[error("quota `{name}` exhausted until {resets_at}")]
    QuotaExhausted {
        name: String,
        resets_at: DateTime<Utc>,
    },
    #[error(transparent)]
    InvalidFinding(#[from] FindingValidationError),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable record of scan sessions.
///
/// Implementations must make `update_state` linearizable per session: two
/// callers may never both apply conflicting transitions.
pub trait SessionStore: Send + Sync {
    /// Persist a new `Pending` session.
    fn insert(&self, new: NewSession) -> Result<Session, LedgerError>;

    fn get(&self, id: &str) -> Result<Session, LedgerError>;

    /// Move a session forward, failing with `InvalidTransition` when the move is not allowed.
    fn update_state(&self, id: &str, new_state: SessionState) -> Result<Session, LedgerError>;

    /// Record that a `Completed` session's findings have all been ingested.
    ///
    /// Idempotent: an already harvested session keeps its original timestamp.
    fn mark_harvested(&self, id: &str) -> Result<Session, LedgerError>;

    /// One page of sessions ordered by `created_at`, strictly after `after`.
    fn list_page(
        &self,
        filter: Option<SessionState>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<SessionPage, LedgerError>;

    fn create(&self, target: &Target) -> Result<Session, LedgerError> {
        self.insert(NewSession::new(target.clone()))
    }

    fn create_with_ref(&self, target: &Target, external_ref: &str) -> Result<Session, LedgerError> {
        let mut new = NewSession::new(target.clone());
        new.external_ref = Some(external_ref.to_string());
        self.insert(new)
    }

    /// Start a fresh session for the target of a failed one.
    fn retry(&self, failed_id: &str) -> Result<Session, LedgerError> {
        let failed = self.get(failed_id)?;
        if failed.state != SessionState::Failed {
            return Err(LedgerError::InvalidTransition {
                id: failed.id,
                from: failed.state,
                to: SessionState::Pending,
            });
        }
        let mut new = NewSession::new(failed.target);
        new.retry_of = Some(failed.id);
        self.insert(new)
    }

    /// Lazy, restartable listing in creation order.
    fn list(&self, filter: Option<SessionState>) -> SessionListing<'_>
    where
        Self: Sized,
    {
        SessionListing::new(self, filter)
    }
}

/// Persisted set of accepted fingerprints.
pub trait FingerprintStore: Send + Sync {
    /// Insert the record unless its fingerprint is already present. Returns `true` on insert.
    ///
    /// The check and the insert must be a single atomic step.
    fn insert_if_absent(&self, record: &FingerprintRecord) -> Result<bool, LedgerError>;

    fn get_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<FingerprintRecord>, LedgerError>;

    /// Raise the stored confidence if `confidence` beats it by at least `min_gain`.
    fn raise_confidence(
        &self,
        fingerprint: &Fingerprint,
        confidence: f64,
        min_gain: f64,
    ) -> Result<bool, LedgerError>;
}
