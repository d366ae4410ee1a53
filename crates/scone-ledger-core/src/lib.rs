pub mod dedup;
pub mod extract;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod poller;
pub mod settings;

pub use dedup::{Deduplicator, DuplicatePolicy};
pub use extract::TextFindingExtractor;
pub use ledger::{
    memory_store::MemoryStore, sqlite_store::SqliteStore, Acceptance, AdminControl, BountyRange,
    ContractId, Finding, FindingValidationError, Fingerprint, FingerprintRecord, FingerprintStore,
    LedgerError, NewSession, QuotaPolicy, QuotaStore, QuotaWindow, Session, SessionListing,
    SessionState, SessionStore, Severity, Target, TargetValidationError,
};
pub use notify::{
    render_alert, Alert, AlertChannel, AlertFormat, Decision, LogChannel, NotifierGate,
    NotifyError, WebhookChannel,
};
pub use pipeline::{ArtifactSource, DirectoryArtifacts, HarvestError, HarvestReport, Harvester};
pub use poller::{HttpScanService, ObservedState, PollError, ScanService, StatusPoller};
pub use settings::LedgerSettings;
