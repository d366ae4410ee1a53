use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::dedup::Deduplicator;
use crate::extract::TextFindingExtractor;
use crate::ledger::{
    Acceptance, Finding, FingerprintStore, LedgerError, Session, SessionState, SessionStore,
};
use crate::notify::{AlertChannel, Decision, NotifierGate, NotifyError};
use crate::poller::{ObservedState, PollError, ScanService, StatusPoller};

/// Produces the findings reported by a completed session.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn findings(&self, session: &Session) -> AnyResult<Vec<Finding>>;
}

/// Reads `<dir>/<session id>.md` reports written by the scanning service.
///
/// A report that has not been written yet is an error, so the session stays
/// unharvested and is picked up again on the next pass.
pub struct DirectoryArtifacts {
    root: PathBuf,
    extractor: TextFindingExtractor,
}

impl DirectoryArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> AnyResult<Self> {
        Ok(Self {
            root: root.into(),
            extractor: TextFindingExtractor::new()?,
        })
    }

    fn report_path(&self, session: &Session) -> PathBuf {
        self.root.join(format!("{}.md", session.id))
    }
}

#[async_trait]
impl ArtifactSource for DirectoryArtifacts {
    async fn findings(&self, session: &Session) -> AnyResult<Vec<Finding>> {
        let path = self.report_path(session);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("findings report {} is not readable", path.display()))?;
        Ok(self.extractor.extract(session, &text)?)
    }
}

/// What happened to one finding during a harvest.
#[derive(Debug, Clone, Serialize)]
pub struct FindingOutcome {
    pub finding: Finding,
    pub acceptance: Acceptance,
    pub decision: Decision,
    /// Set when the gate decided to notify but the channel failed.
    pub dispatch_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub observed: ObservedState,
    pub outcomes: Vec<FindingOutcome>,
}

impl HarvestReport {
    pub fn notified(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| {
                outcome.decision == Decision::Notify && outcome.dispatch_error.is_none()
            })
            .count()
    }

    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.acceptance == Acceptance::Accepted)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to load findings for session `{session_id}`: {reason}")]
    Artifacts { session_id: String, reason: String },
}

/// Poll a session and, once it has completed, push its findings through
/// deduplication and the notifier gate.
pub struct Harvester<S, C, A, N>
where
    S: SessionStore + FingerprintStore + ?Sized,
    C: ScanService + ?Sized,
    A: ArtifactSource + ?Sized,
    N: AlertChannel + ?Sized,
{
    poller: StatusPoller<S, C>,
    dedup: Deduplicator<S>,
    gate: NotifierGate<N>,
    artifacts: Arc<A>,
}

impl<S, C, A, N> Harvester<S, C, A, N>
where
    S: SessionStore + FingerprintStore + ?Sized,
    C: ScanService + ?Sized,
    A: ArtifactSource + ?Sized,
    N: AlertChannel + ?Sized,
{
    pub fn new(
        poller: StatusPoller<S, C>,
        dedup: Deduplicator<S>,
        gate: NotifierGate<N>,
        artifacts: Arc<A>,
    ) -> Self {
        Self {
            poller,
            dedup,
            gate,
            artifacts,
        }
    }

    /// Poll the session and ingest its findings once it is `Completed`.
    ///
    /// The session is marked harvested only after every finding has been
    /// ingested. A failed read or ingest leaves it unmarked, and the next
    /// harvest starts over; deduplication absorbs the findings that already
    /// went through.
    #[instrument(
        name = "harvest_session",
        skip(self, session),
        fields(session_id = %session.id)
    )]
    pub async fn harvest(&self, session: &Session) -> Result<HarvestReport, HarvestError> {
        let observed = self.poller.poll(session).await?;
        let empty = |observed| HarvestReport {
            observed,
            outcomes: Vec::new(),
        };
        if observed.state != SessionState::Completed {
            return Ok(empty(observed));
        }
        let store = self.poller.store();
        let completed = store.get(&session.id)?;
        if completed.harvested_at.is_some() {
            debug!("findings already harvested");
            return Ok(empty(observed));
        }

        let findings = self
            .artifacts
            .findings(&completed)
            .await
            .map_err(|err| HarvestError::Artifacts {
                session_id: completed.id.clone(),
                reason: format!("{err:#}"),
            })?;

        let mut outcomes = Vec::with_capacity(findings.len());
        for finding in findings {
            let acceptance = self.dedup.ingest(&finding)?;
            let (decision, dispatch_error) = match self.gate.evaluate(&finding, acceptance).await {
                Ok(decision) => (decision, None),
                Err(err @ NotifyError::DispatchFailed { .. }) => {
                    (Decision::Notify, Some(err.to_string()))
                }
                Err(err) => (Decision::Suppress, Some(err.to_string())),
            };
            outcomes.push(FindingOutcome {
                finding,
                acceptance,
                decision,
                dispatch_error,
            });
        }

        store.mark_harvested(&completed.id)?;
        let report = HarvestReport { observed, outcomes };
        info!(
            findings = report.outcomes.len(),
            accepted = report.accepted(),
            notified = report.notified(),
            "harvested session"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{memory_store::MemoryStore, ContractId, Target};
    use crate::notify::Alert;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedService(&'static str);

    #[async_trait]
    impl ScanService for FixedService {
        async fn session_status(&self, _external_ref: &str) -> AnyResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        async fn dispatch(&self, alert: &Alert) -> AnyResult<()> {
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` reads, then reports one confident finding.
    struct FlakyArtifacts {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyArtifacts {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactSource for FlakyArtifacts {
        async fn findings(&self, session: &Session) -> AnyResult<Vec<Finding>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("disk busy");
            }
            Ok(vec![Finding::new(
                session.target.contract.clone(),
                "Access control",
                0.9,
                &session.id,
                "sweep() lacks an owner check",
            )?])
        }
    }

    const REPORT: &str = "## High: Reentrancy in withdraw\n\
        Confidence: 90%\n\
        withdraw() re-enters.\n\n\
        ## Low: Unused variable\n\
        Confidence: 30%\n\
        Logic is unaffected.\n";

    fn harvester(
        store: Arc<MemoryStore>,
        state: &'static str,
        dir: &std::path::Path,
        channel: Arc<RecordingChannel>,
    ) -> Harvester<MemoryStore, FixedService, DirectoryArtifacts, RecordingChannel> {
        Harvester::new(
            StatusPoller::new(Arc::clone(&store), Arc::new(FixedService(state))),
            Deduplicator::new(store),
            NotifierGate::new(channel),
            Arc::new(DirectoryArtifacts::new(dir).unwrap()),
        )
    }

    fn session(store: &MemoryStore) -> Session {
        let target = Target::new(ContractId::new("ethereum", "0xabcd").unwrap(), 1.0);
        store.create(&target).unwrap()
    }

    #[tokio::test]
    async fn completed_session_flows_to_notification() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        std::fs::write(dir.path().join(format!("{}.md", session.id)), REPORT).unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let harvester = harvester(
            Arc::clone(&store),
            "COMPLETED",
            dir.path(),
            Arc::clone(&channel),
        );

        let report = harvester.harvest(&session).await.unwrap();
        assert_eq!(report.observed.state, SessionState::Completed);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.accepted(), 2);
        assert_eq!(report.notified(), 1);
        assert_eq!(report.outcomes[1].decision, Decision::Suppress);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        assert!(store.get(&session.id).unwrap().harvested_at.is_some());

        let again = harvester.harvest(&session).await.unwrap();
        assert!(again.outcomes.is_empty());
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_report_from_retry_is_duplicate() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let harvester = harvester(
            Arc::clone(&store),
            "COMPLETED",
            dir.path(),
            Arc::clone(&channel),
        );

        for _ in 0..2 {
            let session = session(&store);
            std::fs::write(dir.path().join(format!("{}.md", session.id)), REPORT).unwrap();
            harvester.harvest(&session).await.unwrap();
        }
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn running_session_yields_no_findings() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        let harvester = harvester(
            Arc::clone(&store),
            "IN_PROGRESS",
            dir.path(),
            Arc::new(RecordingChannel::default()),
        );
        let report = harvester.harvest(&session).await.unwrap();
        assert_eq!(report.observed.state, SessionState::Running);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn report_written_after_completion_is_still_harvested() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        let channel = Arc::new(RecordingChannel::default());
        let harvester = harvester(Arc::clone(&store), "DONE", dir.path(), Arc::clone(&channel));

        let err = harvester.harvest(&session).await.unwrap_err();
        assert!(matches!(err, HarvestError::Artifacts { .. }));
        let stored = store.get(&session.id).unwrap();
        assert_eq!(stored.state, SessionState::Completed);
        assert!(stored.harvested_at.is_none());

        std::fs::write(dir.path().join(format!("{}.md", session.id)), REPORT).unwrap();
        let report = harvester.harvest(&session).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.observed.changed);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_artifact_read_is_retried_on_next_harvest() {
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        let channel = Arc::new(RecordingChannel::default());
        let artifacts = Arc::new(FlakyArtifacts::failing(1));
        let harvester = Harvester::new(
            StatusPoller::new(Arc::clone(&store), Arc::new(FixedService("COMPLETED"))),
            Deduplicator::new(Arc::clone(&store)),
            NotifierGate::new(Arc::clone(&channel)),
            Arc::clone(&artifacts),
        );

        let first = harvester.harvest(&session).await.unwrap_err();
        assert!(first.to_string().contains("disk busy"));
        assert!(channel.sent.lock().unwrap().is_empty());

        let second = harvester.harvest(&session).await.unwrap();
        assert_eq!(second.accepted(), 1);
        assert_eq!(second.notified(), 1);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        let third = harvester.harvest(&session).await.unwrap();
        assert!(third.outcomes.is_empty());
        assert_eq!(artifacts.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_completed_by_plain_poll_is_harvested_later() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        std::fs::write(dir.path().join(format!("{}.md", session.id)), REPORT).unwrap();

        let observed = StatusPoller::new(Arc::clone(&store), Arc::new(FixedService("COMPLETED")))
            .poll(&session)
            .await
            .unwrap();
        assert!(observed.changed);

        let channel = Arc::new(RecordingChannel::default());
        let harvester = harvester(
            Arc::clone(&store),
            "COMPLETED",
            dir.path(),
            Arc::clone(&channel),
        );
        let report = harvester.harvest(&session).await.unwrap();
        assert_eq!(report.accepted(), 2);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }
}
