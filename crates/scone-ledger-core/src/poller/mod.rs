mod http;

use std::{sync::Arc, time::Duration};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{LedgerError, Session, SessionState, SessionStore};

pub use http::HttpScanService;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// External scanning service that runs the actual audit jobs.
#[async_trait]
pub trait ScanService: Send + Sync {
    /// Return the service's own state label (e.g. `IN_PROGRESS`) for a job.
    async fn session_status(&self, external_ref: &str) -> AnyResult<String>;
}

/// Map the scanning service's state vocabulary onto the session lifecycle.
pub fn map_service_state(label: &str) -> Option<SessionState> {
    let label = label.trim().to_ascii_uppercase();
    match label.as_str() {
        "QUEUED" | "PENDING" => Some(SessionState::Pending),
        "PLANNING" | "IN_PROGRESS" | "EXECUTING" | "RUNNING" => Some(SessionState::Running),
        "COMPLETED" | "SUCCEEDED" | "DONE" => Some(SessionState::Completed),
        "FAILED" | "CANCELLED" | "CANCELED" | "ERROR" => Some(SessionState::Failed),
        other if other.starts_with("AWAITING_") => Some(SessionState::Running),
        _ => None,
    }
}

/// What a poll established about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub session_id: String,
    pub state: SessionState,
    /// Whether the scanning service was contacted.
    pub queried: bool,
    /// Whether this poll advanced the stored state.
    pub changed: bool,
}

impl ObservedState {
    fn stored(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            state: session.state,
            queried: false,
            changed: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    /// Transient failure talking to the scanning service; retry on the next tick.
    #[error("poll of session `{session_id}` failed: {reason}")]
    PollFailed { session_id: String, reason: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Checks the scanning service for session progress and records it in the store.
///
/// Each call issues at most one external query and never retries internally.
pub struct StatusPoller<S, C>
where
    S: SessionStore + ?Sized,
    C: ScanService + ?Sized,
{
    store: Arc<S>,
    service: Arc<C>,
    timeout: Duration,
}

impl<S, C> StatusPoller<S, C>
where
    S: SessionStore + ?Sized,
    C: ScanService + ?Sized,
{
    pub fn new(store: Arc<S>, service: Arc<C>) -> Self {
        Self::with_timeout(store, service, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<S>, service: Arc<C>, timeout: Duration) -> Self {
        Self {
            store,
            service,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Poll one session.
    ///
    /// Terminal sessions return their stored state without contacting the
    /// service. The store is only mutated after the external call has fully
    /// returned, so abandoning the future never leaves a partial update.
    #[instrument(name = "poll_session", skip(self, session), fields(session_id = %session.id))]
    pub async fn poll(&self, session: &Session) -> Result<ObservedState, PollError> {
        let stored = self.store.get(&session.id)?;
        if stored.state.is_terminal() {
            debug!(state = %stored.state, "session already terminal; skipping service query");
            return Ok(ObservedState::stored(&stored));
        }

        let label = match tokio::time::timeout(
            self.timeout,
            self.service.session_status(stored.service_ref()),
        )
        .await
        {
            Ok(Ok(label)) => label,
            Ok(Err(err)) => {
                warn!(error = %err, "scan service query failed");
                return Err(PollError::PollFailed {
                    session_id: stored.id,
                    reason: format!("{err:#}"),
                });
            }
            Err(_) => {
                warn!(
                    timeout = %humantime::format_duration(self.timeout),
                    "scan service query timed out"
                );
                return Err(PollError::PollFailed {
                    session_id: stored.id,
                    reason: format!(
                        "timed out after {}",
                        humantime::format_duration(self.timeout)
                    ),
                });
            }
        };

        let Some(remote) = map_service_state(&label) else {
            warn!(%label, "unrecognized scan service state");
            return Err(PollError::PollFailed {
                session_id: stored.id,
                reason: format!("unrecognized service state `{label}`"),
            });
        };

        if !stored.state.can_transition_to(remote) {
            debug!(stored = %stored.state, %remote, "no forward progress");
            return Ok(ObservedState {
                queried: true,
                ..ObservedState::stored(&stored)
            });
        }

        match self.store.update_state(&stored.id, remote) {
            Ok(updated) => {
                info!(from = %stored.state, to = %updated.state, "session state advanced");
                Ok(ObservedState {
                    session_id: updated.id,
                    state: updated.state,
                    queried: true,
                    changed: true,
                })
            }
            Err(err @ LedgerError::InvalidTransition { .. }) => {
                // Another poller moved the session between our read and write.
                let current = self.store.get(&stored.id)?;
                let conflicting = current.state.is_terminal()
                    && remote.is_terminal()
                    && current.state != remote;
                if conflicting || current.state.rank() < remote.rank() {
                    return Err(err.into());
                }
                debug!(state = %current.state, "transition already applied by another poller");
                Ok(ObservedState {
                    queried: true,
                    ..ObservedState::stored(&current)
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}
