use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    Fingerprint, FingerprintRecord, FingerprintStore, LedgerError, NewSession, PageToken,
    QuotaStore, QuotaWindow, Session, SessionPage, SessionState, SessionStore,
};

/// In-process ledger guarded by a mutex.
///
/// Atomicity only holds within one process; use
/// [`SqliteStore`](super::sqlite_store::SqliteStore) when several processes
/// share the ledger.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: i64,
    sessions: Vec<(i64, Session)>,
    fingerprints: HashMap<Fingerprint, FingerprintRecord>,
    quotas: HashMap<String, QuotaWindow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Backend(anyhow!("memory ledger lock poisoned")))
    }
}

fn token(seq: i64, session: &Session) -> PageToken {
    PageToken {
        created_at_us: session.created_at.timestamp_micros(),
        seq,
    }
}

impl SessionStore for MemoryStore {
    fn insert(&self, new: NewSession) -> Result<Session, LedgerError> {
        let mut state = self.lock()?;
        if let Some(retry_of) = new.retry_of.as_deref() {
            if let Some((_, existing)) = state
                .sessions
                .iter()
                .find(|(_, s)| s.retry_of.as_deref() == Some(retry_of))
            {
                return Err(LedgerError::AlreadyRetried {
                    id: retry_of.to_string(),
                    retry_id: existing.id.clone(),
                });
            }
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        let session = new.into_session(Uuid::new_v4().to_string(), Utc::now());
        state.sessions.push((seq, session.clone()));
        Ok(session)
    }

    fn get(&self, id: &str) -> Result<Session, LedgerError> {
        let state = self.lock()?;
        state
            .sessions
            .iter()
            .find(|(_, s)| s.id == id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    fn update_state(&self, id: &str, new_state: SessionState) -> Result<Session, LedgerError> {
        let mut state = self.lock()?;
        let (_, session) = state
            .sessions
            .iter_mut()
            .find(|(_, s)| s.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !session.state.can_transition_to(new_state) {
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                from: session.state,
                to: new_state,
            });
        }
        session.state = new_state;
        if new_state.is_terminal() {
            session.completed_at = Some(Utc::now());
        }
        Ok(session.clone())
    }

    fn mark_harvested(&self, id: &str) -> Result<Session, LedgerError> {
        let mut state = self.lock()?;
        let (_, session) = state
            .sessions
            .iter_mut()
            .find(|(_, s)| s.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if session.state != SessionState::Completed {
            return Err(LedgerError::SessionNotCompleted {
                id: id.to_string(),
                state: session.state,
            });
        }
        session.harvested_at.get_or_insert_with(Utc::now);
        Ok(session.clone())
    }

    fn list_page(
        &self,
        filter: Option<SessionState>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<SessionPage, LedgerError> {
        let state = self.lock()?;
        let mut matching: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, s)| filter.map_or(true, |wanted| s.state == wanted))
            .map(|(seq, s)| (token(*seq, s), s))
            .filter(|(position, _)| after.map_or(true, |after| position > after))
            .collect();
        matching.sort_by_key(|(position, _)| *position);
        matching.truncate(limit);

        let next = matching.last().map(|(position, _)| *position);
        Ok(SessionPage {
            sessions: matching.into_iter().map(|(_, s)| s.clone()).collect(),
            next,
        })
    }
}

impl FingerprintStore for MemoryStore {
    fn insert_if_absent(&self, record: &FingerprintRecord) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        if state.fingerprints.contains_key(&record.fingerprint) {
            return Ok(false);
        }
        state
            .fingerprints
            .insert(record.fingerprint.clone(), record.clone());
        Ok(true)
    }

    fn get_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<FingerprintRecord>, LedgerError> {
        Ok(self.lock()?.fingerprints.get(fingerprint).cloned())
    }

    fn raise_confidence(
        &self,
        fingerprint: &Fingerprint,
        confidence: f64,
        min_gain: f64,
    ) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        match state.fingerprints.get_mut(fingerprint) {
            Some(record)
                if record.confidence < confidence && record.confidence + min_gain <= confidence =>
            {
                record.confidence = confidence;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl QuotaStore for MemoryStore {
    fn acquire(
        &self,
        name: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaWindow, LedgerError> {
        let mut state = self.lock()?;
        let current = state.quotas.get(name).cloned();
        let next = QuotaWindow::acquire(current, name, limit, window, now)?;
        state.quotas.insert(name.to_string(), next.clone());
        Ok(next)
    }

    fn quota(&self, name: &str) -> Result<Option<QuotaWindow>, LedgerError> {
        Ok(self.lock()?.quotas.get(name).cloned())
    }
}
