use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{
    ffi::ErrorCode, params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    AdminControl, ContractId, Fingerprint, FingerprintRecord, FingerprintStore, LedgerError,
    NewSession, PageToken, QuotaPolicy, QuotaStore, QuotaWindow, Session, SessionPage,
    SessionState, SessionStore, Target,
};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    discovered_at_us INTEGER NOT NULL,
    priority_score REAL NOT NULL,
    admin_control TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    completed_at_us INTEGER,
    external_ref TEXT,
    retry_of TEXT UNIQUE,
    harvested_at_us INTEGER
);
CREATE INDEX IF NOT EXISTS sessions_by_created ON sessions (created_at_us, seq);
CREATE TABLE IF NOT EXISTS fingerprints (
    fingerprint TEXT PRIMARY KEY,
    contract TEXT NOT NULL,
    vulnerability_kind TEXT NOT NULL,
    confidence REAL NOT NULL,
    session_id TEXT NOT NULL,
    description_hash TEXT NOT NULL,
    first_seen_us INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS quota_windows (
    name TEXT PRIMARY KEY,
    limit_count INTEGER NOT NULL,
    window_secs INTEGER NOT NULL,
    window_start_us INTEGER NOT NULL,
    used INTEGER NOT NULL
);
";

const SESSION_COLUMNS: &str = "id, chain, address, discovered_at_us, priority_score, \
     admin_control, state, created_at_us, completed_at_us, external_ref, retry_of, seq, \
     harvested_at_us";

const QUOTA_COLUMNS: &str = "name, limit_count, window_secs, window_start_us, used";

/// Durable ledger backed by a SQLite database file.
///
/// Every operation opens its own connection, so clones of the store (and other
/// processes pointing at the same file) contend only through SQLite locking.
/// Writes commit with `synchronous=FULL` before returning.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the ledger at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.with_connection("bootstrap schema", |conn| {
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
                .map_err(db_err("enable write-ahead log"))?;
            conn.execute_batch(SCHEMA)
                .map_err(db_err("apply ledger schema"))?;
            migrate(conn)
        })?;
        debug!(path = %store.path.display(), "ledger opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open ledger database {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to configure sqlite busy timeout")?;
        conn.pragma_update(None, "synchronous", "FULL")
            .context("failed to configure sqlite synchronous mode")?;
        Ok(conn)
    }

    fn with_connection<T, F>(&self, context: &'static str, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self.connect()?;
        op(&mut conn).map_err(|err| match err {
            LedgerError::Backend(inner) => LedgerError::Backend(inner.context(format!(
                "{context} failed for {}",
                self.path.display()
            ))),
            other => other,
        })
    }
}

/// Bring ledgers created before the harvest marker existed up to the current schema.
fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    let has_marker: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('sessions') \
             WHERE name = 'harvested_at_us'",
            [],
            |row| row.get(0),
        )
        .map_err(db_err("inspect sessions table"))?;
    if !has_marker {
        conn.execute("ALTER TABLE sessions ADD COLUMN harvested_at_us INTEGER", [])
            .map_err(db_err("add harvest marker column"))?;
    }
    Ok(())
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |err| LedgerError::Backend(anyhow::Error::new(err).context(context))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(Session, PageToken)> {
    let chain: String = row.get(1)?;
    let address: String = row.get(2)?;
    let contract = ContractId::new(chain, address).map_err(|err| conversion_err(1, err))?;
    let admin_control: AdminControl = row
        .get::<_, String>(5)?
        .parse()
        .map_err(|err| conversion_err(5, err))?;
    let state: SessionState = row
        .get::<_, String>(6)?
        .parse()
        .map_err(|err| conversion_err(6, err))?;
    let created_at_us: i64 = row.get(7)?;
    let completed_at = row
        .get::<_, Option<i64>>(8)?
        .map(|micros| timestamp(8, micros))
        .transpose()?;
    let harvested_at = row
        .get::<_, Option<i64>>(12)?
        .map(|micros| timestamp(12, micros))
        .transpose()?;

    let session = Session {
        id: row.get(0)?,
        target: Target {
            contract,
            discovered_at: timestamp(3, row.get(3)?)?,
            priority_score: row.get(4)?,
            admin_control,
        },
        state,
        created_at: timestamp(7, created_at_us)?,
        completed_at,
        external_ref: row.get(9)?,
        retry_of: row.get(10)?,
        harvested_at,
    };
    let position = PageToken {
        created_at_us,
        seq: row.get(11)?,
    };
    Ok((session, position))
}

fn load_session(conn: &Connection, id: &str) -> Result<Session, LedgerError> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        params![id],
        session_from_row,
    )
    .optional()
    .map_err(db_err("load session"))?
    .map(|(session, _)| session)
    .ok_or_else(|| LedgerError::NotFound(id.to_string()))
}

fn fingerprint_from_row(row: &Row<'_>) -> rusqlite::Result<FingerprintRecord> {
    let contract: ContractId = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|err| conversion_err(1, err))?;
    Ok(FingerprintRecord {
        fingerprint: Fingerprint::from_stored(row.get(0)?),
        contract,
        vulnerability_kind: row.get(2)?,
        confidence: row.get(3)?,
        session_id: row.get(4)?,
        description_hash: row.get(5)?,
        first_seen: timestamp(6, row.get(6)?)?,
    })
}

fn quota_from_row(row: &Row<'_>) -> rusqlite::Result<QuotaWindow> {
    let secs: i64 = row.get(2)?;
    let secs = u64::try_from(secs).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(2, secs))?;
    Ok(QuotaWindow {
        name: row.get(0)?,
        limit: row.get(1)?,
        window: Duration::from_secs(secs),
        window_start: timestamp(3, row.get(3)?)?,
        used: row.get(4)?,
    })
}

/// Windows are persisted in whole seconds; anything finer would be truncated.
fn window_secs(window: Duration) -> Result<i64, LedgerError> {
    if window.as_secs() == 0 || window.subsec_nanos() != 0 {
        return Err(LedgerError::Backend(anyhow::anyhow!(
            "quota window must be a whole number of seconds (got {})",
            humantime::format_duration(window)
        )));
    }
    i64::try_from(window.as_secs())
        .map_err(|_| LedgerError::Backend(anyhow::anyhow!("quota window is too long")))
}

fn load_quota(conn: &Connection, name: &str) -> Result<Option<QuotaWindow>, LedgerError> {
    conn.query_row(
        &format!("SELECT {QUOTA_COLUMNS} FROM quota_windows WHERE name = ?1"),
        params![name],
        quota_from_row,
    )
    .optional()
    .map_err(db_err("load quota window"))
}

/// Consume one slot of the named window. Runs inside the caller's transaction.
fn take_quota_slot(
    conn: &Connection,
    name: &str,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<QuotaWindow, LedgerError> {
    let stored_window = window_secs(window)?;
    let next = QuotaWindow::acquire(load_quota(conn, name)?, name, limit, window, now)?;
    conn.execute(
        &format!(
            "INSERT INTO quota_windows ({QUOTA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(name) DO UPDATE SET \
                limit_count = excluded.limit_count, \
                window_secs = excluded.window_secs, \
                window_start_us = excluded.window_start_us, \
                used = excluded.used"
        ),
        params![
            next.name,
            next.limit,
            stored_window,
            next.window_start.timestamp_micros(),
            next.used,
        ],
    )
    .map_err(db_err("store quota window"))?;
    Ok(next)
}

fn insert_session_row(conn: &Connection, session: &Session) -> Result<(), LedgerError> {
    let inserted = conn.execute(
        "INSERT INTO sessions (id, chain, address, discovered_at_us, priority_score, \
         admin_control, state, created_at_us, completed_at_us, external_ref, retry_of) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)",
        params![
            session.id,
            session.target.contract.chain(),
            session.target.contract.address(),
            session.target.discovered_at.timestamp_micros(),
            session.target.priority_score,
            session.target.admin_control.as_str(),
            session.state.as_str(),
            session.created_at.timestamp_micros(),
            session.external_ref,
            session.retry_of,
        ],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_constraint_violation(&err) && session.retry_of.is_some() => {
            let retry_of = session.retry_of.clone().unwrap_or_default();
            let retry_id: String = conn
                .query_row(
                    "SELECT id FROM sessions WHERE retry_of = ?1",
                    params![retry_of],
                    |row| row.get(0),
                )
                .map_err(db_err("look up existing retry"))?;
            Err(LedgerError::AlreadyRetried {
                id: retry_of,
                retry_id,
            })
        }
        Err(err) => Err(db_err("insert session row")(err)),
    }
}

impl SqliteStore {
    /// Take one slot from `policy` and insert the session in a single
    /// transaction, so a failed insert never consumes quota.
    #[instrument(
        name = "session_insert_within_quota",
        skip(self, new, policy),
        fields(contract = %new.target.contract, quota = %policy.name)
    )]
    pub fn insert_within_quota(
        &self,
        new: NewSession,
        policy: &QuotaPolicy,
    ) -> Result<(Session, QuotaWindow), LedgerError> {
        let now = Utc::now();
        let session = new.into_session(Uuid::new_v4().to_string(), now);
        let window = self.with_connection("insert session within quota", |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err("begin quota-bound insert"))?;
            let window = take_quota_slot(&tx, &policy.name, policy.limit, policy.window, now)?;
            insert_session_row(&tx, &session)?;
            tx.commit().map_err(db_err("commit quota-bound insert"))?;
            Ok(window)
        })?;
        debug!(session_id = %session.id, used = window.used, "session created within quota");
        Ok((session, window))
    }
}

impl SessionStore for SqliteStore {
    #[instrument(name = "session_insert", skip(self, new), fields(contract = %new.target.contract))]
    fn insert(&self, new: NewSession) -> Result<Session, LedgerError> {
        let session = new.into_session(Uuid::new_v4().to_string(), Utc::now());
        self.with_connection("insert session", |conn| insert_session_row(conn, &session))?;
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    fn get(&self, id: &str) -> Result<Session, LedgerError> {
        self.with_connection("get session", |conn| load_session(conn, id))
    }

    #[instrument(name = "session_update_state", skip(self))]
    fn update_state(&self, id: &str, new_state: SessionState) -> Result<Session, LedgerError> {
        self.with_connection("update session state", |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err("begin transition"))?;
            let mut session = load_session(&tx, id)?;
            if !session.state.can_transition_to(new_state) {
                return Err(LedgerError::InvalidTransition {
                    id: id.to_string(),
                    from: session.state,
                    to: new_state,
                });
            }
            let completed_at = new_state.is_terminal().then(Utc::now);
            let changed = tx
                .execute(
                    "UPDATE sessions SET state = ?1, completed_at_us = ?2 \
                     WHERE id = ?3 AND state = ?4",
                    params![
                        new_state.as_str(),
                        completed_at.map(|at| at.timestamp_micros()),
                        id,
                        session.state.as_str(),
                    ],
                )
                .map_err(db_err("apply transition"))?;
            if changed != 1 {
                return Err(LedgerError::InvalidTransition {
                    id: id.to_string(),
                    from: session.state,
                    to: new_state,
                });
            }
            tx.commit().map_err(db_err("commit transition"))?;
            session.state = new_state;
            session.completed_at = completed_at;
            Ok(session)
        })
    }

    #[instrument(name = "session_mark_harvested", skip(self))]
    fn mark_harvested(&self, id: &str) -> Result<Session, LedgerError> {
        self.with_connection("mark session harvested", |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err("begin harvest marker"))?;
            let session = load_session(&tx, id)?;
            if session.state != SessionState::Completed {
                return Err(LedgerError::SessionNotCompleted {
                    id: id.to_string(),
                    state: session.state,
                });
            }
            if session.harvested_at.is_some() {
                return Ok(session);
            }
            tx.execute(
                "UPDATE sessions SET harvested_at_us = ?1 \
                 WHERE id = ?2 AND harvested_at_us IS NULL",
                params![Utc::now().timestamp_micros(), id],
            )
            .map_err(db_err("set harvest marker"))?;
            let marked = load_session(&tx, id)?;
            tx.commit().map_err(db_err("commit harvest marker"))?;
            Ok(marked)
        })
    }

    fn list_page(
        &self,
        filter: Option<SessionState>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<SessionPage, LedgerError> {
        let (after_us, after_seq) = after
            .map(|token| (token.created_at_us, token.seq))
            .unwrap_or((i64::MIN, i64::MIN));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection("list sessions", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE (?1 IS NULL OR state = ?1) \
                       AND (created_at_us > ?2 OR (created_at_us = ?2 AND seq > ?3)) \
                     ORDER BY created_at_us ASC, seq ASC \
                     LIMIT ?4"
                ))
                .map_err(db_err("prepare session listing"))?;
            let rows = stmt
                .query_map(
                    params![filter.map(SessionState::as_str), after_us, after_seq, limit],
                    session_from_row,
                )
                .map_err(db_err("query session listing"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("read session listing"))?;
            let next = rows.last().map(|(_, position)| *position);
            Ok(SessionPage {
                sessions: rows.into_iter().map(|(session, _)| session).collect(),
                next,
            })
        })
    }
}

impl FingerprintStore for SqliteStore {
    fn insert_if_absent(&self, record: &FingerprintRecord) -> Result<bool, LedgerError> {
        self.with_connection("record fingerprint", |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO fingerprints (fingerprint, contract, \
                     vulnerability_kind, confidence, session_id, description_hash, first_seen_us) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.fingerprint.as_str(),
                        record.contract.to_string(),
                        record.vulnerability_kind,
                        record.confidence,
                        record.session_id,
                        record.description_hash,
                        record.first_seen.timestamp_micros(),
                    ],
                )
                .map_err(db_err("insert fingerprint"))?;
            Ok(inserted == 1)
        })
    }

    fn get_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<FingerprintRecord>, LedgerError> {
        self.with_connection("get fingerprint", |conn| {
            conn.query_row(
                "SELECT fingerprint, contract, vulnerability_kind, confidence, session_id, \
                 description_hash, first_seen_us FROM fingerprints WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                fingerprint_from_row,
            )
            .optional()
            .map_err(db_err("load fingerprint"))
        })
    }

    fn raise_confidence(
        &self,
        fingerprint: &Fingerprint,
        confidence: f64,
        min_gain: f64,
    ) -> Result<bool, LedgerError> {
        self.with_connection("raise fingerprint confidence", |conn| {
            let changed = conn
                .execute(
                    "UPDATE fingerprints SET confidence = ?2 \
                     WHERE fingerprint = ?1 AND confidence < ?2 AND confidence + ?3 <= ?2",
                    params![fingerprint.as_str(), confidence, min_gain],
                )
                .map_err(db_err("update fingerprint confidence"))?;
            Ok(changed == 1)
        })
    }
}

impl QuotaStore for SqliteStore {
    #[instrument(name = "quota_acquire", skip(self, window, now))]
    fn acquire(
        &self,
        name: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaWindow, LedgerError> {
        self.with_connection("acquire quota", |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err("begin quota acquisition"))?;
            let next = take_quota_slot(&tx, name, limit, window, now)?;
            tx.commit().map_err(db_err("commit quota acquisition"))?;
            Ok(next)
        })
    }

    fn quota(&self, name: &str) -> Result<Option<QuotaWindow>, LedgerError> {
        self.with_connection("read quota", |conn| load_quota(conn, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{Deduplicator, DuplicatePolicy};
    use crate::ledger::{Acceptance, Finding};
    use std::sync::Arc;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ledger.db")).unwrap();
        (dir, store)
    }

    fn target(address: &str) -> Target {
        Target::new(ContractId::new("ethereum", address).unwrap(), 2.5)
            .with_admin_control(AdminControl::Multisig)
    }

    #[test]
    fn create_and_reload_session() {
        let (_dir, store) = temp_store();
        let created = store.create_with_ref(&target("0xAB"), "jobs/42").unwrap();
        assert_eq!(created.state, SessionState::Pending);
        assert_eq!(created.service_ref(), "jobs/42");

        let reopened = SqliteStore::open(store.path()).unwrap();
        let loaded = reopened.get(&created.id).unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.target.contract.to_string(), "ethereum:0xab");
        assert_eq!(loaded.target.admin_control, AdminControl::Multisig);
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            created.created_at.timestamp_micros()
        );
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.get("missing").unwrap_err(),
            LedgerError::NotFound(id) if id == "missing"
        ));
        assert!(matches!(
            store
                .update_state("missing", SessionState::Running)
                .unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[test]
    fn transitions_persist_and_reject_reversals() {
        let (_dir, store) = temp_store();
        let session = store.create(&target("0x01")).unwrap();
        store
            .update_state(&session.id, SessionState::Running)
            .unwrap();
        let done = store
            .update_state(&session.id, SessionState::Completed)
            .unwrap();
        assert!(done.completed_at.is_some());

        for illegal in SessionState::ALL {
            let err = store.update_state(&session.id, illegal).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        }
        let stored = store.get(&session.id).unwrap();
        assert_eq!(stored.state, SessionState::Completed);
        assert_eq!(
            stored.completed_at.map(|at| at.timestamp_micros()),
            done.completed_at.map(|at| at.timestamp_micros())
        );
    }

    #[test]
    fn concurrent_conflicting_transitions_apply_once() {
        let (_dir, store) = temp_store();
        let session = store.create(&target("0x02")).unwrap();
        let handles: Vec<_> = (0..6)
            .map(|n| {
                let store = store.clone();
                let id = session.id.clone();
                let next = if n % 2 == 0 {
                    SessionState::Completed
                } else {
                    SessionState::Failed
                };
                std::thread::spawn(move || store.update_state(&id, next).is_ok())
            })
            .collect();
        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(applied, 1);
        assert!(store.get(&session.id).unwrap().state.is_terminal());
    }

    #[test]
    fn listing_is_creation_ordered_and_filtered() {
        let (_dir, store) = temp_store();
        let ids: Vec<_> = (0..5)
            .map(|n| store.create(&target(&format!("0x1{n}"))).unwrap().id)
            .collect();
        store.update_state(&ids[1], SessionState::Failed).unwrap();
        store.update_state(&ids[3], SessionState::Failed).unwrap();

        let all: Vec<_> = store
            .list(None)
            .with_page_size(2)
            .map(|s| s.unwrap().id)
            .collect();
        assert_eq!(all, ids);

        let failed: Vec<_> = store
            .list(Some(SessionState::Failed))
            .map(|s| s.unwrap().id)
            .collect();
        assert_eq!(failed, vec![ids[1].clone(), ids[3].clone()]);
    }

    #[test]
    fn retry_creates_new_session_once() {
        let (_dir, store) = temp_store();
        let session = store.create(&target("0x03")).unwrap();
        assert!(matches!(
            store.retry(&session.id).unwrap_err(),
            LedgerError::InvalidTransition {
                from: SessionState::Pending,
                ..
            }
        ));
        store
            .update_state(&session.id, SessionState::Failed)
            .unwrap();
        let retry = store.retry(&session.id).unwrap();
        assert_ne!(retry.id, session.id);
        assert_eq!(retry.target.contract, session.target.contract);
        assert_eq!(store.get(&session.id).unwrap().state, SessionState::Failed);
        assert!(matches!(
            store.retry(&session.id).unwrap_err(),
            LedgerError::AlreadyRetried { retry_id, .. } if retry_id == retry.id
        ));
    }

    #[test]
    fn concurrent_ingest_across_handles_accepts_exactly_once() {
        let (_dir, store) = temp_store();
        let finding = Finding::new(
            ContractId::new("ethereum", "0xABCD").unwrap(),
            "Reentrancy",
            0.85,
            "session-a",
            "State written after external call in withdraw()",
        )
        .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|n| {
                // Separate handles behave like separate processes sharing the file.
                let dedup = Deduplicator::new(Arc::new(store.clone()));
                let mut finding = finding.clone();
                finding.session_id = format!("session-{n}");
                std::thread::spawn(move || dedup.ingest(&finding).unwrap())
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            outcomes
                .iter()
                .filter(|a| **a == Acceptance::Accepted)
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|a| **a == Acceptance::Duplicate)
                .count(),
            7
        );
    }

    #[test]
    fn quota_survives_reopen() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let window = Duration::from_secs(3600);
        store.acquire("sessions", 2, window, now).unwrap();
        store.acquire("sessions", 2, window, now).unwrap();

        let reopened = SqliteStore::open(store.path()).unwrap();
        assert!(matches!(
            reopened.acquire("sessions", 2, window, now).unwrap_err(),
            LedgerError::QuotaExhausted { .. }
        ));
        let stored = reopened.quota("sessions").unwrap().unwrap();
        assert_eq!(stored.used, 2);
        assert_eq!(stored.remaining(), 0);

        let later = now + chrono::Duration::hours(2);
        assert_eq!(reopened.acquire("sessions", 2, window, later).unwrap().used, 1);
    }
    #[test]
    fn upgrade_policy_applies_confidence_guard_in_sql() {
        let (_dir, store) = temp_store();
        let dedup = Deduplicator::with_policy(
            Arc::new(store.clone()),
            DuplicatePolicy::UpgradeConfidence { min_gain: 0.2 },
        );
        let report = |session: &str, confidence: f64| {
            Finding::new(
                ContractId::new("ethereum", "0xABCD").unwrap(),
                "Oracle manipulation",
                confidence,
                session,
                "spot price read from a single pool",
            )
            .unwrap()
        };
        let stored_confidence = || {
            dedup
                .lookup(&report("any", 0.5))
                .unwrap()
                .unwrap()
                .confidence
        };

        assert_eq!(
            dedup.ingest(&report("s-1", 0.50)).unwrap(),
            Acceptance::Accepted
        );

        assert_eq!(
            dedup.ingest(&report("s-2", 0.65)).unwrap(),
            Acceptance::Duplicate
        );
        assert!((stored_confidence() - 0.50).abs() < f64::EPSILON);

        assert_eq!(
            dedup.ingest(&report("s-3", 0.30)).unwrap(),
            Acceptance::Duplicate
        );
        assert!((stored_confidence() - 0.50).abs() < f64::EPSILON);

        assert_eq!(
            dedup.ingest(&report("s-4", 0.80)).unwrap(),
            Acceptance::Duplicate
        );
        assert!((stored_confidence() - 0.80).abs() < f64::EPSILON);

        let reopened = SqliteStore::open(store.path()).unwrap();
        let record = reopened
            .get_fingerprint(&report("any", 0.5).fingerprint())
            .unwrap()
            .unwrap();
        assert_eq!(record.session_id, "s-1");
        assert!((record.confidence - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn harvest_marker_persists_and_is_set_once() {
        let (_dir, store) = temp_store();
        let session = store.create(&target("0x04")).unwrap();
        assert!(matches!(
            store.mark_harvested(&session.id).unwrap_err(),
            LedgerError::SessionNotCompleted {
                state: SessionState::Pending,
                ..
            }
        ));

        store
            .update_state(&session.id, SessionState::Completed)
            .unwrap();
        assert!(store.get(&session.id).unwrap().harvested_at.is_none());
        let marked = store.mark_harvested(&session.id).unwrap();
        let first = marked.harvested_at.map(|at| at.timestamp_micros());
        assert!(first.is_some());

        let reopened = SqliteStore::open(store.path()).unwrap();
        let again = reopened.mark_harvested(&session.id).unwrap();
        assert_eq!(again.harvested_at.map(|at| at.timestamp_micros()), first);
    }

    #[test]
    fn ledgers_without_harvest_marker_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let conn = Connection::open(&path).unwrap();
            let legacy = SCHEMA.replace(",\n    harvested_at_us INTEGER", "");
            conn.execute_batch(&legacy).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let session = store.create(&target("0x05")).unwrap();
        store
            .update_state(&session.id, SessionState::Completed)
            .unwrap();
        assert!(store.mark_harvested(&session.id).unwrap().harvested_at.is_some());
        SqliteStore::open(&path).unwrap();
    }

    #[test]
    fn failed_insert_does_not_consume_quota() {
        let (_dir, store) = temp_store();
        let policy = QuotaPolicy {
            name: QuotaPolicy::SESSIONS.to_string(),
            limit: 3,
            window: Duration::from_secs(3600),
        };
        let (failed, window) = store
            .insert_within_quota(NewSession::new(target("0x06")), &policy)
            .unwrap();
        assert_eq!(window.used, 1);
        store.update_state(&failed.id, SessionState::Failed).unwrap();
        let (retry, window) = store
            .insert_within_quota(
                NewSession {
                    retry_of: Some(failed.id.clone()),
                    ..NewSession::new(target("0x06"))
                },
                &policy,
            )
            .unwrap();
        assert_eq!(window.used, 2);

        let err = store
            .insert_within_quota(
                NewSession {
                    retry_of: Some(failed.id.clone()),
                    ..NewSession::new(target("0x06"))
                },
                &policy,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AlreadyRetried { retry_id, .. } if retry_id == retry.id
        ));
        assert_eq!(store.quota(&policy.name).unwrap().unwrap().used, 2);

        let (_, window) = store
            .insert_within_quota(NewSession::new(target("0x07")), &policy)
            .unwrap();
        assert_eq!(window.used, 3);
        assert!(matches!(
            store
                .insert_within_quota(NewSession::new(target("0x08")), &policy)
                .unwrap_err(),
            LedgerError::QuotaExhausted { .. }
        ));
        let sessions = store.list(None).count();
        assert_eq!(sessions, 3);
    }

    #[test]
    fn quota_window_must_be_whole_seconds() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        for window in [Duration::from_millis(500), Duration::from_millis(1_500)] {
            assert!(matches!(
                store.acquire("sessions", 2, window, now).unwrap_err(),
                LedgerError::Backend(_)
            ));
        }
        assert!(store.quota("sessions").unwrap().is_none());
    }

    #[test]
    fn negative_stored_window_is_reported() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        store
            .acquire("sessions", 2, Duration::from_secs(60), now)
            .unwrap();
        Connection::open(store.path())
            .unwrap()
            .execute("UPDATE quota_windows SET window_secs = -5", [])
            .unwrap();
        assert!(matches!(
            store.quota("sessions").unwrap_err(),
            LedgerError::Backend(_)
        ));
    }
}
