use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LedgerError;

/// Usage counter for a rate-limited resource (e.g. daily scan sessions) with
/// its own reset lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub name: String,
    pub limit: u32,
    #[serde(with = "humantime_duration")]
    pub window: Duration,
    pub window_start: DateTime<Utc>,
    pub used: u32,
}

impl QuotaWindow {
    pub fn fresh(name: &str, limit: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            limit,
            window,
            window_start: now,
            used: 0,
        }
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| self.window_start.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    /// The window as it stands at `now`, rolled over if it has expired.
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        if now >= self.resets_at() {
            Self::fresh(&self.name, self.limit, self.window, now)
        } else {
            self.clone()
        }
    }

    /// Consume one slot from `current` (or a fresh window) at `now`.
    ///
    /// `limit` and `window` come from the caller's policy so a changed policy
    /// takes effect on the next acquisition.
    pub fn acquire(
        current: Option<QuotaWindow>,
        name: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaWindow, LedgerError> {
        let mut next = match current {
            Some(mut existing) => {
                existing.limit = limit;
                existing.window = window;
                existing.at(now)
            }
            None => Self::fresh(name, limit, window, now),
        };
        if next.used >= next.limit {
            return Err(LedgerError::QuotaExhausted {
                name: name.to_string(),
                resets_at: next.resets_at(),
            });
        }
        next.used += 1;
        Ok(next)
    }
}

/// Storage for quota windows. `acquire` must be atomic across processes.
pub trait QuotaStore: Send + Sync {
    fn acquire(
        &self,
        name: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaWindow, LedgerError>;

    fn quota(&self, name: &str) -> Result<Option<QuotaWindow>, LedgerError>;
}

/// Quota configuration handed to whoever schedules new sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub name: String,
    pub limit: u32,
    pub window: Duration,
}

impl QuotaPolicy {
    pub const SESSIONS: &'static str = "sessions";

    pub fn daily_sessions(limit: u32) -> Self {
        Self {
            name: Self::SESSIONS.to_string(),
            limit,
            window: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn acquire(&self, store: &dyn QuotaStore) -> Result<QuotaWindow, LedgerError> {
        store.acquire(&self.name, self.limit, self.window, Utc::now())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn acquires_until_limit() {
        let mut window = None;
        for expected in 1..=3 {
            let next = QuotaWindow::acquire(window, "sessions", 3, DAY, at(1)).unwrap();
            assert_eq!(next.used, expected);
            window = Some(next);
        }
        let err = QuotaWindow::acquire(window, "sessions", 3, DAY, at(2)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::QuotaExhausted { resets_at, .. }
                if resets_at == Utc.with_ymd_and_hms(2025, 1, 2, 1, 0, 0).unwrap()
        ));
    }

    #[test]
    fn policy_acquires_from_any_store() {
        let store = crate::ledger::memory_store::MemoryStore::new();
        let policy = QuotaPolicy::daily_sessions(1);
        assert_eq!(policy.acquire(&store).unwrap().used, 1);
        assert!(matches!(
            policy.acquire(&store).unwrap_err(),
            LedgerError::QuotaExhausted { .. }
        ));
        assert_eq!(store.quota(QuotaPolicy::SESSIONS).unwrap().unwrap().used, 1);
    }

    #[test]
    fn window_resets_after_duration() {
        let exhausted = QuotaWindow {
            name: "sessions".into(),
            limit: 1,
            window: Duration::from_secs(3600),
            window_start: at(1),
            used: 1,
        };
        assert_eq!(exhausted.remaining(), 0);
        let next = QuotaWindow::acquire(
            Some(exhausted),
            "sessions",
            1,
            Duration::from_secs(3600),
            at(2),
        )
        .unwrap();
        assert_eq!(next.used, 1);
        assert_eq!(next.window_start, at(2));
    }

    #[test]
    fn raised_limit_applies_to_current_window() {
        let full = QuotaWindow {
            name: "sessions".into(),
            limit: 1,
            window: DAY,
            window_start: at(0),
            used: 1,
        };
        let next = QuotaWindow::acquire(Some(full), "sessions", 2, DAY, at(3)).unwrap();
        assert_eq!(next.used, 2);
        assert_eq!(next.window_start, at(0));
    }

    #[test]
    fn serializes_window_as_humantime() {
        let window = QuotaWindow::fresh("sessions", 100, DAY, at(0));
        let value = serde_json::to_value(&window).unwrap();
        assert_eq!(value["window"], serde_json::json!("1day"));
    }
}
