use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{LedgerError, Session, SessionState, SessionStore};

const DEFAULT_PAGE_SIZE: usize = 64;

/// Keyset position within the creation-ordered session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageToken {
    pub created_at_us: i64,
    pub seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    /// Position of the last returned session; `None` once the log is exhausted.
    pub next: Option<PageToken>,
}

/// Lazy iterator over sessions in `created_at` order.
///
/// Pages are fetched from the store only as the iterator is drained, so
/// sessions created while iterating are picked up if they sort after the
/// current position. Call [`SessionListing::restart`] to begin again from the
/// oldest session.
pub struct SessionListing<'a> {
    store: &'a dyn SessionStore,
    filter: Option<SessionState>,
    page_size: usize,
    buffer: VecDeque<Session>,
    position: Option<PageToken>,
    exhausted: bool,
}

impl<'a> SessionListing<'a> {
    pub fn new(store: &'a dyn SessionStore, filter: Option<SessionState>) -> Self {
        Self {
            store,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            position: None,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.buffer.clear();
        self.position = None;
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), LedgerError> {
        let page = self
            .store
            .list_page(self.filter, self.position.as_ref(), self.page_size)?;
        if page.sessions.len() < self.page_size || page.next.is_none() {
            self.exhausted = true;
        }
        if page.next.is_some() {
            self.position = page.next;
        }
        self.buffer.extend(page.sessions);
        Ok(())
    }
}

impl Iterator for SessionListing<'_> {
    type Item = Result<Session, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
