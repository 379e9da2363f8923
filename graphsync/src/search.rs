//! Commit search sessions and the state machine that owns them.
//!
//! ```text
//! Idle ──begin_query──▶ Searching ──ok──▶ Ready ──begin_more──▶ Expanding ──▶ Ready
//!                           └──err──▶ Failed
//! ```
//!
//! Every in-flight fetch is tracked by a ticket and a [`CancellationToken`].
//! Starting a new query cancels the previous token, and a completion whose
//! ticket is no longer current is rejected without touching state.

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::protocol::{SearchMatch, SearchPaging, SearchQuery, SearchResults};
use crate::provider::{SearchError, SearchPage};
use crate::window::{GraphWindow, RowPresence};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSession {
    query: SearchQuery,
    comparison_key: String,
    results: IndexMap<String, SearchMatch>,
    cursor: Option<String>,
    has_more: bool,
}

impl SearchSession {
    pub fn new(query: SearchQuery, page: SearchPage) -> Self {
        let comparison_key = query.comparison_key();
        let mut session = SearchSession {
            query,
            comparison_key,
            results: IndexMap::new(),
            cursor: None,
            has_more: false,
        };
        session.extend(page);
        session
    }

    /// Appends a further page. Indices continue from the current count and ids
    /// already matched keep their original index.
    pub fn extend(&mut self, page: SearchPage) {
        for (id, date) in page.matches {
            let i = self.results.len();
            self.results.entry(id).or_insert(SearchMatch { i, date });
        }
        self.cursor = page.cursor;
        self.has_more = page.has_more;
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn comparison_key(&self) -> &str {
        &self.comparison_key
    }

    pub fn results(&self) -> &IndexMap<String, SearchMatch> {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn last_result_id(&self) -> Option<&str> {
        self.results.last().map(|(id, _)| id.as_str())
    }

    /// Result payload for a fresh query. An empty session reports `count: 0`.
    pub fn to_results(&self) -> SearchResults {
        if self.results.is_empty() {
            return SearchResults::Found { ids: IndexMap::new(), count: 0, paging: None };
        }
        SearchResults::Found {
            ids: self.results.clone(),
            count: self.results.len(),
            paging: Some(SearchPaging { has_more: self.has_more }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPhase {
    #[default]
    Idle,
    Searching,
    Ready,
    Expanding,
    Failed,
}

/// Outcome of finishing a fresh query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ready,
    /// Error text for the surface.
    Failed(&'static str),
    /// Cancelled or overtaken by a newer query. Nothing was stored.
    Cancelled,
}

/// A handle on an outstanding search fetch.
#[derive(Debug, Clone)]
pub struct SearchTicket {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct SearchMachine {
    session: Option<SearchSession>,
    phase: SearchPhase,
    in_flight: Option<SearchTicket>,
    next_ticket: u64,
}

impl SearchMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn session(&self) -> Option<&SearchSession> {
        self.session.as_ref()
    }

    /// Whether `key` names the current session.
    pub fn is_current(&self, key: &str) -> bool {
        self.session.as_ref().is_some_and(|s| s.comparison_key == key)
    }

    pub fn in_flight(&self) -> Option<&SearchTicket> {
        self.in_flight.as_ref()
    }

    fn issue(&mut self) -> SearchTicket {
        if let Some(previous) = self.in_flight.take() {
            previous.token.cancel();
        }
        self.next_ticket += 1;
        let ticket = SearchTicket { id: self.next_ticket, token: CancellationToken::new() };
        self.in_flight = Some(ticket.clone());
        ticket
    }

    fn owns(&self, ticket: &SearchTicket) -> bool {
        self.in_flight.as_ref().is_some_and(|t| t.id == ticket.id) && !ticket.token.is_cancelled()
    }

    /// Enters `Searching` for a new query, cancelling whatever was in flight.
    pub fn begin_query(&mut self) -> SearchTicket {
        self.session = None;
        self.phase = SearchPhase::Searching;
        self.issue()
    }

    pub fn complete_query(
        &mut self,
        ticket: &SearchTicket,
        query: SearchQuery,
        result: Result<SearchPage, SearchError>,
    ) -> Completion {
        if !self.owns(ticket) {
            return Completion::Cancelled;
        }
        self.in_flight = None;
        match result {
            Ok(page) => {
                self.session = Some(SearchSession::new(query, page));
                self.phase = SearchPhase::Ready;
                Completion::Ready
            }
            Err(SearchError::Cancelled) => {
                self.phase = SearchPhase::Idle;
                Completion::Cancelled
            }
            Err(SearchError::InvalidQuery(_)) => {
                self.session = None;
                self.phase = SearchPhase::Failed;
                Completion::Failed(crate::protocol::INVALID_SEARCH_PATTERN)
            }
            Err(SearchError::Unexpected(_)) => {
                self.session = None;
                self.phase = SearchPhase::Failed;
                Completion::Failed(crate::protocol::UNEXPECTED_SEARCH_ERROR)
            }
        }
    }

    /// Enters `Expanding` when `key` names a ready session with more matches.
    /// Returns the ticket, the session's query and its continuation cursor.
    pub fn begin_more(&mut self, key: &str) -> Option<(SearchTicket, SearchQuery, Option<String>)> {
        if self.phase != SearchPhase::Ready {
            return None;
        }
        let session = self.session.as_ref().filter(|s| s.comparison_key == key && s.has_more)?;
        let query = session.query.clone();
        let cursor = session.cursor.clone();
        self.phase = SearchPhase::Expanding;
        Some((self.issue(), query, cursor))
    }

    /// Extends the session in place. Returns `false` if the expansion was
    /// overtaken or failed, in which case the session is left as it was.
    pub fn complete_more(&mut self, ticket: &SearchTicket, result: Result<SearchPage, SearchError>) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        self.in_flight = None;
        self.phase = SearchPhase::Ready;
        match (result, self.session.as_mut()) {
            (Ok(page), Some(session)) => {
                session.extend(page);
                true
            }
            _ => false,
        }
    }

    /// Drops the session and cancels any outstanding fetch.
    pub fn dismiss(&mut self) {
        if let Some(ticket) = self.in_flight.take() {
            ticket.token.cancel();
        }
        self.session = None;
        self.phase = SearchPhase::Idle;
    }
}

/// Where the first reachable match of a search stands against a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCheck {
    /// No matches at all.
    Empty,
    InRange(String),
    /// Load more rows anchored on this id, then check again.
    Expand(String),
    /// Every match is skipped.
    Unreachable,
}

/// Walks matches in discovery order. Skipped ids are passed over; the first
/// id that is neither known nor skipped is the expansion target.
pub fn first_reachable<'a, I>(ids: I, window: &GraphWindow) -> StartCheck
where
    I: IntoIterator<Item = &'a String>,
{
    let mut any = false;
    for id in ids {
        any = true;
        match window.presence(id) {
            RowPresence::Known => return StartCheck::InRange(id.clone()),
            RowPresence::Skipped => continue,
            RowPresence::Missing => return StartCheck::Expand(id.clone()),
        }
    }
    if any {
        StartCheck::Unreachable
    } else {
        StartCheck::Empty
    }
}
