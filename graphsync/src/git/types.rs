//! Owned request types for the git worker thread, plus search query parsing.
//!
//! Every request carries a `oneshot` reply sender, so the async side can await
//! exactly the answer to its own request while the worker processes requests
//! in order.

use graphsync_core::types::{RowKind, WorkingTreeStats};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::CommitOrdering;
use crate::protocol::SearchQuery;
use crate::provider::{CommitDetails, GraphPage, SearchError, SearchPage};

/// Row id of the synthetic working-tree row.
pub const WORK_DIR_ID: &str = "0000000000000000000000000000000000000000";

/// Commands sent to the worker that owns a repository.
#[derive(Debug)]
pub enum GitRequest {
    /// Rows from walk position `offset`. The anchor row is always included.
    Page {
        anchor: Option<String>,
        offset: usize,
        limit: usize,
        ordering: CommitOrdering,
        reply: oneshot::Sender<Result<GraphPage, git2::Error>>,
    },
    /// Up to `limit` matches, scanning from walk position `offset`.
    Search {
        query: SearchQuery,
        offset: usize,
        limit: usize,
        ordering: CommitOrdering,
        token: CancellationToken,
        reply: oneshot::Sender<Result<SearchPage, SearchError>>,
    },
    WorkingTreeStats {
        reply: oneshot::Sender<Result<WorkingTreeStats, git2::Error>>,
    },
    ResolveRow {
        id: String,
        kind: RowKind,
        reply: oneshot::Sender<Result<Option<CommitDetails>, git2::Error>>,
    },
}

/// Which part of a commit a search term is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOperator {
    Message,
    Author,
    /// Id prefix.
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub operator: SearchOperator,
    pub value: String,
}

/// Splits on whitespace, keeping double-quoted runs together.
fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in query.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses a search string into terms.
///
/// `message:`/`=:`, `author:`/`@:` and `commit:`/`#:` select an operator; bare
/// words search the message. Operators with no value are dropped.
pub fn parse_query(query: &str) -> Vec<SearchTerm> {
    tokenize(query)
        .into_iter()
        .filter_map(|token| {
            let (operator, value) = match token.split_once(':') {
                Some(("message" | "=", value)) => (SearchOperator::Message, value.to_owned()),
                Some(("author" | "@", value)) => (SearchOperator::Author, value.to_owned()),
                Some(("commit" | "#", value)) => (SearchOperator::Commit, value.to_owned()),
                _ => (SearchOperator::Message, token),
            };
            (!value.is_empty()).then_some(SearchTerm { operator, value })
        })
        .collect()
}
