//! Git integration for graphsync.
//!
//! [`GitGraphProvider`] implements [`GraphProvider`] on top of one background
//! `std::thread` per repository. Each thread holds its `git2::Repository` for
//! its lifetime; Repository is !Send, so it never crosses a thread boundary.
//! Continuation cursors are walk positions rendered as decimal strings.

pub mod types;
pub mod worker;

use std::collections::HashMap;

use async_trait::async_trait;
use crossbeam_channel::Sender;
use graphsync_core::types::{RowKind, WorkingTreeStats};
use log::{debug, error};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::CommitOrdering;
use crate::git::types::GitRequest;
use crate::protocol::SearchQuery;
use crate::provider::{CommitDetails, GraphPage, GraphProvider, ProviderError, SearchError, SearchPage};

fn parse_cursor(cursor: &str) -> Result<usize, ProviderError> {
    cursor
        .parse()
        .map_err(|_| ProviderError::Unavailable(format!("malformed cursor `{cursor}`")))
}

/// Graph rows, search and working-tree state read straight from git.
#[derive(Default)]
pub struct GitGraphProvider {
    workers: Mutex<HashMap<String, Sender<GitRequest>>>,
}

impl GitGraphProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the worker for `repo_path`, starting it on first use.
    fn worker(&self, repo_path: &str) -> Result<Sender<GitRequest>, ProviderError> {
        let mut workers = self.workers.lock();
        if let Some(tx) = workers.get(repo_path) {
            return Ok(tx.clone());
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let path = repo_path.to_owned();
        std::thread::Builder::new()
            .name("git-worker".to_owned())
            .spawn(move || worker::git_worker_loop(path, rx))
            .map_err(|e| {
                error!("cannot start git worker for {repo_path}: {e}");
                ProviderError::WorkerGone
            })?;
        debug!("started git worker for {repo_path}");
        workers.insert(repo_path.to_owned(), tx.clone());
        Ok(tx)
    }

    async fn request<T>(
        &self,
        repo_path: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> GitRequest + Send,
    ) -> Result<T, ProviderError>
    where
        T: Send,
    {
        let (reply, rx) = oneshot::channel();
        let sent = self.worker(repo_path)?.send(build(reply));
        if sent.is_err() {
            // The worker exited, most likely because the repository could not
            // be opened. Forget it so the next call starts a fresh one.
            self.workers.lock().remove(repo_path);
            return Err(ProviderError::WorkerGone);
        }
        rx.await.map_err(|_| ProviderError::WorkerGone)
    }
}

#[async_trait]
impl GraphProvider for GitGraphProvider {
    async fn fetch_graph_page(
        &self,
        repo_path: &str,
        anchor: Option<&str>,
        limit: usize,
        ordering: CommitOrdering,
    ) -> Result<GraphPage, ProviderError> {
        let anchor = anchor.map(str::to_owned);
        let page = self
            .request(repo_path, |reply| GitRequest::Page { anchor, offset: 0, limit, ordering, reply })
            .await??;
        Ok(page)
    }

    async fn fetch_more(
        &self,
        repo_path: &str,
        cursor: &str,
        limit: usize,
        anchor: Option<&str>,
        ordering: CommitOrdering,
    ) -> Result<Option<GraphPage>, ProviderError> {
        let offset = parse_cursor(cursor)?;
        let anchor = anchor.map(str::to_owned);
        let page = self
            .request(repo_path, |reply| GitRequest::Page { anchor, offset, limit, ordering, reply })
            .await??;
        Ok((!page.rows.is_empty()).then_some(page))
    }

    async fn search_commits(
        &self,
        repo_path: &str,
        query: &SearchQuery,
        limit: usize,
        cursor: Option<&str>,
        ordering: CommitOrdering,
        token: &CancellationToken,
    ) -> Result<SearchPage, SearchError> {
        let offset = cursor.map(parse_cursor).transpose()?.unwrap_or(0);
        let query = query.clone();
        let token = token.clone();
        self.request(repo_path, |reply| GitRequest::Search { query, offset, limit, ordering, token, reply })
            .await?
    }

    async fn working_tree_stats(&self, repo_path: &str) -> Result<WorkingTreeStats, ProviderError> {
        let stats = self
            .request(repo_path, |reply| GitRequest::WorkingTreeStats { reply })
            .await??;
        Ok(stats)
    }

    async fn resolve_row(
        &self,
        repo_path: &str,
        id: &str,
        kind: RowKind,
    ) -> Result<Option<CommitDetails>, ProviderError> {
        let id = id.to_owned();
        let details = self
            .request(repo_path, |reply| GitRequest::ResolveRow { id, kind, reply })
            .await??;
        Ok(details)
    }
}
