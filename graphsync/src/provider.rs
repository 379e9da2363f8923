//! Contracts for the collaborators the session controller calls.
//!
//! Every collaborator is an `async_trait` object held behind an `Arc`, so the
//! controller never knows whether rows come from git2, a test fake, or
//! something else entirely. All of them are bundled in [`Collaborators`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use graphsync_core::db::StorageError;
use graphsync_core::types::{
    BannerKey, ColumnConfig, ColumnName, GraphRow, HiddenRef, RowKind, RowRef, WorkingTreeStats,
};
use tokio_util::sync::CancellationToken;

use crate::config::CommitOrdering;
use crate::protocol::{GraphAccess, PullRequestMetadata, RepositoryInfo, SearchQuery};

/// Failure of a provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("repository `{0}` is not available")]
    Unavailable(String),
    #[error("the git worker thread has exited")]
    WorkerGone,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Git(#[from] git2::Error),
}

/// Failure of a commit search.
///
/// Only `InvalidQuery` and `Unexpected` ever reach the surface, worded
/// differently. `Cancelled` is swallowed.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
    #[error("search cancelled")]
    Cancelled,
    #[error(transparent)]
    Unexpected(#[from] ProviderError),
}

/// One page of graph rows.
///
/// For an initial load `rows` is the whole window; for a continuation it holds
/// only the rows after the previous page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphPage {
    pub repo_path: String,
    pub rows: Vec<GraphRow>,
    /// Ids that exist upstream but are deliberately not rendered.
    pub skipped_ids: HashSet<String>,
    pub avatars: BTreeMap<String, String>,
    /// Opaque continuation cursor for the next page.
    pub cursor: Option<String>,
    pub has_more: bool,
    /// Row the page was anchored on, once resolved.
    pub selected_id: Option<String>,
}

/// One page of search matches, in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// `(row id, commit date)` pairs.
    pub matches: Vec<(String, i64)>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Details of a selected row, handed to the host's details view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDetails {
    pub id: String,
    pub kind: RowKind,
    pub author: String,
    pub email: String,
    pub date: i64,
    pub message: String,
    pub parents: Vec<String>,
}

#[async_trait]
pub trait GraphProvider: Send + Sync {
    /// Loads the first window of rows in `ordering`, anchored on `anchor`
    /// (the current head when `None`). The anchor row is always included, even
    /// past `limit`.
    async fn fetch_graph_page(
        &self,
        repo_path: &str,
        anchor: Option<&str>,
        limit: usize,
        ordering: CommitOrdering,
    ) -> Result<GraphPage, ProviderError>;

    /// Loads the page after `cursor`. `Ok(None)` means the continuation produced
    /// nothing even though more was advertised.
    async fn fetch_more(
        &self,
        repo_path: &str,
        cursor: &str,
        limit: usize,
        anchor: Option<&str>,
        ordering: CommitOrdering,
    ) -> Result<Option<GraphPage>, ProviderError>;

    /// Searches commits. Implementations must observe `token` and return
    /// [`SearchError::Cancelled`] promptly once it fires.
    async fn search_commits(
        &self,
        repo_path: &str,
        query: &SearchQuery,
        limit: usize,
        cursor: Option<&str>,
        ordering: CommitOrdering,
        token: &CancellationToken,
    ) -> Result<SearchPage, SearchError>;

    async fn working_tree_stats(&self, repo_path: &str) -> Result<WorkingTreeStats, ProviderError>;

    async fn resolve_row(
        &self,
        repo_path: &str,
        id: &str,
        kind: RowKind,
    ) -> Result<Option<CommitDetails>, ProviderError>;
}

#[async_trait]
pub trait AvatarProvider: Send + Sync {
    /// Resolves an image reference for `email`. `sample_id` is a row authored
    /// by that email, for providers that look avatars up per commit.
    async fn resolve_avatar(
        &self,
        repo_path: &str,
        email: &str,
        sample_id: &str,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait RefMetadataProvider: Send + Sync {
    async fn pull_request_for(
        &self,
        repo_path: &str,
        ref_id: &str,
    ) -> Result<Option<PullRequestMetadata>, ProviderError>;
}

/// Per-workspace persisted state.
#[async_trait]
pub trait WorkspaceStorage: Send + Sync {
    async fn load_hidden_refs(&self) -> Result<BTreeMap<String, HiddenRef>, ProviderError>;
    async fn update_hidden_refs(&self, refs: Vec<HiddenRef>, visible: bool) -> Result<(), ProviderError>;
    async fn load_columns(&self) -> Result<BTreeMap<ColumnName, ColumnConfig>, ProviderError>;
    async fn save_column(&self, name: ColumnName, config: ColumnConfig) -> Result<(), ProviderError>;
    async fn load_dismissed_banners(&self) -> Result<Vec<BannerKey>, ProviderError>;
    async fn dismiss_banner(&self, key: BannerKey) -> Result<(), ProviderError>;
}

/// The surrounding application: repository list, licensing and UI commands.
#[async_trait]
pub trait Host: Send + Sync {
    async fn repositories(&self) -> Vec<RepositoryInfo>;
    async fn access(&self, repo_path: Option<&str>) -> Result<GraphAccess, ProviderError>;
    async fn has_connected_remotes(&self, repo_path: &str) -> bool;
    /// Switches to `target`, or lets the user pick a branch when `None`.
    async fn switch_to(&self, repo_path: &str, target: Option<RowRef>);
    async fn open_search(&self, repo_path: &str, query: SearchQuery);
    async fn show_commit_details(&self, details: CommitDetails, preserve_visibility: bool);
}

/// Everything the controller calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub graph: Arc<dyn GraphProvider>,
    pub avatars: Arc<dyn AvatarProvider>,
    pub ref_metadata: Arc<dyn RefMetadataProvider>,
    pub storage: Arc<dyn WorkspaceStorage>,
    pub host: Arc<dyn Host>,
}
