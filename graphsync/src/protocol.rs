//! Typed request/notification protocol spoken with the rendering surface.
//!
//! Inbound messages are [`InboundMessage`]s carrying a [`Request`]; outbound ones
//! are [`OutboundMessage`]s carrying a [`Notification`]. Both serialize as
//! `{ id, method, params, completionId? }` objects.

use std::collections::{BTreeMap, HashMap};

use graphsync_core::types::{
    BannerKey, ColumnConfig, ColumnName, ColumnSettings, GraphRow, HiddenRef, RowKind, RowRef,
    WorkingTreeStats,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};

/// Wire form of the selection: a set-as-map so multi-selection can be added later.
pub type SelectedRows = BTreeMap<String, bool>;

/// One selected row as reported by the surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RowKind,
}

/// A repository the host has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub id: String,
    pub name: String,
    pub formatted_name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryVisibility {
    Public,
    Private,
    Local,
}

/// Continuation state of the loaded window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_cursor: Option<String>,
    pub has_more: bool,
}

/// A commit search as typed by the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub match_all: bool,
    #[serde(default)]
    pub match_case: bool,
    #[serde(default)]
    pub match_regex: bool,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Self::default() }
    }

    /// Normalized identity of the query.
    ///
    /// Surrounding whitespace and runs of inner whitespace do not change what a
    /// query matches, so they do not change the key. Flags do.
    pub fn comparison_key(&self) -> String {
        let normalized = self.query.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut flags = String::new();
        if self.match_all {
            flags.push('A');
        }
        if self.match_case {
            flags.push('C');
        }
        if self.match_regex {
            flags.push('R');
        }
        format!("{normalized}|{flags}")
    }
}

/// Position of one search match: discovery index and commit date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub i: usize,
    pub date: i64,
}

/// Kinds of per-ref metadata the surface may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefMetadataKind {
    PullRequests,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestMetadata {
    pub hosting_service_type: String,
    pub id: u64,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
    pub state: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamMetadata {
    pub name: String,
    pub ahead: usize,
    pub behind: usize,
}

/// Fetch state of one metadata kind.
///
/// `Absent` is the cached "looked it up, there is none" answer, kept distinct
/// from `NotFetched` so a missing pull request is not re-queried every time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MetadataSlot<T> {
    #[default]
    NotFetched,
    Absent,
    Present(T),
}

impl<T> MetadataSlot<T> {
    pub fn is_not_fetched(&self) -> bool {
        matches!(self, MetadataSlot::NotFetched)
    }

    pub fn is_present(&self) -> bool {
        matches!(self, MetadataSlot::Present(_))
    }
}

impl<T: Serialize> Serialize for MetadataSlot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetadataSlot::Present(value) => value.serialize(serializer),
            MetadataSlot::Absent | MetadataSlot::NotFetched => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefMetadata {
    #[serde(skip_serializing_if = "MetadataSlot::is_not_fetched")]
    pub pull_requests: MetadataSlot<Vec<PullRequestMetadata>>,
    #[serde(skip_serializing_if = "MetadataSlot::is_not_fetched")]
    pub upstream: MetadataSlot<UpstreamMetadata>,
}

/// Metadata for every ref the surface asked about.
///
/// `Disabled` (no connected remotes) goes out as `null`; `Unfetched` is left
/// out of payloads entirely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RefsMetadata {
    Disabled,
    #[default]
    Unfetched,
    Fetched(BTreeMap<String, RefMetadata>),
}

impl RefsMetadata {
    pub fn is_unfetched(&self) -> bool {
        matches!(self, RefsMetadata::Unfetched)
    }
}

impl Serialize for RefsMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RefsMetadata::Fetched(map) => map.serialize(serializer),
            RefsMetadata::Disabled | RefsMetadata::Unfetched => serializer.serialize_none(),
        }
    }
}

/// Options forwarded to the graph component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub avatars: bool,
    pub date_format: String,
    pub date_style: String,
    pub enable_multi_selection: bool,
    pub highlight_rows_on_ref_hover: bool,
    pub show_ghost_refs_on_row_hover: bool,
    pub show_remote_names_on_refs: bool,
    pub id_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub plan: String,
    #[serde(default)]
    pub preview_trial: bool,
}

/// Result of an access check for the graph feature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GraphAccess {
    pub allowed: bool,
    pub subscription: Subscription,
    pub visibility: Option<RepositoryVisibility>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateContext {
    pub header: String,
}

/// The complete state snapshot sent on bootstrap and on every full refresh.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_banner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_banner: Option<bool>,
    pub repositories: Vec<RepositoryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_repository_visibility: Option<RepositoryVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_rows: Option<SelectedRows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatars: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "RefsMetadata::is_unfetched")]
    pub refs_metadata: RefsMetadata,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<GraphRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ComponentConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<StateContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_refs: Option<BTreeMap<String, HiddenRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_tree_stats: Option<WorkingTreeStats>,
}

impl GraphState {
    /// State reported when there is no repository to show.
    pub fn empty() -> Self {
        Self { allowed: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsChangedParams {
    pub rows: Vec<GraphRow>,
    pub avatars: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "RefsMetadata::is_unfetched")]
    pub refs_metadata: RefsMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_rows: Option<SelectedRows>,
    pub paging: Paging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPaging {
    pub has_more: bool,
}

pub const INVALID_SEARCH_PATTERN: &str = "Invalid search pattern";
pub const UNEXPECTED_SEARCH_ERROR: &str = "Unexpected error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SearchResults {
    Found {
        #[serde(skip_serializing_if = "IndexMap::is_empty")]
        ids: IndexMap<String, SearchMatch>,
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        paging: Option<SearchPaging>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<SearchResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_rows: Option<SelectedRows>,
}

/// Notification types, used as keys of the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    DidChangeState,
    DidChangeRows,
    DidChangeAvatars,
    DidChangeColumns,
    DidChangeRefsVisibility,
    DidChangeRefsMetadata,
    DidChangeConfiguration,
    DidChangeSelection,
    DidChangeSubscription,
    DidChangeWorkingTree,
    DidSearch,
    DidEnsureRow,
}

impl NotificationType {
    /// Whether queued instances of this type collapse to the latest one.
    pub fn overwriteable(self) -> bool {
        matches!(
            self,
            NotificationType::DidChangeColumns
                | NotificationType::DidChangeRefsVisibility
                | NotificationType::DidChangeConfiguration
                | NotificationType::DidChangeSelection
                | NotificationType::DidChangeSubscription
                | NotificationType::DidChangeWorkingTree
        )
    }

    /// Whether the controller can rebuild this notification from current state
    /// at flush time instead of storing a payload.
    pub fn regenerable(self) -> bool {
        self.overwriteable() || self == NotificationType::DidChangeState
    }
}

/// A state-change notification posted to the surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum Notification {
    #[serde(rename = "graph/didChange")]
    DidChangeState { state: Box<GraphState> },
    #[serde(rename = "graph/rows/didChange")]
    DidChangeRows(RowsChangedParams),
    #[serde(rename = "graph/avatars/didChange")]
    DidChangeAvatars { avatars: BTreeMap<String, String> },
    #[serde(rename = "graph/columns/didChange")]
    DidChangeColumns { columns: ColumnSettings, context: String },
    #[serde(rename = "graph/refs/didChangeVisibility", rename_all = "camelCase")]
    DidChangeRefsVisibility { hidden_refs: Option<BTreeMap<String, HiddenRef>> },
    #[serde(rename = "graph/refs/didChangeMetadata")]
    DidChangeRefsMetadata { metadata: RefsMetadata },
    #[serde(rename = "graph/configuration/didChange")]
    DidChangeConfiguration { config: ComponentConfig },
    #[serde(rename = "graph/selection/didChange")]
    DidChangeSelection { selection: SelectedRows },
    #[serde(rename = "graph/subscription/didChange")]
    DidChangeSubscription { subscription: Subscription, allowed: bool },
    #[serde(rename = "graph/workingTree/didChange")]
    DidChangeWorkingTree { stats: WorkingTreeStats },
    #[serde(rename = "graph/didSearch")]
    DidSearch(SearchResultParams),
    #[serde(rename = "graph/didEnsureRow")]
    DidEnsureRow { id: Option<String> },
}

impl Notification {
    pub fn kind(&self) -> NotificationType {
        match self {
            Notification::DidChangeState { .. } => NotificationType::DidChangeState,
            Notification::DidChangeRows(_) => NotificationType::DidChangeRows,
            Notification::DidChangeAvatars { .. } => NotificationType::DidChangeAvatars,
            Notification::DidChangeColumns { .. } => NotificationType::DidChangeColumns,
            Notification::DidChangeRefsVisibility { .. } => NotificationType::DidChangeRefsVisibility,
            Notification::DidChangeRefsMetadata { .. } => NotificationType::DidChangeRefsMetadata,
            Notification::DidChangeConfiguration { .. } => NotificationType::DidChangeConfiguration,
            Notification::DidChangeSelection { .. } => NotificationType::DidChangeSelection,
            Notification::DidChangeSubscription { .. } => NotificationType::DidChangeSubscription,
            Notification::DidChangeWorkingTree { .. } => NotificationType::DidChangeWorkingTree,
            Notification::DidSearch(_) => NotificationType::DidSearch,
            Notification::DidEnsureRow { .. } => NotificationType::DidEnsureRow,
        }
    }
}

/// A notification stamped with its message id and optional correlation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: u64,
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_id: Option<String>,
}

/// Requests the surface sends to the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "graph/dismissBanner")]
    DismissBanner { key: BannerKey },
    #[serde(rename = "graph/rows/ensure")]
    EnsureRow { id: String },
    #[serde(rename = "graph/avatars/get")]
    GetMissingAvatars { emails: HashMap<String, String> },
    #[serde(rename = "graph/refs/metadata/get")]
    GetMissingRefsMetadata { metadata: HashMap<String, Vec<RefMetadataKind>> },
    #[serde(rename = "graph/rows/get")]
    GetMoreRows {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "graph/search")]
    Search {
        #[serde(default)]
        search: Option<SearchQuery>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        more: bool,
    },
    #[serde(rename = "graph/search/openInView")]
    SearchOpenInView { search: SearchQuery },
    #[serde(rename = "graph/column/update")]
    UpdateColumn { name: ColumnName, config: ColumnConfig },
    #[serde(rename = "graph/refs/update/visibility")]
    UpdateRefsVisibility { refs: Vec<HiddenRef>, visible: bool },
    #[serde(rename = "graph/ref/doubleClick")]
    DoubleClickedRef {
        #[serde(rename = "ref")]
        reference: RowRef,
    },
    #[serde(rename = "graph/repository/update/selection")]
    UpdateSelectedRepository { path: String },
    #[serde(rename = "graph/selection/update")]
    UpdateSelection { selection: Vec<SelectedRow> },
}

impl Request {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Request::DismissBanner { .. } => "graph/dismissBanner",
            Request::EnsureRow { .. } => "graph/rows/ensure",
            Request::GetMissingAvatars { .. } => "graph/avatars/get",
            Request::GetMissingRefsMetadata { .. } => "graph/refs/metadata/get",
            Request::GetMoreRows { .. } => "graph/rows/get",
            Request::Search { .. } => "graph/search",
            Request::SearchOpenInView { .. } => "graph/search/openInView",
            Request::UpdateColumn { .. } => "graph/column/update",
            Request::UpdateRefsVisibility { .. } => "graph/refs/update/visibility",
            Request::DoubleClickedRef { .. } => "graph/ref/doubleClick",
            Request::UpdateSelectedRepository { .. } => "graph/repository/update/selection",
            Request::UpdateSelection { .. } => "graph/selection/update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
    #[serde(default)]
    pub completion_id: Option<String>,
}

/// Lifecycle messages the surface sends about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum LifecycleMessage {
    #[serde(rename = "webview/ready")]
    Ready,
    #[serde(rename = "webview/didChangeVisibility")]
    VisibilityChanged { visible: bool },
}
