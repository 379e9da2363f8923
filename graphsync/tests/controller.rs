//! Session controller scenarios against recording fakes.
//!
//! Every test runs on a paused tokio clock: `settle()` lets spawned work run
//! to completion without firing any debounce, and `sleep(LONG)` lets every
//! debounce fire.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use graphsync::channel::MessageChannel;
use graphsync::config::{CommitOrdering, GraphConfig};
use graphsync::controller::SessionController;
use graphsync::event::{HostEvent, RepositoryChange};
use graphsync::protocol::{
    GraphAccess, InboundMessage, MetadataSlot, Notification, NotificationType, OutboundMessage,
    PullRequestMetadata, RefMetadataKind, RefsMetadata, RepositoryInfo, RepositoryVisibility, SearchQuery,
    SearchResultParams, SearchResults, SelectedRow, Subscription, INVALID_SEARCH_PATTERN,
    UNEXPECTED_SEARCH_ERROR,
};
use graphsync::provider::{
    AvatarProvider, Collaborators, CommitDetails, GraphPage, GraphProvider, Host, ProviderError,
    RefMetadataProvider, SearchError, SearchPage, WorkspaceStorage,
};
use graphsync::search::SearchPhase;
use graphsync::selection::{HideTarget, RefItem, RefItemKind};
use graphsync::theme::ThemeKind;
use graphsync_core::types::{
    BannerKey, ColumnConfig, ColumnName, GraphRow, HiddenRef, RefType, RowKind, RowRef, WorkingTreeStats,
};
use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const REPO: &str = "/work/app";
const LONG: Duration = Duration::from_secs(1);

// ---- fakes ------------------------------------------------------------------

fn row(id: &str) -> GraphRow {
    GraphRow {
        id: id.to_owned(),
        kind: RowKind::Commit,
        parents: Vec::new(),
        author: "Ada".to_owned(),
        email: "ada@example.com".to_owned(),
        date: 0,
        message: format!("commit {id}"),
        refs: Vec::new(),
    }
}

fn page(ids: &[&str], has_more: bool) -> GraphPage {
    GraphPage {
        repo_path: REPO.to_owned(),
        rows: ids.iter().map(|id| row(id)).collect(),
        cursor: ids.last().map(|last| format!("after-{last}")),
        has_more,
        ..GraphPage::default()
    }
}

fn initial(ids: &[&str], has_more: bool) -> GraphPage {
    GraphPage { selected_id: ids.first().map(|id| id.to_string()), ..page(ids, has_more) }
}

fn matches(ids: &[&str], has_more: bool) -> SearchPage {
    SearchPage {
        matches: ids.iter().map(|id| (id.to_string(), 0)).collect(),
        cursor: has_more.then(|| ids.len().to_string()),
        has_more,
    }
}

#[derive(Default)]
struct FakeGraph {
    initial: Mutex<GraphPage>,
    more: Mutex<VecDeque<GraphPage>>,
    /// When set, `fetch_more` waits for a permit before answering.
    more_gate: Mutex<Option<Arc<Notify>>>,
    searches: Mutex<HashMap<String, VecDeque<SearchPage>>>,
    page_calls: AtomicUsize,
    page_orderings: Mutex<Vec<CommitOrdering>>,
    more_calls: Mutex<Vec<(String, Option<String>)>>,
    search_calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeGraph {
    fn push_more(&self, page: GraphPage) {
        self.more.lock().unwrap().push_back(page);
    }

    fn add_search(&self, query: &str, pages: Vec<SearchPage>) {
        self.searches.lock().unwrap().insert(query.to_owned(), pages.into());
    }

    fn more_calls(&self) -> Vec<(String, Option<String>)> {
        self.more_calls.lock().unwrap().clone()
    }

    fn search_calls(&self) -> Vec<(String, Option<String>)> {
        self.search_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphProvider for FakeGraph {
    async fn fetch_graph_page(
        &self,
        _repo_path: &str,
        _anchor: Option<&str>,
        _limit: usize,
        ordering: CommitOrdering,
    ) -> Result<GraphPage, ProviderError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.page_orderings.lock().unwrap().push(ordering);
        Ok(self.initial.lock().unwrap().clone())
    }

    async fn fetch_more(
        &self,
        _repo_path: &str,
        cursor: &str,
        _limit: usize,
        anchor: Option<&str>,
        _ordering: CommitOrdering,
    ) -> Result<Option<GraphPage>, ProviderError> {
        self.more_calls
            .lock()
            .unwrap()
            .push((cursor.to_owned(), anchor.map(str::to_owned)));
        let gate = self.more_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.more.lock().unwrap().pop_front())
    }

    async fn search_commits(
        &self,
        _repo_path: &str,
        query: &SearchQuery,
        _limit: usize,
        cursor: Option<&str>,
        _ordering: CommitOrdering,
        token: &CancellationToken,
    ) -> Result<SearchPage, SearchError> {
        self.search_calls
            .lock()
            .unwrap()
            .push((query.query.clone(), cursor.map(str::to_owned)));
        match query.query.as_str() {
            "slow" => {
                token.cancelled().await;
                Err(SearchError::Cancelled)
            }
            "bad[" => Err(SearchError::InvalidQuery("unclosed character class".into())),
            "boom" => Err(SearchError::Unexpected(ProviderError::WorkerGone)),
            other => {
                let next = self.searches.lock().unwrap().get_mut(other).and_then(VecDeque::pop_front);
                Ok(next.unwrap_or_default())
            }
        }
    }

    async fn working_tree_stats(&self, _repo_path: &str) -> Result<WorkingTreeStats, ProviderError> {
        Ok(WorkingTreeStats { added: 1, deleted: 0, modified: 2 })
    }

    async fn resolve_row(
        &self,
        _repo_path: &str,
        id: &str,
        kind: RowKind,
    ) -> Result<Option<CommitDetails>, ProviderError> {
        Ok(Some(CommitDetails {
            id: id.to_owned(),
            kind,
            author: "Ada".into(),
            email: "ada@example.com".into(),
            date: 0,
            message: format!("commit {id}"),
            parents: Vec::new(),
        }))
    }
}

#[derive(Default)]
struct RecordingChannel {
    disconnected: AtomicBool,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingChannel {
    fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    async fn post(&self, message: &OutboundMessage) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(message.clone());
        true
    }
}

#[derive(Default)]
struct FakeStorage {
    hidden: Mutex<BTreeMap<String, HiddenRef>>,
    columns: Mutex<BTreeMap<ColumnName, ColumnConfig>>,
    banners: Mutex<Vec<BannerKey>>,
}

#[async_trait]
impl WorkspaceStorage for FakeStorage {
    async fn load_hidden_refs(&self) -> Result<BTreeMap<String, HiddenRef>, ProviderError> {
        Ok(self.hidden.lock().unwrap().clone())
    }

    async fn update_hidden_refs(&self, refs: Vec<HiddenRef>, visible: bool) -> Result<(), ProviderError> {
        let mut hidden = self.hidden.lock().unwrap();
        for r in refs {
            if visible {
                hidden.remove(&r.id);
            } else {
                hidden.insert(r.id.clone(), r);
            }
        }
        Ok(())
    }

    async fn load_columns(&self) -> Result<BTreeMap<ColumnName, ColumnConfig>, ProviderError> {
        Ok(self.columns.lock().unwrap().clone())
    }

    async fn save_column(&self, name: ColumnName, config: ColumnConfig) -> Result<(), ProviderError> {
        self.columns.lock().unwrap().insert(name, config);
        Ok(())
    }

    async fn load_dismissed_banners(&self) -> Result<Vec<BannerKey>, ProviderError> {
        Ok(self.banners.lock().unwrap().clone())
    }

    async fn dismiss_banner(&self, key: BannerKey) -> Result<(), ProviderError> {
        self.banners.lock().unwrap().push(key);
        Ok(())
    }
}

#[derive(Default)]
struct FakeHost {
    connected_remotes: AtomicBool,
    switches: Mutex<Vec<(String, Option<String>)>>,
    searches: Mutex<Vec<String>>,
    details: Mutex<Vec<(String, bool)>>,
}

fn repository() -> RepositoryInfo {
    RepositoryInfo {
        id: REPO.to_owned(),
        name: "app".to_owned(),
        formatted_name: "app".to_owned(),
        path: REPO.to_owned(),
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn repositories(&self) -> Vec<RepositoryInfo> {
        vec![repository()]
    }

    async fn access(&self, _repo_path: Option<&str>) -> Result<GraphAccess, ProviderError> {
        Ok(GraphAccess {
            allowed: true,
            subscription: Subscription { plan: "pro".into(), preview_trial: false },
            visibility: Some(RepositoryVisibility::Private),
        })
    }

    async fn has_connected_remotes(&self, _repo_path: &str) -> bool {
        self.connected_remotes.load(Ordering::SeqCst)
    }

    async fn switch_to(&self, repo_path: &str, target: Option<RowRef>) {
        self.switches
            .lock()
            .unwrap()
            .push((repo_path.to_owned(), target.map(|r| r.name)));
    }

    async fn open_search(&self, _repo_path: &str, query: SearchQuery) {
        self.searches.lock().unwrap().push(query.query);
    }

    async fn show_commit_details(&self, details: CommitDetails, preserve_visibility: bool) {
        self.details.lock().unwrap().push((details.id, preserve_visibility));
    }
}

#[derive(Default)]
struct FakeAvatars {
    calls: AtomicUsize,
}

#[async_trait]
impl AvatarProvider for FakeAvatars {
    async fn resolve_avatar(&self, _repo_path: &str, email: &str, _sample_id: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("img:{email}"))
    }
}

/// Branches named `pr-*` have an open pull request.
struct FakeRefMetadata;

#[async_trait]
impl RefMetadataProvider for FakeRefMetadata {
    async fn pull_request_for(
        &self,
        _repo_path: &str,
        ref_id: &str,
    ) -> Result<Option<PullRequestMetadata>, ProviderError> {
        Ok(ref_id.contains("pr-").then(|| PullRequestMetadata {
            hosting_service_type: "github".into(),
            id: 42,
            title: "Fix the graph".into(),
            author: "ada".into(),
            date: None,
            state: "opened".into(),
            url: "https://example.com/pr/42".into(),
        }))
    }
}

// ---- harness ----------------------------------------------------------------

struct Harness {
    controller: SessionController,
    graph: Arc<FakeGraph>,
    channel: Arc<RecordingChannel>,
    storage: Arc<FakeStorage>,
    host: Arc<FakeHost>,
    avatars: Arc<FakeAvatars>,
}

fn harness(first_page: GraphPage, connected_remotes: bool) -> Harness {
    let graph = Arc::new(FakeGraph::default());
    *graph.initial.lock().unwrap() = first_page;
    let channel = Arc::new(RecordingChannel::default());
    let storage = Arc::new(FakeStorage::default());
    let host = Arc::new(FakeHost::default());
    host.connected_remotes.store(connected_remotes, Ordering::SeqCst);
    let avatars = Arc::new(FakeAvatars::default());
    let collaborators = Collaborators {
        graph: graph.clone(),
        avatars: avatars.clone(),
        ref_metadata: Arc::new(FakeRefMetadata),
        storage: storage.clone(),
        host: host.clone(),
    };
    let controller = SessionController::new(collaborators, channel.clone(), GraphConfig::default());
    Harness { controller, graph, channel, storage, host, avatars }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Bootstraps, reports ready and drops everything sent so far.
async fn started(first_page: GraphPage) -> Harness {
    started_with_remotes(first_page, false).await
}

async fn started_with_remotes(first_page: GraphPage, connected_remotes: bool) -> Harness {
    let h = harness(first_page, connected_remotes);
    h.controller.bootstrap().await;
    settle().await;
    h.controller.on_ready().await;
    settle().await;
    h.channel.take();
    h
}

fn kinds(messages: &[OutboundMessage]) -> Vec<NotificationType> {
    messages.iter().map(|m| m.notification.kind()).collect()
}

fn search_reply<'a>(messages: &'a [OutboundMessage], completion_id: &str) -> &'a SearchResultParams {
    messages
        .iter()
        .find_map(|m| match &m.notification {
            Notification::DidSearch(params) if m.completion_id.as_deref() == Some(completion_id) => Some(params),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no search reply for {completion_id}"))
}

fn found_ids(params: &SearchResultParams) -> Vec<(String, usize)> {
    match &params.results {
        Some(SearchResults::Found { ids, .. }) => ids.iter().map(|(id, m)| (id.clone(), m.i)).collect(),
        other => panic!("expected found results, got {other:?}"),
    }
}

fn selected(id: &str) -> BTreeMap<String, bool> {
    BTreeMap::from([(id.to_owned(), true)])
}

fn selection(id: &str) -> Vec<SelectedRow> {
    vec![SelectedRow { id: id.to_owned(), kind: RowKind::Commit }]
}

// ---- bootstrap and delivery -------------------------------------------------

#[tokio::test(start_paused = true)]
async fn bootstrap_queues_state_then_visibility_then_rows_until_ready() {
    let h = harness(initial(&["c5", "c4", "c3"], true), false);
    h.controller.bootstrap().await;
    settle().await;

    assert_eq!(
        h.controller.pending_notifications(),
        vec![
            NotificationType::DidChangeState,
            NotificationType::DidChangeRefsVisibility,
            NotificationType::DidChangeRows,
        ]
    );
    assert!(h.channel.take().is_empty());

    h.controller.on_ready().await;
    let sent = h.channel.take();
    assert_eq!(
        kinds(&sent),
        vec![
            NotificationType::DidChangeState,
            NotificationType::DidChangeRefsVisibility,
            NotificationType::DidChangeRows,
        ]
    );
    match &sent[0].notification {
        Notification::DidChangeState { state } => {
            assert!(state.loading);
            assert_eq!(state.rows, None);
            assert_eq!(state.selected_repository.as_deref(), Some(REPO));
            assert_eq!(state.trial_banner, Some(true));
            assert_eq!(state.working_tree_stats, Some(WorkingTreeStats { added: 1, deleted: 0, modified: 2 }));
        }
        other => panic!("expected state, got {other:?}"),
    }
    match &sent[2].notification {
        Notification::DidChangeRows(params) => {
            let ids: Vec<_> = params.rows.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["c5", "c4", "c3"]);
            assert_eq!(params.selected_rows, Some(selected("c5")));
            assert!(params.paging.has_more);
        }
        other => panic!("expected rows, got {other:?}"),
    }
    assert!(h.controller.pending_notifications().is_empty());
    assert_eq!(h.controller.selected_id().as_deref(), Some("c5"));
}

#[tokio::test(start_paused = true)]
async fn hidden_surface_collapses_repeated_column_updates() {
    let h = started(initial(&["c5"], false)).await;
    h.controller.on_visibility_changed(false).await;

    h.controller
        .update_column(ColumnName::Sha, ColumnConfig { width: Some(100), is_hidden: None })
        .await;
    h.controller
        .update_column(ColumnName::Sha, ColumnConfig { width: Some(120), is_hidden: None })
        .await;
    assert_eq!(h.controller.pending_notifications(), vec![NotificationType::DidChangeColumns]);
    assert!(h.channel.take().is_empty());

    h.controller.on_visibility_changed(true).await;
    let sent = h.channel.take();
    assert_eq!(sent.len(), 1);
    match &sent[0].notification {
        Notification::DidChangeColumns { columns, .. } => assert_eq!(columns[&ColumnName::Sha].width, 120),
        other => panic!("expected columns, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn full_state_supersedes_everything_queued() {
    let h = started(initial(&["c5", "c4"], false)).await;
    h.controller.on_visibility_changed(false).await;

    h.controller
        .update_column(ColumnName::Author, ColumnConfig { width: None, is_hidden: Some(true) })
        .await;
    h.controller.update_refs_visibility(Vec::new(), false).await;
    h.controller.on_repository_changed(&[RepositoryChange::Heads], 1);
    tokio::time::sleep(LONG).await;
    assert_eq!(h.controller.pending_notifications(), vec![NotificationType::DidChangeState]);

    // The view was built before etag 1, so becoming visible rebuilds it.
    h.controller.on_visibility_changed(true).await;
    settle().await;
    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeState]);
    match &sent[0].notification {
        Notification::DidChangeState { state } => {
            assert!(!state.loading);
            assert_eq!(state.rows.as_ref().map(Vec::len), Some(2));
            assert_eq!(state.context.as_ref().map(|c| c.header.as_str()), Some("author"));
        }
        other => panic!("expected state, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_requeued_and_resent() {
    let h = started(initial(&["c5"], false)).await;
    h.channel.set_connected(false);
    h.controller.toggle_column(ColumnName::Datetime, false).await;
    assert_eq!(h.controller.pending_notifications(), vec![NotificationType::DidChangeColumns]);

    h.channel.set_connected(true);
    h.controller.on_visibility_changed(true).await;
    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeColumns]);
    assert_eq!(h.storage.columns.lock().unwrap()[&ColumnName::Datetime].is_hidden, Some(true));
}

#[tokio::test(start_paused = true)]
async fn requests_arrive_through_the_event_bus() {
    let h = started(initial(&["c5", "c4"], false)).await;
    let message: InboundMessage = serde_json::from_value(serde_json::json!({
        "id": 9,
        "method": "graph/rows/ensure",
        "params": { "id": "c4" },
        "completionId": "bus"
    }))
    .unwrap();
    h.controller.handle_event(HostEvent::Request(message)).await;
    settle().await;

    let sent = h.channel.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].notification, Notification::DidEnsureRow { id: Some("c4".into()) });
    assert_eq!(sent[0].completion_id.as_deref(), Some("bus"));
}

// ---- ensure row -------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ensure_row_for_a_loaded_id_never_fetches() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.controller.ensure_row("c4".into(), Some("e1".into())).await;
    h.controller.ensure_row("c4".into(), Some("e2".into())).await;

    assert!(h.graph.more_calls().is_empty());
    let sent = h.channel.take();
    assert_eq!(sent.len(), 2);
    for (message, completion) in sent.iter().zip(["e1", "e2"]) {
        assert_eq!(message.notification, Notification::DidEnsureRow { id: Some("c4".into()) });
        assert_eq!(message.completion_id.as_deref(), Some(completion));
    }
}

#[tokio::test(start_paused = true)]
async fn ensure_row_loads_one_page_anchored_on_the_target() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph.push_more(page(&["c2", "c1"], false));

    h.controller.ensure_row("c1".into(), Some("e".into())).await;

    assert_eq!(h.graph.more_calls(), vec![("after-c3".to_owned(), Some("c1".to_owned()))]);
    assert_eq!(h.controller.window_ids(), vec!["c5", "c4", "c3", "c2", "c1"]);
    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeRows, NotificationType::DidEnsureRow]);
    assert_eq!(sent[1].notification, Notification::DidEnsureRow { id: Some("c1".into()) });
    assert_eq!(sent[1].completion_id.as_deref(), Some("e"));
}

#[tokio::test(start_paused = true)]
async fn ensure_row_for_a_skipped_id_replies_none_without_fetching() {
    let first = GraphPage {
        skipped_ids: HashSet::from(["c9".to_owned()]),
        ..initial(&["c5", "c4"], true)
    };
    let h = started(first).await;
    h.controller.ensure_row("c9".into(), Some("e".into())).await;

    assert!(h.graph.more_calls().is_empty());
    let sent = h.channel.take();
    assert_eq!(sent[0].notification, Notification::DidEnsureRow { id: None });
}

#[tokio::test(start_paused = true)]
async fn ensure_row_replies_none_when_the_page_misses_the_target() {
    let h = started(initial(&["c5"], true)).await;
    h.graph.push_more(page(&["c4"], false));

    h.controller.ensure_row("c0".into(), Some("e".into())).await;

    assert_eq!(h.graph.more_calls().len(), 1);
    let sent = h.channel.take();
    assert_eq!(sent.last().unwrap().notification, Notification::DidEnsureRow { id: None });
}

#[tokio::test(start_paused = true)]
async fn ensure_row_before_any_window_replies_none() {
    let h = harness(initial(&["c5"], false), false);
    h.controller.on_ready().await;
    h.controller.ensure_row("c5".into(), Some("e".into())).await;

    let sent = h.channel.take();
    assert_eq!(sent[0].notification, Notification::DidEnsureRow { id: None });
    assert_eq!(h.graph.page_calls.load(Ordering::SeqCst), 0);
}

// ---- more rows --------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_view_gets_full_state_instead_of_a_page() {
    let h = started(initial(&["c5", "c4"], true)).await;
    h.controller.on_repository_changed(&[RepositoryChange::Heads], 7);

    h.controller.get_more_rows(None, false).await;
    settle().await;

    assert!(h.graph.more_calls().is_empty());
    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeState]);
    assert_eq!(h.graph.page_calls.load(Ordering::SeqCst), 2);

    // The debounced refresh from the repository change was superseded.
    tokio::time::sleep(LONG).await;
    assert!(h.channel.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn index_only_change_keeps_the_view_current() {
    let h = started(initial(&["c5", "c4"], true)).await;
    h.graph.push_more(page(&["c3"], false));
    h.controller.on_repository_changed(&[RepositoryChange::Index], 3);

    h.controller.get_more_rows(None, false).await;

    assert_eq!(h.graph.more_calls(), vec![("after-c4".to_owned(), None)]);
    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeRows]);
    tokio::time::sleep(LONG).await;
    assert!(h.channel.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn page_for_a_replaced_window_is_discarded() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    let gate = Arc::new(Notify::new());
    *h.graph.more_gate.lock().unwrap() = Some(gate.clone());
    h.graph.push_more(page(&["c2", "c1"], false));

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.get_more_rows(None, false).await });
    settle().await;
    assert_eq!(h.graph.more_calls().len(), 1);

    h.controller.refresh(false).await;
    settle().await;
    assert_eq!(h.controller.window_ids(), vec!["c5", "c4", "c3"]);

    gate.notify_one();
    pending.await.unwrap();
    assert_eq!(h.controller.window_ids(), vec!["c5", "c4", "c3"]);
}

#[tokio::test(start_paused = true)]
async fn overlapping_ensure_row_calls_share_one_fetch() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    let gate = Arc::new(Notify::new());
    *h.graph.more_gate.lock().unwrap() = Some(gate.clone());
    h.graph.push_more(page(&["c2", "c1"], false));

    let first = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.ensure_row("c1".into(), Some("a".into())).await })
    };
    let second = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.ensure_row("c1".into(), Some("b".into())).await })
    };
    settle().await;
    assert_eq!(h.graph.more_calls().len(), 1);

    gate.notify_one();
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(h.graph.more_calls(), vec![("after-c3".to_owned(), Some("c1".to_owned()))]);
    let sent = h.channel.take();
    for completion in ["a", "b"] {
        let reply = sent
            .iter()
            .find(|m| m.completion_id.as_deref() == Some(completion))
            .unwrap_or_else(|| panic!("no reply for {completion}"));
        assert_eq!(reply.notification, Notification::DidEnsureRow { id: Some("c1".into()) });
    }
}

// ---- search -----------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn search_selects_the_first_match_in_the_window() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph.add_search("fix", vec![matches(&["c4", "c3"], false)]);

    h.controller
        .search(Some(SearchQuery::new("fix")), None, false, Some("s".into()))
        .await;

    let sent = h.channel.take();
    let reply = search_reply(&sent, "s");
    assert_eq!(found_ids(reply), vec![("c4".to_owned(), 0), ("c3".to_owned(), 1)]);
    assert_eq!(reply.selected_rows, Some(selected("c4")));
    assert_eq!(h.controller.selected_id().as_deref(), Some("c4"));
    assert_eq!(h.controller.search_phase(), SearchPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn equivalent_queries_reuse_the_current_session() {
    let h = started(initial(&["c5", "c4"], false)).await;
    h.graph.add_search("fix bug", vec![matches(&["c4"], false)]);

    h.controller
        .search(Some(SearchQuery::new("fix bug")), None, false, Some("a".into()))
        .await;
    h.controller
        .search(Some(SearchQuery::new("  fix   bug ")), None, false, Some("b".into()))
        .await;

    assert_eq!(h.graph.search_calls().len(), 1);
    let sent = h.channel.take();
    assert_eq!(search_reply(&sent, "a").results, search_reply(&sent, "b").results);
}

#[tokio::test(start_paused = true)]
async fn more_extends_the_session_with_continuing_indices() {
    let h = started(initial(&["c5", "c4", "c3"], false)).await;
    h.graph
        .add_search("fix", vec![matches(&["c5"], true), matches(&["c3"], false)]);

    h.controller
        .search(Some(SearchQuery::new("fix")), None, false, Some("first".into()))
        .await;
    h.controller
        .search(Some(SearchQuery::new("fix")), None, true, Some("more".into()))
        .await;

    assert_eq!(
        h.graph.search_calls(),
        vec![("fix".to_owned(), None), ("fix".to_owned(), Some("1".to_owned()))]
    );
    let sent = h.channel.take();
    let reply = search_reply(&sent, "more");
    assert_eq!(found_ids(reply), vec![("c5".to_owned(), 0), ("c3".to_owned(), 1)]);
    assert_eq!(reply.selected_rows, None);
}

#[tokio::test(start_paused = true)]
async fn superseded_search_replies_empty() {
    let h = started(initial(&["c5", "c4"], false)).await;
    h.graph.add_search("fix", vec![matches(&["c4"], false)]);

    let controller = h.controller.clone();
    let slow = tokio::spawn(async move {
        controller
            .search(Some(SearchQuery::new("slow")), None, false, Some("a".into()))
            .await
    });
    settle().await;
    h.controller
        .search(Some(SearchQuery::new("fix")), None, false, Some("b".into()))
        .await;
    slow.await.unwrap();

    let sent = h.channel.take();
    assert_eq!(search_reply(&sent, "a").results, None);
    assert_eq!(found_ids(search_reply(&sent, "b")), vec![("c4".to_owned(), 0)]);
    let replies = sent.iter().filter(|m| m.notification.kind() == NotificationType::DidSearch).count();
    assert_eq!(replies, 2);
    assert_eq!(h.controller.search_phase(), SearchPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn invalid_and_unexpected_failures_are_worded_differently() {
    let h = started(initial(&["c5"], false)).await;

    h.controller
        .search(Some(SearchQuery::new("bad[")), None, false, Some("bad".into()))
        .await;
    assert_eq!(h.controller.search_phase(), SearchPhase::Failed);
    h.controller
        .search(Some(SearchQuery::new("boom")), None, false, Some("boom".into()))
        .await;

    let sent = h.channel.take();
    assert_eq!(
        search_reply(&sent, "bad").results,
        Some(SearchResults::Error { error: INVALID_SEARCH_PATTERN.to_owned() })
    );
    assert_eq!(
        search_reply(&sent, "boom").results,
        Some(SearchResults::Error { error: UNEXPECTED_SEARCH_ERROR.to_owned() })
    );
}

#[tokio::test(start_paused = true)]
async fn search_expands_the_window_to_reach_its_first_match() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph.add_search("deep", vec![matches(&["c1"], false)]);
    h.graph.push_more(page(&["c2", "c1"], false));

    h.controller
        .search(Some(SearchQuery::new("deep")), None, false, Some("s".into()))
        .await;

    assert_eq!(h.graph.more_calls(), vec![("after-c3".to_owned(), Some("c1".to_owned()))]);
    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeRows, NotificationType::DidSearch]);
    assert_eq!(search_reply(&sent, "s").selected_rows, Some(selected("c1")));
}

#[tokio::test(start_paused = true)]
async fn window_reaching_the_last_match_continues_the_search() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph
        .add_search("x", vec![matches(&["c4"], true), matches(&["c1"], false)]);
    h.controller
        .search(Some(SearchQuery::new("x")), None, false, Some("s".into()))
        .await;
    h.channel.take();

    h.graph.push_more(page(&["c2", "c1"], false));
    h.controller.get_more_rows(None, false).await;
    settle().await;

    assert_eq!(
        h.graph.search_calls(),
        vec![("x".to_owned(), None), ("x".to_owned(), Some("1".to_owned()))]
    );
    let sent = h.channel.take();
    let continued = sent
        .iter()
        .find_map(|m| match &m.notification {
            Notification::DidSearch(params) => Some(params),
            _ => None,
        })
        .expect("continued search results");
    assert_eq!(found_ids(continued), vec![("c4".to_owned(), 0), ("c1".to_owned(), 1)]);
}

#[tokio::test(start_paused = true)]
async fn continuation_never_restarts_a_search_the_user_replaced() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph.add_search("x", vec![matches(&["c4"], true), matches(&["c1"], false)]);
    h.controller.search(Some(SearchQuery::new("x")), None, false, None).await;
    h.channel.take();
    h.graph.push_more(page(&["c2", "c1"], false));

    // The page load queues a continuation of "x" before the new query starts.
    let controller = h.controller.clone();
    let more = tokio::spawn(async move { controller.get_more_rows(None, false).await });
    let controller = h.controller.clone();
    let replacement = tokio::spawn(async move {
        controller
            .search(Some(SearchQuery::new("slow")), None, false, Some("b".into()))
            .await
    });
    settle().await;
    more.await.unwrap();

    assert_eq!(
        h.graph.search_calls(),
        vec![("x".to_owned(), None), ("slow".to_owned(), None)]
    );
    assert!(!replacement.is_finished());
    assert_eq!(h.controller.search_phase(), SearchPhase::Searching);
    assert!(kinds(&h.channel.take()).iter().all(|k| *k != NotificationType::DidSearch));

    h.controller.search(None, None, false, None).await;
    replacement.await.unwrap();
    assert_eq!(search_reply(&h.channel.take(), "b").results, None);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_search_dismisses_the_session() {
    let h = started(initial(&["c5"], false)).await;
    h.graph.add_search("fix", vec![matches(&["c5"], false)]);
    h.controller
        .search(Some(SearchQuery::new("fix")), None, false, None)
        .await;
    h.controller.search(None, None, false, Some("clear".into())).await;

    assert_eq!(h.controller.search_phase(), SearchPhase::Idle);
    assert_eq!(search_reply(&h.channel.take(), "clear").results, None);
}

#[tokio::test(start_paused = true)]
async fn search_open_in_view_goes_to_the_host() {
    let h = started(initial(&["c5"], false)).await;
    h.controller.search_open_in_view(SearchQuery::new("author:ada")).await;
    assert_eq!(*h.host.searches.lock().unwrap(), vec!["author:ada".to_owned()]);
}

// ---- selection --------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn selection_burst_fires_once_with_the_latest_row() {
    let h = started(initial(&["c5", "c4", "c3"], false)).await;
    let mut events = h.controller.subscribe_selection();

    h.controller.update_selection(selection("c4"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.controller.update_selection(selection("c3"));
    tokio::time::sleep(LONG).await;

    let event = events.try_recv().unwrap();
    assert_eq!(event.id.as_deref(), Some("c3"));
    assert!(event.first);
    assert_eq!(event.details.map(|d| d.id).as_deref(), Some("c3"));
    assert!(events.try_recv().is_err());
    assert_eq!(*h.host.details.lock().unwrap(), vec![("c3".to_owned(), false)]);

    h.controller.update_selection(selection("c5"));
    tokio::time::sleep(LONG).await;
    assert!(!events.try_recv().unwrap().first);
}

#[tokio::test(start_paused = true)]
async fn unchanged_selection_fires_nothing() {
    let h = started(initial(&["c5", "c4"], false)).await;
    let mut events = h.controller.subscribe_selection();

    h.controller.update_selection(selection("c5"));
    tokio::time::sleep(LONG).await;

    assert!(events.try_recv().is_err());
    assert!(h.host.details.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn show_in_graph_selects_loaded_rows_and_fetches_missing_ones() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;

    h.controller.show_in_graph(REPO, "c4".into()).await;
    let sent = h.channel.take();
    assert_eq!(sent[0].notification, Notification::DidChangeSelection { selection: selected("c4") });

    h.graph.push_more(page(&["c2", "c1"], false));
    h.controller.show_in_graph(REPO, "c1".into()).await;
    assert_eq!(h.graph.more_calls(), vec![("after-c3".to_owned(), Some("c1".to_owned()))]);
    match &h.channel.take()[0].notification {
        Notification::DidChangeRows(params) => assert_eq!(params.selected_rows, Some(selected("c1"))),
        other => panic!("expected rows, got {other:?}"),
    }
}

// ---- refs -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hiding_a_whole_remote_stores_the_wildcard() {
    let h = started(initial(&["c5"], false)).await;
    let id = format!("{REPO}|remotes/origin/feature");
    let target = HideTarget::Ref(RefItem {
        id: id.clone(),
        name: "origin/feature".into(),
        kind: RefItemKind::RemoteBranch,
    });

    h.controller.hide_refs(&target, true).await;

    let expected = HiddenRef {
        id: id.clone(),
        ref_type: RefType::Remote,
        name: "*".into(),
        owner: Some("origin".into()),
    };
    assert_eq!(h.storage.hidden.lock().unwrap().get(&id), Some(&expected));
    match &h.channel.take()[0].notification {
        Notification::DidChangeRefsVisibility { hidden_refs } => {
            assert_eq!(hidden_refs.as_ref().and_then(|refs| refs.get(&id)), Some(&expected));
        }
        other => panic!("expected refs visibility, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hidden_refs_of_other_repositories_are_not_sent() {
    let h = started(initial(&["c5"], false)).await;
    let foreign = HiddenRef {
        id: "/elsewhere|tags/v1".into(),
        ref_type: RefType::Tag,
        name: "v1".into(),
        owner: None,
    };
    h.controller.update_refs_visibility(vec![foreign], false).await;

    match &h.channel.take()[0].notification {
        Notification::DidChangeRefsVisibility { hidden_refs } => {
            assert_eq!(hidden_refs.as_ref().map(BTreeMap::len), Some(0));
        }
        other => panic!("expected refs visibility, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn double_clicking_the_current_head_offers_a_switch() {
    let h = started(initial(&["c5"], false)).await;
    let head = RowRef {
        id: format!("{REPO}|heads/main"),
        name: "main".into(),
        ref_type: RefType::Head,
        owner: None,
        is_current_head: true,
    };
    let other = RowRef { id: format!("{REPO}|heads/feature"), name: "feature".into(), is_current_head: false, ..head.clone() };

    h.controller.double_clicked_ref(head).await;
    h.controller.double_clicked_ref(other).await;

    assert_eq!(
        *h.host.switches.lock().unwrap(),
        vec![(REPO.to_owned(), None), (REPO.to_owned(), Some("feature".to_owned()))]
    );
}

#[tokio::test(start_paused = true)]
async fn refs_metadata_caches_absent_pull_requests() {
    let h = started_with_remotes(initial(&["c5"], false), true).await;
    let pr_branch = format!("{REPO}|heads/pr-7");
    let main = format!("{REPO}|heads/main");
    let request = HashMap::from([
        (pr_branch.clone(), vec![RefMetadataKind::PullRequests, RefMetadataKind::Upstream]),
        (main.clone(), vec![RefMetadataKind::PullRequests]),
    ]);

    h.controller.get_missing_refs_metadata(request).await;
    tokio::time::sleep(LONG).await;

    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeRefsMetadata]);
    let Notification::DidChangeRefsMetadata { metadata: RefsMetadata::Fetched(map) } = &sent[0].notification else {
        panic!("expected fetched metadata, got {:?}", sent[0].notification);
    };
    assert!(map[&pr_branch].pull_requests.is_present());
    assert_eq!(map[&pr_branch].upstream, MetadataSlot::Absent);
    assert_eq!(map[&main].pull_requests, MetadataSlot::Absent);
}

#[tokio::test(start_paused = true)]
async fn refs_metadata_is_disabled_without_connected_remotes() {
    let h = started(initial(&["c5"], false)).await;
    let request = HashMap::from([(format!("{REPO}|heads/pr-7"), vec![RefMetadataKind::PullRequests])]);

    h.controller.get_missing_refs_metadata(request).await;
    tokio::time::sleep(LONG).await;
    assert!(h.channel.take().is_empty());

    h.host.connected_remotes.store(true, Ordering::SeqCst);
    h.controller.on_connected_remotes_changed(true);
    tokio::time::sleep(LONG).await;
    let sent = h.channel.take();
    assert_eq!(sent[0].notification, Notification::DidChangeRefsMetadata { metadata: RefsMetadata::Unfetched });
}

// ---- avatars, banners, host changes -----------------------------------------

#[tokio::test(start_paused = true)]
async fn missing_avatars_are_resolved_once() {
    let h = started(initial(&["c5", "c4"], false)).await;
    let emails = HashMap::from([
        ("ada@example.com".to_owned(), "c5".to_owned()),
        ("bob@example.com".to_owned(), "c4".to_owned()),
    ]);

    h.controller.get_missing_avatars(emails.clone()).await;
    tokio::time::sleep(LONG).await;
    let sent = h.channel.take();
    match &sent[0].notification {
        Notification::DidChangeAvatars { avatars } => {
            assert_eq!(avatars.get("bob@example.com").map(String::as_str), Some("img:bob@example.com"));
            assert_eq!(avatars.len(), 2);
        }
        other => panic!("expected avatars, got {other:?}"),
    }

    h.controller.get_missing_avatars(emails).await;
    tokio::time::sleep(LONG).await;
    assert_eq!(h.avatars.calls.load(Ordering::SeqCst), 2);
    assert!(h.channel.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dismissed_banner_stays_dismissed_across_refresh() {
    let h = started(initial(&["c5"], false)).await;
    h.controller.dismiss_banner(BannerKey::Trial).await;
    assert_eq!(*h.storage.banners.lock().unwrap(), vec![BannerKey::Trial]);

    h.controller.refresh(false).await;
    settle().await;
    match &h.channel.take()[0].notification {
        Notification::DidChangeState { state } => {
            assert_eq!(state.trial_banner, Some(false));
            assert_eq!(state.preview_banner, Some(true));
        }
        other => panic!("expected state, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn component_config_change_is_sent_without_a_refresh() {
    let h = started(initial(&["c5"], false)).await;
    let next = GraphConfig { abbreviated_sha_length: 12, ..GraphConfig::default() };

    h.controller.on_configuration_changed(next).await;
    tokio::time::sleep(LONG).await;

    let sent = h.channel.take();
    assert_eq!(kinds(&sent), vec![NotificationType::DidChangeConfiguration]);
    match &sent[0].notification {
        Notification::DidChangeConfiguration { config } => assert_eq!(config.id_length, 12),
        other => panic!("expected configuration, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn ordering_change_reloads_the_graph_in_the_new_order() {
    let h = started(initial(&["c5", "c4"], false)).await;
    assert_eq!(*h.graph.page_orderings.lock().unwrap(), vec![CommitOrdering::Date]);
    let next = GraphConfig { commit_ordering: CommitOrdering::AuthorDate, ..GraphConfig::default() };

    h.controller.on_configuration_changed(next).await;
    settle().await;
    assert!(h.channel.take().is_empty());
    tokio::time::sleep(LONG).await;

    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeState]);
    assert_eq!(
        *h.graph.page_orderings.lock().unwrap(),
        vec![CommitOrdering::Date, CommitOrdering::AuthorDate]
    );
}

#[tokio::test(start_paused = true)]
async fn theme_change_within_the_same_class_is_ignored() {
    let h = started(initial(&["c5"], false)).await;

    h.controller.on_theme_changed(ThemeKind::Dark);
    tokio::time::sleep(LONG).await;
    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeState]);

    h.controller.on_theme_changed(ThemeKind::HighContrastDark);
    tokio::time::sleep(LONG).await;
    assert!(h.channel.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn subscription_change_is_sent_once_per_etag() {
    let h = started(initial(&["c5"], false)).await;
    h.controller.on_subscription_changed(4).await;
    h.controller.on_subscription_changed(4).await;

    let sent = h.channel.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].notification,
        Notification::DidChangeSubscription {
            subscription: Subscription { plan: "pro".into(), preview_trial: false },
            allowed: true,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn working_tree_changes_only_count_for_the_current_repository() {
    let h = started(initial(&["c5"], false)).await;
    h.controller.on_file_system_changed("/elsewhere").await;
    assert!(h.channel.take().is_empty());

    h.controller.on_file_system_changed(REPO).await;
    assert_eq!(
        h.channel.take()[0].notification,
        Notification::DidChangeWorkingTree { stats: WorkingTreeStats { added: 1, deleted: 0, modified: 2 } }
    );
}

#[tokio::test(start_paused = true)]
async fn becoming_visible_with_an_outdated_view_refreshes_immediately() {
    let h = started(initial(&["c5", "c4"], true)).await;
    h.controller.on_visibility_changed(false).await;
    h.controller.on_repository_changed(&[RepositoryChange::Heads], 3);

    h.controller.on_visibility_changed(true).await;
    settle().await;

    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeState]);
    assert_eq!(h.graph.page_calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(LONG).await;
    assert!(h.channel.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn switching_repositories_resets_search_and_selection() {
    let h = started(initial(&["c5", "c4", "c3"], true)).await;
    h.graph.add_search("fix", vec![matches(&["c4"], false)]);
    h.controller.search(Some(SearchQuery::new("fix")), None, false, None).await;
    assert_eq!(h.controller.search_phase(), SearchPhase::Ready);

    h.controller.update_selected_repository("/elsewhere").await;

    assert_eq!(h.controller.search_phase(), SearchPhase::Idle);
    assert_eq!(h.controller.selected_id(), None);
    assert!(h.controller.window_ids().is_empty());
    h.channel.take();

    // With nothing selected the refresh falls back to the first open repository.
    tokio::time::sleep(LONG).await;
    assert_eq!(kinds(&h.channel.take()), vec![NotificationType::DidChangeState]);
    assert_eq!(h.controller.repository(), Some(repository()));
    assert_eq!(h.controller.window_ids(), vec!["c5", "c4", "c3"]);
}
