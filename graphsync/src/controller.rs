//! The session controller.
//!
//! One [`SessionController`] serves one rendering surface. It owns the session
//! state (window, search, selection, refs metadata) behind a `parking_lot`
//! mutex that is never held across an await, answers surface requests, reacts
//! to host events and routes every outbound notification through the
//! [`Outbox`].
//!
//! Work that would otherwise re-enter the controller from inside itself (the
//! full state refresh and the automatic search continuation) is posted to a
//! follow-up task instead of being awaited in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use graphsync_core::types::{
    hidden_columns_context, resolve_column_settings, BannerKey, ColumnConfig, ColumnName, HiddenRef,
    RefType, RowKind, RowRef, WorkingTreeStats,
};
use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

use crate::channel::MessageChannel;
use crate::config::{CommitOrdering, GraphConfig};
use crate::debounce::Debouncer;
use crate::dispatch::{Outbox, Pending};
use crate::event::{HostCommand, HostEvent, RepositoryChange};
use crate::protocol::{
    GraphState, InboundMessage, LifecycleMessage, MetadataSlot, Notification, NotificationType,
    RefMetadata, RefMetadataKind, RefsMetadata, RepositoryInfo, Request, RowsChangedParams,
    SearchQuery, SearchResultParams, SearchResults, SelectedRow, SelectedRows, StateContext,
};
use crate::provider::{Collaborators, GraphPage, ProviderError, SearchError, SearchPage};
use crate::search::{first_reachable, Completion, SearchMachine, SearchPhase, SearchSession, SearchTicket, StartCheck};
use crate::selection::{
    filter_hidden_refs, normalize_hidden_refs, preserve_visibility, HideTarget, SelectionChangeEvent,
    SelectionState,
};
use crate::theme::ThemeKind;
use crate::window::{GraphWindow, RowPresence};

/// Work posted back to the controller by its own operations.
#[derive(Debug)]
enum Followup {
    State,
    /// Extend the session with this comparison key, if it is still current.
    SearchMore(String),
}

#[derive(Debug)]
struct SessionState {
    config: GraphConfig,
    repository: Option<RepositoryInfo>,
    /// Latest etag the host reported for the repository.
    repository_etag: u64,
    /// Etag the surface's view was built from.
    etag_repository: Option<u64>,
    etag_subscription: Option<u64>,
    theme: Option<ThemeKind>,
    window: Option<GraphWindow>,
    /// Bumped on every window replacement; pages fetched against an older
    /// generation are discarded.
    window_generation: u64,
    search: SearchMachine,
    selection: SelectionState,
    has_connected_remotes: bool,
    refs_metadata_disabled: bool,
    refs_metadata: Option<BTreeMap<String, RefMetadata>>,
    preview_banner: Option<bool>,
    trial_banner: Option<bool>,
}

impl SessionState {
    fn new(config: GraphConfig) -> Self {
        Self {
            config,
            repository: None,
            repository_etag: 0,
            etag_repository: None,
            etag_subscription: None,
            theme: None,
            window: None,
            window_generation: 0,
            search: SearchMachine::new(),
            selection: SelectionState::default(),
            has_connected_remotes: false,
            refs_metadata_disabled: true,
            refs_metadata: None,
            preview_banner: None,
            trial_banner: None,
        }
    }

    fn is_stale(&self) -> bool {
        self.etag_repository != Some(self.repository_etag)
    }

    fn repo_path(&self) -> Option<String> {
        self.repository.as_ref().map(|r| r.path.clone())
    }

    fn set_window(&mut self, window: Option<GraphWindow>) {
        self.window_generation += 1;
        let cleared = window.is_none();
        self.window = window;
        if cleared {
            self.reset_refs_metadata();
            self.search.dismiss();
        }
    }

    fn reset_repository_state(&mut self) {
        self.set_window(None);
        self.selection.set(None);
    }

    fn reset_refs_metadata(&mut self) -> RefsMetadata {
        self.refs_metadata_disabled = !self.has_connected_remotes;
        self.refs_metadata = None;
        self.refs_metadata()
    }

    fn refs_metadata(&self) -> RefsMetadata {
        if self.refs_metadata_disabled {
            return RefsMetadata::Disabled;
        }
        match &self.refs_metadata {
            Some(map) => RefsMetadata::Fetched(map.clone()),
            None => RefsMetadata::Unfetched,
        }
    }

    fn ref_metadata_entry(&mut self, id: &str) -> &mut RefMetadata {
        self.refs_metadata
            .get_or_insert_with(BTreeMap::new)
            .entry(id.to_owned())
            .or_default()
    }

    fn window_contains(&self, id: &str) -> bool {
        self.window.as_ref().is_some_and(|w| w.contains(id))
    }
}

/// A bootstrap page load postponed until the state has been sent.
#[derive(Debug)]
struct DeferredRows {
    repo_path: String,
    anchor: Option<String>,
    limit: usize,
    ordering: CommitOrdering,
    generation: u64,
}

struct Inner {
    state: Mutex<SessionState>,
    outbox: Outbox,
    collaborators: Collaborators,
    /// Serializes every incremental window fetch.
    more_rows_gate: tokio::sync::Mutex<()>,
    state_debounce: Debouncer,
    avatars_debounce: Debouncer,
    refs_metadata_debounce: Debouncer,
    selection_debounce: Debouncer,
    selection_tx: broadcast::Sender<SelectionChangeEvent>,
    followups: mpsc::UnboundedSender<Followup>,
}

/// Cloneable handle on one graph session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Creates a controller and spawns its follow-up task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(collaborators: Collaborators, channel: Arc<dyn MessageChannel>, config: GraphConfig) -> Self {
        let (followups, rx) = mpsc::unbounded_channel();
        let (selection_tx, _) = broadcast::channel(16);
        let debounce = config.debounce.clone();
        let inner = Arc::new(Inner {
            state: Mutex::new(SessionState::new(config)),
            outbox: Outbox::new(channel),
            collaborators,
            more_rows_gate: tokio::sync::Mutex::new(()),
            state_debounce: Debouncer::new(debounce.state()),
            avatars_debounce: Debouncer::new(debounce.avatars()),
            refs_metadata_debounce: Debouncer::new(debounce.refs_metadata()),
            selection_debounce: Debouncer::new(debounce.selection()),
            selection_tx,
            followups,
        });
        spawn_followups(Arc::downgrade(&inner), rx);
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock()
    }

    /// Subscribes to settled selection changes.
    pub fn subscribe_selection(&self) -> broadcast::Receiver<SelectionChangeEvent> {
        self.inner.selection_tx.subscribe()
    }

    pub fn selected_id(&self) -> Option<String> {
        self.lock().selection.selected_id().map(str::to_owned)
    }

    pub fn window_ids(&self) -> Vec<String> {
        self.lock()
            .window
            .as_ref()
            .map(|w| w.rows().iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn search_phase(&self) -> SearchPhase {
        self.lock().search.phase()
    }

    pub fn repository(&self) -> Option<RepositoryInfo> {
        self.lock().repository.clone()
    }

    pub fn pending_notifications(&self) -> Vec<NotificationType> {
        self.inner.outbox.pending_kinds()
    }

    // ---- events -------------------------------------------------------------

    /// Handles one event from the bus. Surface requests are spawned so they
    /// interleave; everything else is handled in arrival order.
    pub async fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::Request(message) => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_request(message).await });
            }
            HostEvent::Lifecycle(LifecycleMessage::Ready) => self.on_ready().await,
            HostEvent::Lifecycle(LifecycleMessage::VisibilityChanged { visible }) => {
                self.on_visibility_changed(visible).await
            }
            HostEvent::RepositoryChanged { changes, etag } => self.on_repository_changed(&changes, etag),
            HostEvent::FileSystemChanged { repo_path } => self.on_file_system_changed(&repo_path).await,
            HostEvent::ConfigurationChanged(config) => self.on_configuration_changed(*config).await,
            HostEvent::ThemeChanged(theme) => self.on_theme_changed(theme),
            HostEvent::SubscriptionChanged { etag } => self.on_subscription_changed(etag).await,
            HostEvent::ConnectedRemotesChanged(connected) => self.on_connected_remotes_changed(connected),
            HostEvent::Command(command) => self.run_command(command).await,
            HostEvent::Quit => {}
        }
    }

    pub async fn handle_request(&self, message: InboundMessage) {
        let InboundMessage { id, request, completion_id } = message;
        debug!("request {id} {}", request.method());
        if completion_id.is_some() && !matches!(request, Request::EnsureRow { .. } | Request::Search { .. }) {
            warn!("{} has no reply; ignoring its completion id", request.method());
        }
        match request {
            Request::DismissBanner { key } => self.dismiss_banner(key).await,
            Request::EnsureRow { id } => self.ensure_row(id, completion_id).await,
            Request::GetMissingAvatars { emails } => self.get_missing_avatars(emails).await,
            Request::GetMissingRefsMetadata { metadata } => self.get_missing_refs_metadata(metadata).await,
            Request::GetMoreRows { id } => self.get_more_rows(id, false).await,
            Request::Search { search, limit, more } => self.search(search, limit, more, completion_id).await,
            Request::SearchOpenInView { search } => self.search_open_in_view(search).await,
            Request::UpdateColumn { name, config } => self.update_column(name, config).await,
            Request::UpdateRefsVisibility { refs, visible } => self.update_refs_visibility(refs, visible).await,
            Request::DoubleClickedRef { reference } => self.double_clicked_ref(reference).await,
            Request::UpdateSelectedRepository { path } => self.update_selected_repository(&path).await,
            Request::UpdateSelection { selection } => self.update_selection(selection),
        }
    }

    pub async fn on_ready(&self) {
        debug!("surface ready");
        self.inner.outbox.set_ready(true);
        self.flush_pending().await;
    }

    /// A newly visible surface with an outdated view gets a full refresh;
    /// otherwise whatever queued up while hidden is flushed.
    pub async fn on_visibility_changed(&self, visible: bool) {
        self.inner.outbox.set_visible(visible);
        if !visible {
            return;
        }
        let stale = {
            let s = self.lock();
            s.repository.is_some() && s.is_stale()
        };
        if stale {
            self.update_state(true);
            return;
        }
        if self.inner.outbox.is_ready() {
            self.flush_pending().await;
        }
    }

    pub fn on_repository_changed(&self, changes: &[RepositoryChange], etag: u64) {
        let refresh = changes.iter().any(|c| c.refreshes_graph());
        {
            let mut s = self.lock();
            s.repository_etag = etag;
            if !refresh {
                s.etag_repository = Some(etag);
            }
        }
        if refresh {
            self.update_state(false);
        }
    }

    pub async fn on_file_system_changed(&self, repo_path: &str) {
        let current = self.lock().repo_path();
        if current.as_deref() == Some(repo_path) {
            self.notify_did_change_working_tree().await;
        }
    }

    pub async fn on_configuration_changed(&self, next: GraphConfig) {
        let change = {
            let mut s = self.lock();
            let change = s.config.diff(&next);
            s.config = next;
            change
        };
        if change.ordering {
            self.update_state(false);
            return;
        }
        if change.component {
            self.notify_did_change_configuration().await;
        }
    }

    pub fn on_theme_changed(&self, theme: ThemeKind) {
        {
            let mut s = self.lock();
            if s.theme.is_some_and(|previous| previous.same_class(theme)) {
                return;
            }
            s.theme = Some(theme);
        }
        self.update_state(false);
    }

    pub async fn on_subscription_changed(&self, etag: u64) {
        {
            let mut s = self.lock();
            if s.etag_subscription == Some(etag) {
                return;
            }
            s.etag_subscription = Some(etag);
        }
        self.notify_did_change_subscription().await;
    }

    pub fn on_connected_remotes_changed(&self, connected: bool) {
        {
            let mut s = self.lock();
            s.has_connected_remotes = connected;
            s.reset_refs_metadata();
        }
        self.update_refs_metadata();
    }

    async fn run_command(&self, command: HostCommand) {
        match command {
            HostCommand::Refresh { force } => self.refresh(force).await,
            HostCommand::HideRefs { target, whole_remote } => self.hide_refs(&target, whole_remote).await,
            HostCommand::ToggleColumn { name, visible } => self.toggle_column(name, visible).await,
            HostCommand::ShowInGraph { repo_path, id } => self.show_in_graph(&repo_path, id).await,
            HostCommand::Show => self.show(),
        }
    }

    // ---- host commands ------------------------------------------------------

    /// Sends the initial state. Rows are left out and follow in a separate
    /// rows notification once loaded.
    pub async fn bootstrap(&self) {
        let (state, deferred) = self.get_state(true).await;
        self.notify(Notification::DidChangeState { state: Box::new(state) }, None).await;
        // Started only now so the rows cannot be queued ahead of the state
        // that supersedes them.
        if let Some(deferred) = deferred {
            let this = self.clone();
            tokio::spawn(async move { this.load_deferred_rows(deferred).await });
        }
    }

    pub async fn refresh(&self, force: bool) {
        debug!("refresh force={force}");
        self.lock().reset_repository_state();
        if force {
            self.inner.outbox.clear();
        }
        self.bootstrap().await;
    }

    /// The view was (re)opened; the next selection counts as the first.
    pub fn show(&self) {
        self.lock().selection.reset_first_selection();
    }

    pub async fn set_repository(&self, repository: Option<RepositoryInfo>) {
        if !self.adopt_repository(repository).await {
            return;
        }
        if self.inner.outbox.is_ready() {
            self.update_state(false);
        }
    }

    /// Swaps the repository without scheduling a refresh. Returns `false` if
    /// it was already current.
    async fn adopt_repository(&self, repository: Option<RepositoryInfo>) -> bool {
        let current = self.lock().repo_path();
        if current.as_deref() == repository.as_ref().map(|r| r.path.as_str()) {
            return false;
        }
        let connected = match &repository {
            Some(r) => self.inner.collaborators.host.has_connected_remotes(&r.path).await,
            None => false,
        };
        let mut s = self.lock();
        debug!("repository -> {:?}", repository.as_ref().map(|r| &r.path));
        s.repository = repository;
        s.repository_etag = 0;
        s.etag_repository = None;
        s.has_connected_remotes = connected;
        s.reset_repository_state();
        true
    }

    pub async fn hide_refs(&self, target: &HideTarget, whole_remote: bool) {
        let refs = normalize_hidden_refs(target, whole_remote);
        if refs.is_empty() {
            return;
        }
        self.update_refs_visibility(refs, false).await;
    }

    pub async fn toggle_column(&self, name: ColumnName, visible: bool) {
        let columns = self.load_columns().await;
        let mut config = columns.get(&name).copied().unwrap_or_default();
        config.is_hidden = Some(!visible);
        self.update_column(name, config).await;
    }

    /// Selects `id` in the graph, loading rows up to it if needed.
    pub async fn show_in_graph(&self, repo_path: &str, id: String) {
        let current = self.lock().repo_path();
        if current.as_deref() != Some(repo_path) {
            let repository = self
                .inner
                .collaborators
                .host
                .repositories()
                .await
                .into_iter()
                .find(|r| r.path == repo_path);
            self.set_repository(repository).await;
        }

        let in_window = {
            let mut s = self.lock();
            s.selection.set(Some(id.clone()));
            s.window_contains(&id)
        };
        if in_window {
            self.notify_did_change_selection().await;
        } else {
            self.get_more_rows(Some(id), true).await;
        }
    }

    // ---- surface requests ---------------------------------------------------

    pub async fn dismiss_banner(&self, key: BannerKey) {
        {
            let mut s = self.lock();
            match key {
                BannerKey::Preview => s.preview_banner = Some(false),
                BannerKey::Trial => s.trial_banner = Some(false),
            }
        }
        if let Err(e) = self.inner.collaborators.storage.dismiss_banner(key).await {
            error!("dismiss_banner failed: {e}");
        }
    }

    /// Makes sure `id` is in the window, fetching at most one more page, and
    /// replies with the id or `None` when it cannot be shown.
    pub async fn ensure_row(&self, id: String, completion_id: Option<String>) {
        debug!("ensure_row id={id}");
        let presence = self.lock().window.as_ref().map(|w| w.presence(&id));
        let found = match presence {
            None | Some(RowPresence::Skipped) => None,
            Some(RowPresence::Known) => Some(id),
            Some(RowPresence::Missing) => {
                let _gate = self.inner.more_rows_gate.lock().await;
                // An earlier holder of the gate may have loaded it already.
                let presence = self.lock().window.as_ref().map(|w| w.presence(&id));
                match presence {
                    Some(RowPresence::Known) => Some(id),
                    Some(RowPresence::Missing) => {
                        self.update_window_with_more_rows(Some(id.clone())).await;
                        self.notify_did_change_rows(false, None).await;
                        let loaded = self.lock().window_contains(&id);
                        loaded.then_some(id)
                    }
                    _ => None,
                }
            }
        };
        self.notify(Notification::DidEnsureRow { id: found }, completion_id).await;
    }

    pub async fn get_missing_avatars(&self, emails: HashMap<String, String>) {
        let (repo_path, missing) = {
            let s = self.lock();
            let Some(window) = &s.window else {
                return;
            };
            let missing: Vec<(String, String)> =
                emails.into_iter().filter(|(email, _)| !window.has_avatar(email)).collect();
            (window.repo_path().to_owned(), missing)
        };
        if missing.is_empty() {
            return;
        }
        debug!("resolving {} avatars", missing.len());

        let provider = &self.inner.collaborators.avatars;
        let repo = repo_path.as_str();
        let lookups = missing.iter().map(|(email, sample_id)| async move {
            (email.clone(), provider.resolve_avatar(repo, email, sample_id).await)
        });
        let resolved: Vec<(String, String)> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(email, result)| match result {
                Ok(uri) => Some((email, uri)),
                Err(e) => {
                    warn!("avatar lookup for {email} failed: {e}");
                    None
                }
            })
            .collect();

        {
            let mut s = self.lock();
            if let Some(window) = s.window.as_mut().filter(|w| w.repo_path() == repo_path) {
                window.merge_avatars(resolved);
            }
        }
        self.update_avatars();
    }

    pub async fn get_missing_refs_metadata(&self, metadata: HashMap<String, Vec<RefMetadataKind>>) {
        let (repo_path, pull_requests) = {
            let mut s = self.lock();
            if !s.has_connected_remotes || s.refs_metadata_disabled {
                return;
            }
            let Some(repo_path) = s.window.as_ref().map(|w| w.repo_path().to_owned()) else {
                return;
            };
            let mut pull_requests = Vec::new();
            for (id, kinds) in metadata {
                for kind in kinds {
                    match kind {
                        RefMetadataKind::PullRequests => pull_requests.push(id.clone()),
                        // Only pull requests are looked up remotely.
                        RefMetadataKind::Upstream => s.ref_metadata_entry(&id).upstream = MetadataSlot::Absent,
                    }
                }
            }
            (repo_path, pull_requests)
        };

        let provider = &self.inner.collaborators.ref_metadata;
        let repo = repo_path.as_str();
        let lookups = pull_requests.into_iter().map(|id| async move {
            let result = provider.pull_request_for(repo, &id).await;
            (id, result)
        });
        let results = join_all(lookups).await;

        {
            let mut s = self.lock();
            for (id, result) in results {
                let pr = result.unwrap_or_else(|e| {
                    warn!("pull request lookup for {id} failed: {e}");
                    None
                });
                let entry = s.ref_metadata_entry(&id);
                match pr {
                    Some(pr) => entry.pull_requests = MetadataSlot::Present(vec![pr]),
                    None if !entry.pull_requests.is_present() => entry.pull_requests = MetadataSlot::Absent,
                    None => {}
                }
            }
        }
        self.update_refs_metadata();
    }

    /// Grows the window by one page. A window that cannot continue, or a view
    /// built from an outdated repository etag, gets a full refresh instead.
    pub async fn get_more_rows(&self, anchor: Option<String>, send_selected_rows: bool) {
        debug!("get_more_rows anchor={anchor:?}");
        let _gate = self.inner.more_rows_gate.lock().await;
        let refresh = {
            let s = self.lock();
            let Some(window) = &s.window else {
                return;
            };
            window.continuation().is_none() || s.is_stale()
        };
        if refresh {
            self.update_state(true);
            return;
        }
        self.update_window_with_more_rows(anchor).await;
        self.notify_did_change_rows(send_selected_rows, None).await;
    }

    /// Runs, extends or clears the current search.
    pub async fn search(
        &self,
        search: Option<SearchQuery>,
        limit: Option<usize>,
        more: bool,
        completion_id: Option<String>,
    ) {
        let Some(query) = search else {
            debug!("search cleared");
            self.lock().search.dismiss();
            self.reply_empty_search(completion_id).await;
            return;
        };
        let key = query.comparison_key();
        debug!("search key={key} more={more}");

        if more {
            let expansion = self.lock().search.begin_more(&key);
            if let Some((ticket, session_query, cursor)) = expansion {
                self.expand_search(ticket, session_query, cursor, limit, completion_id).await;
                return;
            }
        }

        let is_current = self.lock().search.is_current(&key);
        if !is_current {
            let (repo_path, stale, limit) = {
                let s = self.lock();
                (s.repo_path(), s.is_stale(), s.config.search_item_limit)
            };
            let Some(repo_path) = repo_path else {
                self.reply_empty_search(completion_id).await;
                return;
            };
            if stale {
                self.update_state(true);
            }

            let ticket = self.lock().search.begin_query();
            let result = self.run_search(&repo_path, &query, limit, None, &ticket).await;
            let completion = self.lock().search.complete_query(&ticket, query, result);
            match completion {
                Completion::Ready => {}
                Completion::Cancelled => {
                    debug!("search {key} was superseded");
                    self.reply_empty_search(completion_id).await;
                    return;
                }
                Completion::Failed(error) => {
                    let params = SearchResultParams {
                        results: Some(SearchResults::Error { error: error.to_owned() }),
                        selected_rows: None,
                    };
                    self.notify(Notification::DidSearch(params), completion_id).await;
                    return;
                }
            }
        }

        let first = self.ensure_search_starts_in_range().await;
        let params = {
            let mut s = self.lock();
            let results = s.search.session().map(SearchSession::to_results);
            results.map(|results| {
                let selected_rows = match first {
                    Some(id) => {
                        s.selection.set(Some(id));
                        s.selection.selected_rows().cloned()
                    }
                    None => None,
                };
                SearchResultParams { results: Some(results), selected_rows }
            })
        };
        match params {
            Some(params) => {
                self.notify(Notification::DidSearch(params), completion_id).await;
            }
            // Dismissed while the window was expanding.
            None => self.reply_empty_search(completion_id).await,
        }
    }

    /// Extends the session keyed by `key` without a reply. Does nothing once
    /// a newer query has started or the session was dismissed.
    async fn continue_search(&self, key: &str) {
        let expansion = self.lock().search.begin_more(key);
        match expansion {
            Some((ticket, query, cursor)) => self.expand_search(ticket, query, cursor, None, None).await,
            None => debug!("search {key} is no longer current, not continuing"),
        }
    }

    async fn expand_search(
        &self,
        ticket: SearchTicket,
        query: SearchQuery,
        cursor: Option<String>,
        limit: Option<usize>,
        completion_id: Option<String>,
    ) {
        let (repo_path, default_limit) = {
            let s = self.lock();
            (s.repo_path(), s.config.search_item_limit)
        };
        let result = match &repo_path {
            Some(repo_path) => {
                let limit = limit.unwrap_or(default_limit);
                self.run_search(repo_path, &query, limit, cursor.as_deref(), &ticket).await
            }
            None => Err(SearchError::Cancelled),
        };
        let extended = self.lock().search.complete_more(&ticket, result);
        if !extended {
            self.reply_empty_search(completion_id).await;
            return;
        }

        self.ensure_search_starts_in_range().await;
        let results = {
            let s = self.lock();
            s.search.session().filter(|session| !session.is_empty()).map(SearchSession::to_results)
        };
        let params = SearchResultParams { results, selected_rows: None };
        self.notify(Notification::DidSearch(params), completion_id).await;
    }

    /// Races the provider against the ticket's token so a cancelled search
    /// resolves immediately.
    async fn run_search(
        &self,
        repo_path: &str,
        query: &SearchQuery,
        limit: usize,
        cursor: Option<&str>,
        ticket: &SearchTicket,
    ) -> Result<SearchPage, SearchError> {
        let graph = &self.inner.collaborators.graph;
        let ordering = self.lock().config.commit_ordering;
        let result = tokio::select! {
            result = graph.search_commits(repo_path, query, limit, cursor, ordering, &ticket.token) => result,
            () = ticket.token.cancelled() => Err(SearchError::Cancelled),
        };
        match &result {
            Err(SearchError::Cancelled) | Ok(_) => {}
            Err(e @ SearchError::InvalidQuery(_)) => debug!("search rejected for {repo_path}: {e}"),
            Err(e) => error!("search_commits failed for {repo_path}: {e}"),
        }
        result
    }

    async fn reply_empty_search(&self, completion_id: Option<String>) {
        if completion_id.is_some() {
            self.notify(Notification::DidSearch(SearchResultParams::default()), completion_id).await;
        }
    }

    pub async fn search_open_in_view(&self, search: SearchQuery) {
        let Some(repo_path) = self.lock().repo_path() else {
            return;
        };
        self.inner.collaborators.host.open_search(&repo_path, search).await;
    }

    pub async fn update_column(&self, name: ColumnName, config: ColumnConfig) {
        if let Err(e) = self.inner.collaborators.storage.save_column(name, config).await {
            error!("save_column {} failed: {e}", name.as_str());
        }
        self.notify_did_change_columns().await;
    }

    pub async fn update_refs_visibility(&self, refs: Vec<HiddenRef>, visible: bool) {
        debug!("update_refs_visibility count={} visible={visible}", refs.len());
        if let Err(e) = self.inner.collaborators.storage.update_hidden_refs(refs, visible).await {
            error!("update_hidden_refs failed: {e}");
        }
        self.notify_did_change_refs_visibility().await;
    }

    /// Double-clicking the current head offers a branch switch; any other ref
    /// switches to it.
    pub async fn double_clicked_ref(&self, reference: RowRef) {
        let repo_path = graphsync_core::types::repo_path_from_ref_id(&reference.id).to_owned();
        let host = &self.inner.collaborators.host;
        if reference.ref_type == RefType::Head && reference.is_current_head {
            host.switch_to(&repo_path, None).await;
        } else {
            host.switch_to(&repo_path, Some(reference)).await;
        }
    }

    pub async fn update_selected_repository(&self, path: &str) {
        let repository = self
            .inner
            .collaborators
            .host
            .repositories()
            .await
            .into_iter()
            .find(|r| r.path == path);
        if repository.is_none() {
            warn!("selected repository {path} is not open");
        }
        self.set_repository(repository).await;
    }

    /// Updates the selection now and fires the follow-on once it settles.
    pub fn update_selection(&self, selection: Vec<SelectedRow>) {
        let (id, kind) = match selection.into_iter().next() {
            Some(row) => (Some(row.id), Some(row.kind)),
            None => (None, None),
        };
        if !self.lock().selection.set(id.clone()) {
            return;
        }
        let this = self.clone();
        self.inner
            .selection_debounce
            .schedule(async move { this.fire_selection_changed(id, kind).await });
    }

    async fn fire_selection_changed(&self, id: Option<String>, kind: Option<RowKind>) {
        let (repo_path, first, mode) = {
            let s = self.lock();
            (s.repo_path(), s.selection.is_first_selection(), s.config.show_details_view)
        };
        let details = match (&id, &repo_path) {
            (Some(id), Some(repo_path)) => {
                let kind = kind.unwrap_or_default();
                match self.inner.collaborators.graph.resolve_row(repo_path, id, kind).await {
                    Ok(details) => details,
                    Err(e) => {
                        error!("resolve_row {id} failed: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        // No subscribers is fine.
        let _ = self.inner.selection_tx.send(SelectionChangeEvent {
            id,
            kind,
            first,
            details: details.clone(),
        });

        let Some(details) = details else {
            return;
        };
        self.inner
            .collaborators
            .host
            .show_commit_details(details, preserve_visibility(first, mode))
            .await;
        self.lock().selection.mark_selected_once();
    }

    // ---- window -------------------------------------------------------------

    /// Fetches the page after the window's cursor and swaps in the expanded
    /// window. The caller holds the more-rows gate.
    async fn update_window_with_more_rows(&self, anchor: Option<String>) -> bool {
        let (repo_path, cursor, generation, limit, ordering) = {
            let s = self.lock();
            let Some(window) = &s.window else {
                return false;
            };
            let Some(cursor) = window.continuation() else {
                warn!("more rows requested but {} advertises no continuation", window.repo_path());
                return false;
            };
            (
                window.repo_path().to_owned(),
                cursor.to_owned(),
                s.window_generation,
                s.config.page_item_limit,
                s.config.commit_ordering,
            )
        };

        let result = self
            .inner
            .collaborators
            .graph
            .fetch_more(&repo_path, &cursor, limit, anchor.as_deref(), ordering)
            .await;
        let page = match result {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!("fetch_more for {repo_path} produced nothing although more rows were advertised");
                return false;
            }
            Err(e) => {
                error!("fetch_more failed for {repo_path}: {e}");
                return false;
            }
        };

        let continue_search = {
            let mut s = self.lock();
            if s.window_generation != generation {
                warn!("discarding page for {repo_path}: the window was replaced while it loaded");
                return false;
            }
            let Some(window) = s.window.as_ref() else {
                return false;
            };
            let next = window.with_page(page);
            let continue_search = s
                .search
                .session()
                .filter(|session| session.has_more())
                .and_then(|session| {
                    let last = session.last_result_id()?;
                    (next.contains(last) || next.is_skipped(last)).then(|| session.comparison_key().to_owned())
                });
            s.set_window(Some(next));
            continue_search
        };

        if let Some(key) = continue_search {
            debug!("window reached the last search match, continuing search");
            let _ = self.inner.followups.send(Followup::SearchMore(key));
        }
        true
    }

    /// Makes sure the first reachable search match is in the window,
    /// expanding it at most once. Returns that match when it is.
    async fn ensure_search_starts_in_range(&self) -> Option<String> {
        let check = {
            let s = self.lock();
            match (s.search.session(), s.window.as_ref()) {
                (Some(session), Some(window)) => first_reachable(session.results().keys(), window),
                _ => StartCheck::Empty,
            }
        };
        match check {
            StartCheck::Empty | StartCheck::Unreachable => None,
            StartCheck::InRange(id) => Some(id),
            StartCheck::Expand(target) => {
                let _gate = self.inner.more_rows_gate.lock().await;
                let loaded = self.lock().window_contains(&target);
                if !loaded {
                    self.update_window_with_more_rows(Some(target.clone())).await;
                    self.notify_did_change_rows(false, None).await;
                }
                let loaded = self.lock().window_contains(&target);
                loaded.then_some(target)
            }
        }
    }

    // ---- state --------------------------------------------------------------

    /// Requests a full state notification: now, or after the state debounce.
    /// Either way the pending queue is dropped, since full state supersedes it.
    pub fn update_state(&self, immediate: bool) {
        self.inner.outbox.clear();
        if immediate {
            self.inner.state_debounce.cancel();
            let _ = self.inner.followups.send(Followup::State);
            return;
        }
        let followups = self.inner.followups.clone();
        self.inner.state_debounce.schedule(async move {
            let _ = followups.send(Followup::State);
        });
    }

    fn update_avatars(&self) {
        let this = self.clone();
        self.inner.avatars_debounce.schedule(async move {
            this.notify_did_change_avatars().await;
        });
    }

    fn update_refs_metadata(&self) {
        let this = self.clone();
        self.inner.refs_metadata_debounce.schedule(async move {
            this.notify_did_change_refs_metadata().await;
        });
    }

    async fn load_columns(&self) -> BTreeMap<ColumnName, ColumnConfig> {
        match self.inner.collaborators.storage.load_columns().await {
            Ok(columns) => columns,
            Err(e) => {
                error!("load_columns failed: {e}");
                BTreeMap::new()
            }
        }
    }

    async fn load_hidden_refs(&self, repo_path: &str) -> BTreeMap<String, HiddenRef> {
        match self.inner.collaborators.storage.load_hidden_refs().await {
            Ok(stored) => filter_hidden_refs(&stored, repo_path),
            Err(e) => {
                error!("load_hidden_refs failed: {e}");
                BTreeMap::new()
            }
        }
    }

    /// Builds the full state snapshot, (re)loading the window.
    ///
    /// With `defer_rows` the page is not fetched; the returned [`DeferredRows`]
    /// describes the load for the caller to start once the state is out.
    async fn get_state(&self, defer_rows: bool) -> (GraphState, Option<DeferredRows>) {
        let collaborators = &self.inner.collaborators;
        let repositories = collaborators.host.repositories().await;
        if repositories.is_empty() {
            return (GraphState::empty(), None);
        }

        let needs_banners = {
            let s = self.lock();
            s.preview_banner.is_none() || s.trial_banner.is_none()
        };
        if needs_banners {
            let dismissed = collaborators.storage.load_dismissed_banners().await.unwrap_or_else(|e| {
                error!("load_dismissed_banners failed: {e}");
                Vec::new()
            });
            let mut s = self.lock();
            s.preview_banner.get_or_insert(!dismissed.contains(&BannerKey::Preview));
            s.trial_banner.get_or_insert(!dismissed.contains(&BannerKey::Trial));
        }

        let current = self.lock().repo_path();
        if current.is_none() {
            self.adopt_repository(repositories.first().cloned()).await;
        }

        let (repo_path, limit, anchor, ordering, generation) = {
            let mut s = self.lock();
            let Some(repo_path) = s.repo_path() else {
                return (GraphState::empty(), None);
            };
            s.etag_repository = Some(s.repository_etag);
            // Reload as many rows as the surface already has.
            let known = s.window.as_ref().map_or(0, GraphWindow::len);
            let limit = s.config.default_item_limit.max(known);
            let anchor = s.selection.selected_id().map(str::to_owned);
            (repo_path, limit, anchor, s.config.commit_ordering, s.window_generation)
        };

        let access = collaborators.host.access(Some(&repo_path));
        let stats = collaborators.graph.working_tree_stats(&repo_path);

        let (page, access, stats, deferred) = if defer_rows {
            let (access, stats) = tokio::join!(access, stats);
            let deferred = DeferredRows { repo_path: repo_path.clone(), anchor, limit, ordering, generation };
            (None, access, stats, Some(deferred))
        } else {
            let fetch = collaborators.graph.fetch_graph_page(&repo_path, anchor.as_deref(), limit, ordering);
            let (page, access, stats) = tokio::join!(fetch, access, stats);
            (Some(page), access, stats, None)
        };

        let loaded = match page {
            Some(Ok(page)) => {
                let window = GraphWindow::from_page(page);
                let selected = window.selected_id().map(str::to_owned);
                let mut s = self.lock();
                s.set_window(Some(window));
                s.selection.set(selected);
                true
            }
            Some(Err(e)) => {
                error!("fetch_graph_page failed for {repo_path}: {e}");
                false
            }
            None => false,
        };
        let access = access
            .map_err(|e| error!("access check failed for {repo_path}: {e}"))
            .ok();
        let stats = stats.unwrap_or_else(|e| {
            error!("working_tree_stats failed for {repo_path}: {e}");
            WorkingTreeStats::default()
        });
        let columns = self.load_columns().await;
        let hidden_refs = if loaded { Some(self.load_hidden_refs(&repo_path).await) } else { None };

        let mut s = self.lock();
        let refs_metadata = s.reset_refs_metadata();
        let window = if loaded { s.window.as_ref() } else { None };
        let state = GraphState {
            preview_banner: s.preview_banner,
            trial_banner: s.trial_banner,
            repositories,
            selected_repository: Some(repo_path.clone()),
            selected_repository_visibility: access.as_ref().and_then(|a| a.visibility),
            selected_rows: s.selection.selected_rows().cloned(),
            subscription: access.as_ref().map(|a| a.subscription.clone()),
            allowed: access.as_ref().is_some_and(|a| a.allowed),
            avatars: window.map(|w| w.avatars().clone()),
            refs_metadata,
            loading: defer_rows,
            rows: window.map(|w| w.rows().to_vec()),
            paging: window.map(GraphWindow::paging),
            columns: Some(resolve_column_settings(&columns)),
            config: Some(s.config.component_config()),
            context: Some(StateContext { header: hidden_columns_context(&columns) }),
            hidden_refs,
            working_tree_stats: Some(stats),
        };
        (state, deferred)
    }

    async fn load_deferred_rows(&self, deferred: DeferredRows) {
        let DeferredRows { repo_path, anchor, limit, ordering, generation } = deferred;
        let result = self
            .inner
            .collaborators
            .graph
            .fetch_graph_page(&repo_path, anchor.as_deref(), limit, ordering)
            .await;
        self.apply_deferred_page(result, generation).await;
    }

    async fn apply_deferred_page(&self, result: Result<GraphPage, ProviderError>, generation: u64) {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                error!("deferred row load failed: {e}");
                return;
            }
        };
        {
            let mut s = self.lock();
            let same_repo = s.repository.as_ref().is_some_and(|r| r.path == page.repo_path);
            if s.window_generation != generation || !same_repo {
                warn!("discarding deferred rows for {}: the session moved on", page.repo_path);
                return;
            }
            let window = GraphWindow::from_page(page);
            let selected = window.selected_id().map(str::to_owned);
            s.set_window(Some(window));
            s.selection.set(selected);
        }
        self.notify_did_change_refs_visibility().await;
        self.notify_did_change_rows(true, None).await;
    }

    // ---- notifications ------------------------------------------------------

    async fn notify(&self, notification: Notification, completion_id: Option<String>) -> bool {
        self.inner.outbox.notify(notification, completion_id).await
    }

    /// Queues a rebuild marker instead of building a payload the surface
    /// cannot receive yet.
    fn defer_if_unavailable(&self, kind: NotificationType) -> bool {
        if self.inner.outbox.can_deliver() {
            return false;
        }
        self.inner.outbox.defer(kind);
        true
    }

    /// Delivers every queued entry. Markers are rebuilt from current state.
    pub async fn flush_pending(&self) {
        let pending = self.inner.outbox.take_pending();
        if !pending.is_empty() {
            debug!("flushing {} pending notifications", pending.len());
        }
        for (kind, entry) in pending {
            match entry {
                Pending::Fixed(message) => {
                    self.inner.outbox.resend(message).await;
                }
                Pending::Recompute => {
                    self.regenerate(kind).await;
                }
            }
        }
    }

    async fn regenerate(&self, kind: NotificationType) -> bool {
        match kind {
            NotificationType::DidChangeState => self.notify_did_change_state().await,
            NotificationType::DidChangeColumns => self.notify_did_change_columns().await,
            NotificationType::DidChangeConfiguration => self.notify_did_change_configuration().await,
            NotificationType::DidChangeRefsVisibility => self.notify_did_change_refs_visibility().await,
            NotificationType::DidChangeSelection => self.notify_did_change_selection().await,
            NotificationType::DidChangeSubscription => self.notify_did_change_subscription().await,
            NotificationType::DidChangeWorkingTree => self.notify_did_change_working_tree().await,
            other => {
                warn!("no regenerator for {other:?}");
                false
            }
        }
    }

    async fn notify_did_change_state(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeState) {
            return false;
        }
        let (state, _) = self.get_state(false).await;
        self.notify(Notification::DidChangeState { state: Box::new(state) }, None).await
    }

    async fn notify_did_change_rows(&self, send_selected_rows: bool, completion_id: Option<String>) -> bool {
        let params = {
            let s = self.lock();
            let Some(window) = &s.window else {
                return false;
            };
            RowsChangedParams {
                rows: window.rows().to_vec(),
                avatars: window.avatars().clone(),
                refs_metadata: s.refs_metadata(),
                selected_rows: if send_selected_rows { s.selection.selected_rows().cloned() } else { None },
                paging: window.paging(),
            }
        };
        self.notify(Notification::DidChangeRows(params), completion_id).await
    }

    async fn notify_did_change_avatars(&self) -> bool {
        let avatars = {
            let s = self.lock();
            let Some(window) = &s.window else {
                return false;
            };
            window.avatars().clone()
        };
        self.notify(Notification::DidChangeAvatars { avatars }, None).await
    }

    async fn notify_did_change_refs_metadata(&self) -> bool {
        let metadata = self.lock().refs_metadata();
        self.notify(Notification::DidChangeRefsMetadata { metadata }, None).await
    }

    async fn notify_did_change_columns(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeColumns) {
            return false;
        }
        let columns = self.load_columns().await;
        let notification = Notification::DidChangeColumns {
            columns: resolve_column_settings(&columns),
            context: hidden_columns_context(&columns),
        };
        self.notify(notification, None).await
    }

    async fn notify_did_change_refs_visibility(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeRefsVisibility) {
            return false;
        }
        let repo_path = self.lock().window.as_ref().map(|w| w.repo_path().to_owned());
        let hidden_refs = match repo_path {
            Some(repo_path) => Some(self.load_hidden_refs(&repo_path).await),
            None => None,
        };
        self.notify(Notification::DidChangeRefsVisibility { hidden_refs }, None).await
    }

    async fn notify_did_change_configuration(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeConfiguration) {
            return false;
        }
        let config = self.lock().config.component_config();
        self.notify(Notification::DidChangeConfiguration { config }, None).await
    }

    async fn notify_did_change_selection(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeSelection) {
            return false;
        }
        let selection = self.lock().selection.selected_rows().cloned().unwrap_or_else(SelectedRows::new);
        self.notify(Notification::DidChangeSelection { selection }, None).await
    }

    async fn notify_did_change_subscription(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeSubscription) {
            return false;
        }
        let repo_path = self.lock().repo_path();
        let access = match self.inner.collaborators.host.access(repo_path.as_deref()).await {
            Ok(access) => access,
            Err(e) => {
                error!("access check failed: {e}");
                return false;
            }
        };
        let notification =
            Notification::DidChangeSubscription { subscription: access.subscription, allowed: access.allowed };
        self.notify(notification, None).await
    }

    async fn notify_did_change_working_tree(&self) -> bool {
        if self.defer_if_unavailable(NotificationType::DidChangeWorkingTree) {
            return false;
        }
        let repo_path = self.lock().repo_path();
        let stats = match repo_path {
            Some(repo_path) => self
                .inner
                .collaborators
                .graph
                .working_tree_stats(&repo_path)
                .await
                .unwrap_or_else(|e| {
                    error!("working_tree_stats failed for {repo_path}: {e}");
                    WorkingTreeStats::default()
                }),
            None => WorkingTreeStats::default(),
        };
        self.notify(Notification::DidChangeWorkingTree { stats }, None).await
    }
}

/// Runs follow-ups until the controller is dropped.
fn spawn_followups(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Followup>) {
    tokio::spawn(async move {
        while let Some(followup) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let controller = SessionController { inner };
            match followup {
                Followup::State => {
                    controller.notify_did_change_state().await;
                }
                Followup::SearchMore(key) => controller.continue_search(&key).await,
            }
        }
    });
}
