//! graphsync: serves the commit graph of one repository over stdio.
//!
//! Requests, surface lifecycle messages and host events are read as JSON lines
//! from stdin; notifications are written as JSON lines to stdout. Logs go to
//! stderr so they never mix with the message stream.
//!
//! # Startup sequence
//!
//! 1. Initialise `env_logger` on stderr (`RUST_LOG`, default `info`).
//! 2. Load the config from XDG config. Read-only, soft failure.
//! 3. `register_sigterm()`, a flag polled in the event loop.
//! 4. Open the repository and the workspace database inside its git dir.
//! 5. Create the event channel and spawn the stdin reader.
//! 6. Build the controller and bootstrap. The initial state queues until the
//!    surface reports ready.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use graphsync::channel::StdioChannel;
use graphsync::config::GraphConfig;
use graphsync::controller::SessionController;
use graphsync::event::{spawn_stdin_task, EventHandler, HostEvent};
use graphsync::git::GitGraphProvider;
use graphsync::protocol::{
    GraphAccess, PullRequestMetadata, RepositoryInfo, RepositoryVisibility, SearchQuery, Subscription,
};
use graphsync::provider::{
    AvatarProvider, Collaborators, CommitDetails, Host, ProviderError, RefMetadataProvider,
};
use graphsync::storage::SqliteStorage;
use graphsync_core::types::RowRef;
use log::info;
use sha2::{Digest, Sha256};
use signal_hook::consts::SIGTERM;
use signal_hook::flag::register;

/// Registers a SIGTERM handler that sets the returned flag.
///
/// # Panics
///
/// Panics if the handler cannot be registered; there is no useful way to run
/// without it.
fn register_sigterm() -> Arc<AtomicBool> {
    let term = Arc::new(AtomicBool::new(false));
    // Safety: signal_hook::flag::register is safe for AtomicBool targets.
    // The handler only calls atomic_store, which is async-signal-safe.
    register(SIGTERM, Arc::clone(&term)).expect("Failed to register SIGTERM handler");
    term
}

/// Gravatar image refs keyed by the SHA-256 of the normalized email.
struct GravatarAvatars;

fn gravatar_url(email: &str) -> String {
    let hash = Sha256::digest(email.trim().to_lowercase().as_bytes());
    format!("https://www.gravatar.com/avatar/{hash:x}?s=16&d=robohash")
}

#[async_trait]
impl AvatarProvider for GravatarAvatars {
    async fn resolve_avatar(&self, _repo_path: &str, email: &str, _sample_id: &str) -> Result<String, ProviderError> {
        Ok(gravatar_url(email))
    }
}

/// No hosting integration: every pull request lookup comes back empty.
struct NoRemoteHosting;

#[async_trait]
impl RefMetadataProvider for NoRemoteHosting {
    async fn pull_request_for(
        &self,
        _repo_path: &str,
        _ref_id: &str,
    ) -> Result<Option<PullRequestMetadata>, ProviderError> {
        Ok(None)
    }
}

/// Host for a single local repository. UI commands have nowhere to go, so
/// they are logged.
struct LoggingHost {
    repository: RepositoryInfo,
    has_remotes: bool,
}

#[async_trait]
impl Host for LoggingHost {
    async fn repositories(&self) -> Vec<RepositoryInfo> {
        vec![self.repository.clone()]
    }

    async fn access(&self, _repo_path: Option<&str>) -> Result<GraphAccess, ProviderError> {
        Ok(GraphAccess {
            allowed: true,
            subscription: Subscription { plan: "community".to_owned(), preview_trial: false },
            visibility: Some(RepositoryVisibility::Local),
        })
    }

    async fn has_connected_remotes(&self, repo_path: &str) -> bool {
        self.has_remotes && repo_path == self.repository.path
    }

    async fn switch_to(&self, repo_path: &str, target: Option<RowRef>) {
        match target {
            Some(r) => info!("switch {repo_path} to {}", r.name),
            None => info!("switch {repo_path}: pick a branch"),
        }
    }

    async fn open_search(&self, repo_path: &str, query: SearchQuery) {
        info!("open search in {repo_path}: {}", query.query);
    }

    async fn show_commit_details(&self, details: CommitDetails, preserve_visibility: bool) {
        info!("show details of {} (preserve visibility: {preserve_visibility})", details.id);
    }
}

/// Canonical repository path from the first argument, or the current dir.
fn repository_path() -> anyhow::Result<PathBuf> {
    let arg = std::env::args().nth(1).unwrap_or_else(|| ".".to_owned());
    std::fs::canonicalize(&arg).with_context(|| format!("cannot resolve repository path {arg}"))
}

fn repository_info(path: &Path) -> RepositoryInfo {
    let path_str = path.to_string_lossy().into_owned();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.clone());
    RepositoryInfo { id: path_str.clone(), formatted_name: name.clone(), name, path: path_str }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = GraphConfig::load();
    let term_flag = register_sigterm();

    let repo_path = repository_path()?;
    let (git_dir, has_remotes) = {
        let repo = git2::Repository::open(&repo_path)
            .with_context(|| format!("{} is not a git repository", repo_path.display()))?;
        let has_remotes = repo.remotes().map(|r| !r.is_empty()).unwrap_or(false);
        (repo.path().to_path_buf(), has_remotes)
    };

    // The database lives in the git dir so it never shows as an untracked file.
    let db_dir = git_dir.join("graphsync");
    std::fs::create_dir_all(&db_dir)?;
    let storage = SqliteStorage::open(&db_dir.join("workspace.db").to_string_lossy()).await?;

    let handler = EventHandler::new();
    spawn_stdin_task(handler.tx.clone());
    let mut rx = handler.rx;

    let repository = repository_info(&repo_path);
    info!("serving {}", repository.path);
    let collaborators = Collaborators {
        graph: Arc::new(GitGraphProvider::new()),
        avatars: Arc::new(GravatarAvatars),
        ref_metadata: Arc::new(NoRemoteHosting),
        storage: Arc::new(storage),
        host: Arc::new(LoggingHost { repository, has_remotes }),
    };
    let controller = SessionController::new(collaborators, Arc::new(StdioChannel::new()), config);
    controller.bootstrap().await;

    'event_loop: loop {
        tokio::select! {
            // Heartbeat: SIGTERM is checked at least every 50ms even when
            // stdin is quiet.
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                if term_flag.load(Ordering::Relaxed) {
                    break 'event_loop;
                }
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(HostEvent::Quit) | None => break 'event_loop,
                    Some(event) => controller.handle_event(event).await,
                }
                if term_flag.load(Ordering::Relaxed) {
                    break 'event_loop;
                }
            }
        }
    }

    info!("shutting down");
    Ok(())
}
