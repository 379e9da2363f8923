//! Event bus for graphsync.
//!
//! Surface requests, surface lifecycle messages and host-side changes are all
//! normalised into a single [`HostEvent`] enum and sent over a tokio unbounded
//! MPSC channel. The main loop receives from this channel and hands each event
//! to the session controller.

use graphsync_core::types::ColumnName;
use log::warn;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::GraphConfig;
use crate::protocol::{InboundMessage, LifecycleMessage};
use crate::selection::HideTarget;
use crate::theme::ThemeKind;

/// Kinds of repository change the host reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepositoryChange {
    Config,
    Heads,
    Index,
    Remotes,
    RemoteProviders,
    Stash,
    Status,
    Tags,
    Unknown,
}

impl RepositoryChange {
    /// Whether this change can alter the rows of the graph.
    pub fn refreshes_graph(self) -> bool {
        !matches!(self, RepositoryChange::Index | RepositoryChange::RemoteProviders)
    }
}

/// Commands issued by the host UI rather than the surface.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HostCommand {
    /// Rebuild the surface from scratch. `force` drops queued notifications.
    Refresh { force: bool },
    HideRefs { target: HideTarget, whole_remote: bool },
    ToggleColumn { name: ColumnName, visible: bool },
    ShowInGraph { repo_path: String, id: String },
    /// The view was (re)opened.
    Show,
}

/// All events the session can receive from any source.
#[derive(Debug)]
#[non_exhaustive]
pub enum HostEvent {
    /// A request from the rendering surface.
    Request(InboundMessage),
    Lifecycle(LifecycleMessage),
    RepositoryChanged { changes: Vec<RepositoryChange>, etag: u64 },
    /// A file in a repository's working tree changed.
    FileSystemChanged { repo_path: String },
    ConfigurationChanged(Box<GraphConfig>),
    ThemeChanged(ThemeKind),
    SubscriptionChanged { etag: u64 },
    ConnectedRemotesChanged(bool),
    Command(HostCommand),
    /// Quit signal (stdin closed or SIGTERM).
    Quit,
}

/// Host messages as they arrive on stdin, tagged `host/...`.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params")]
enum HostMessage {
    #[serde(rename = "host/repositoryChanged")]
    RepositoryChanged { changes: Vec<RepositoryChange>, etag: u64 },
    #[serde(rename = "host/fileSystemChanged", rename_all = "camelCase")]
    FileSystemChanged { repo_path: String },
    /// Re-read the config file.
    #[serde(rename = "host/configurationChanged")]
    ConfigurationChanged,
    #[serde(rename = "host/themeChanged")]
    ThemeChanged { theme: String },
    #[serde(rename = "host/subscriptionChanged")]
    SubscriptionChanged { etag: u64 },
    #[serde(rename = "host/connectedRemotesChanged")]
    ConnectedRemotesChanged { connected: bool },
    #[serde(rename = "host/refresh")]
    Refresh {
        #[serde(default)]
        force: bool,
    },
    #[serde(rename = "host/hideRefs", rename_all = "camelCase")]
    HideRefs {
        target: HideTarget,
        #[serde(default)]
        whole_remote: bool,
    },
    #[serde(rename = "host/toggleColumn")]
    ToggleColumn { name: ColumnName, visible: bool },
    #[serde(rename = "host/showInGraph", rename_all = "camelCase")]
    ShowInGraph { repo_path: String, id: String },
    #[serde(rename = "host/show")]
    Show,
}

impl From<HostMessage> for HostEvent {
    fn from(message: HostMessage) -> Self {
        match message {
            HostMessage::RepositoryChanged { changes, etag } => HostEvent::RepositoryChanged { changes, etag },
            HostMessage::FileSystemChanged { repo_path } => HostEvent::FileSystemChanged { repo_path },
            HostMessage::ConfigurationChanged => HostEvent::ConfigurationChanged(Box::new(GraphConfig::load())),
            HostMessage::ThemeChanged { theme } => HostEvent::ThemeChanged(ThemeKind::from_name(&theme)),
            HostMessage::SubscriptionChanged { etag } => HostEvent::SubscriptionChanged { etag },
            HostMessage::ConnectedRemotesChanged { connected } => HostEvent::ConnectedRemotesChanged(connected),
            HostMessage::Refresh { force } => HostEvent::Command(HostCommand::Refresh { force }),
            HostMessage::HideRefs { target, whole_remote } => {
                HostEvent::Command(HostCommand::HideRefs { target, whole_remote })
            }
            HostMessage::ToggleColumn { name, visible } => {
                HostEvent::Command(HostCommand::ToggleColumn { name, visible })
            }
            HostMessage::ShowInGraph { repo_path, id } => {
                HostEvent::Command(HostCommand::ShowInGraph { repo_path, id })
            }
            HostMessage::Show => HostEvent::Command(HostCommand::Show),
        }
    }
}

/// Parses one stdin line into an event, routing on the `method` prefix.
///
/// # Errors
///
/// Returns the `serde_json` error for malformed JSON or an unknown method.
pub fn parse_line(line: &str) -> Result<HostEvent, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let method = value.get("method").and_then(|m| m.as_str()).unwrap_or_default();
    if method.starts_with("webview/") {
        Ok(HostEvent::Lifecycle(serde_json::from_value(value)?))
    } else if method.starts_with("host/") {
        let message: HostMessage = serde_json::from_value(value)?;
        Ok(message.into())
    } else {
        Ok(HostEvent::Request(serde_json::from_value(value)?))
    }
}

/// Holds the sender and receiver ends of the unified event channel.
///
/// The sender (`tx`) is cloned and distributed to producer tasks;
/// the receiver (`rx`) is owned by the main event loop.
pub struct EventHandler {
    pub tx: mpsc::UnboundedSender<HostEvent>,
    pub rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the task that reads JSON lines from stdin into the event channel.
///
/// Malformed lines are logged and skipped. End of input sends
/// [`HostEvent::Quit`]. Send errors are ignored; a dropped receiver means the
/// main loop is already shutting down.
pub fn spawn_stdin_task(tx: mpsc::UnboundedSender<HostEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(e) => warn!("ignoring malformed input line: {e}"),
                },
                Ok(None) => {
                    let _ = tx.send(HostEvent::Quit);
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    let _ = tx.send(HostEvent::Quit);
                    break;
                }
            }
        }
    });
}
