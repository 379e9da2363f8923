//! User configuration for the graph session.
//!
//! Read once at startup from `$XDG_CONFIG_HOME/graphsync/config.toml` and
//! again whenever the host reports a configuration change. Missing keys take
//! their defaults; a missing or unparsable file is a soft failure.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::protocol::ComponentConfig;

/// When the details view follows the graph selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawShowDetailsView")]
pub enum ShowDetailsView {
    /// Only when the graph is opened.
    Open,
    /// On every selection change.
    #[default]
    Selection,
    /// Never.
    Off,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawShowDetailsView {
    Flag(bool),
    Mode(String),
}

impl TryFrom<RawShowDetailsView> for ShowDetailsView {
    type Error = String;

    fn try_from(raw: RawShowDetailsView) -> Result<Self, Self::Error> {
        match raw {
            RawShowDetailsView::Flag(false) => Ok(ShowDetailsView::Off),
            RawShowDetailsView::Flag(true) => Ok(ShowDetailsView::Selection),
            RawShowDetailsView::Mode(mode) => match mode.as_str() {
                "open" => Ok(ShowDetailsView::Open),
                "selection" => Ok(ShowDetailsView::Selection),
                other => Err(format!("unknown show_details_view `{other}`")),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitOrdering {
    #[default]
    Date,
    AuthorDate,
    Topo,
}

/// Debounce windows, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub state_ms: u64,
    pub avatars_ms: u64,
    pub refs_metadata_ms: u64,
    pub selection_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { state_ms: 500, avatars_ms: 100, refs_metadata_ms: 100, selection_ms: 250 }
    }
}

impl DebounceConfig {
    pub fn state(&self) -> Duration {
        Duration::from_millis(self.state_ms)
    }

    pub fn avatars(&self) -> Duration {
        Duration::from_millis(self.avatars_ms)
    }

    pub fn refs_metadata(&self) -> Duration {
        Duration::from_millis(self.refs_metadata_ms)
    }

    pub fn selection(&self) -> Duration {
        Duration::from_millis(self.selection_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub default_item_limit: usize,
    pub page_item_limit: usize,
    pub search_item_limit: usize,
    pub show_details_view: ShowDetailsView,
    pub avatars: bool,
    pub date_format: String,
    pub date_style: String,
    pub highlight_rows_on_ref_hover: bool,
    pub show_ghost_refs_on_row_hover: bool,
    pub show_remote_names: bool,
    pub abbreviated_sha_length: usize,
    pub commit_ordering: CommitOrdering,
    pub debounce: DebounceConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_item_limit: 500,
            page_item_limit: 200,
            search_item_limit: 100,
            show_details_view: ShowDetailsView::default(),
            avatars: true,
            date_format: "short+short".to_owned(),
            date_style: "relative".to_owned(),
            highlight_rows_on_ref_hover: true,
            show_ghost_refs_on_row_hover: true,
            show_remote_names: true,
            abbreviated_sha_length: 7,
            commit_ordering: CommitOrdering::default(),
            debounce: DebounceConfig::default(),
        }
    }
}

/// What a configuration change affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigChange {
    pub ordering: bool,
    pub component: bool,
    pub details_view: bool,
}

impl GraphConfig {
    /// Parses a config file body.
    ///
    /// # Errors
    ///
    /// Returns the `toml` error for malformed input or mistyped keys.
    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Loads the config at `path`, falling back to defaults on any failure.
    pub fn load_from(path: &std::path::Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };
        match Self::parse(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("config parse error in {path:?}: {e}");
                Self::default()
            }
        }
    }

    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn component_config(&self) -> ComponentConfig {
        ComponentConfig {
            avatars: self.avatars,
            date_format: self.date_format.clone(),
            date_style: self.date_style.clone(),
            enable_multi_selection: false,
            highlight_rows_on_ref_hover: self.highlight_rows_on_ref_hover,
            show_ghost_refs_on_row_hover: self.show_ghost_refs_on_row_hover,
            show_remote_names_on_refs: self.show_remote_names,
            id_length: self.abbreviated_sha_length,
        }
    }

    pub fn diff(&self, next: &GraphConfig) -> ConfigChange {
        ConfigChange {
            ordering: self.commit_ordering != next.commit_ordering,
            component: self.component_config() != next.component_config(),
            details_view: self.show_details_view != next.show_details_view,
        }
    }
}

/// Returns the path to the graphsync config file.
///
/// Prefers `$XDG_CONFIG_HOME/graphsync/config.toml`; falls back to
/// `~/.config/graphsync/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("graphsync").join("config.toml")
}
