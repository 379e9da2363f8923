//! Owned data types shared by the storage layer and the session controller.
//!
//! Every type here serializes in the rendering surface's camelCase wire format,
//! so the same value can be persisted, held in session state and posted over the
//! message channel without a translation layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a graph row represents.
///
/// The selection follow-on uses the kind to decide whether to resolve a commit,
/// a stash entry or the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowKind {
    #[default]
    Commit,
    MergeCommit,
    Stash,
    /// Synthetic row for uncommitted working-tree changes.
    WorkDir,
    Other,
}

/// Kind of a ref decoration, as stored in the hidden-refs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    /// Local branch.
    Head,
    /// Remote-tracking branch.
    Remote,
    Tag,
}

impl RefType {
    /// Storage spelling, matching the `CHECK` constraint in the schema.
    pub fn as_str(self) -> &'static str {
        match self {
            RefType::Head => "head",
            RefType::Remote => "remote",
            RefType::Tag => "tag",
        }
    }

    /// Parses the storage spelling back; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "head" => Some(RefType::Head),
            "remote" => Some(RefType::Remote),
            "tag" => Some(RefType::Tag),
            _ => None,
        }
    }
}

/// A ref decoration drawn on a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRef {
    /// `<repoPath>|<kind>/<name>`; see [`repo_path_from_ref_id`].
    pub id: String,
    pub name: String,
    pub ref_type: RefType,
    /// Remote name for remote-tracking branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub is_current_head: bool,
}

/// One materialized row of the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RowKind,
    pub parents: Vec<String>,
    pub author: String,
    pub email: String,
    /// Commit time, milliseconds since the Unix epoch.
    pub date: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<RowRef>,
}

/// A ref the user has hidden from the graph.
///
/// For remote-tracking branches `owner` holds the remote name. A `name` of `*`
/// hides every branch of that remote while leaving local twins visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenRef {
    pub id: String,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Wildcard name stored when a whole remote is hidden.
pub const WHOLE_REMOTE: &str = "*";

/// Returns the repository path encoded in a branch or tag id.
///
/// Ids have the form `<repoPath>|<kind>/<name>`; everything before the first `|`
/// is the repository path. An id without a separator is returned whole.
pub fn repo_path_from_ref_id(id: &str) -> &str {
    id.split('|').next().unwrap_or(id)
}

/// Graph table columns the surface can resize or hide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnName {
    Ref,
    Graph,
    Message,
    Author,
    Datetime,
    Sha,
}

impl ColumnName {
    pub const ALL: [ColumnName; 6] = [
        ColumnName::Ref,
        ColumnName::Graph,
        ColumnName::Message,
        ColumnName::Author,
        ColumnName::Datetime,
        ColumnName::Sha,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnName::Ref => "ref",
            ColumnName::Graph => "graph",
            ColumnName::Message => "message",
            ColumnName::Author => "author",
            ColumnName::Datetime => "datetime",
            ColumnName::Sha => "sha",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Width used when the user never resized the column.
    pub fn default_width(self) -> u32 {
        match self {
            ColumnName::Ref | ColumnName::Graph => 150,
            ColumnName::Message => 300,
            ColumnName::Author | ColumnName::Datetime | ColumnName::Sha => 130,
        }
    }
}

/// A partial, user-edited column configuration. Unset fields fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_hidden: Option<bool>,
}

/// A fully resolved column setting, as sent to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSetting {
    pub width: u32,
    pub is_hidden: bool,
}

pub type ColumnSettings = BTreeMap<ColumnName, ColumnSetting>;

/// Merges stored column configs over the built-in defaults.
pub fn resolve_column_settings(stored: &BTreeMap<ColumnName, ColumnConfig>) -> ColumnSettings {
    ColumnName::ALL
        .into_iter()
        .map(|name| {
            let cfg = stored.get(&name).copied().unwrap_or_default();
            let setting = ColumnSetting {
                width: cfg.width.unwrap_or_else(|| name.default_width()),
                is_hidden: cfg.is_hidden.unwrap_or(false),
            };
            (name, setting)
        })
        .collect()
}

/// Comma-separated names of hidden columns, used as the header context value.
pub fn hidden_columns_context(stored: &BTreeMap<ColumnName, ColumnConfig>) -> String {
    stored
        .iter()
        .filter(|(_, cfg)| cfg.is_hidden == Some(true))
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Counts of uncommitted changes in the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkingTreeStats {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
}

/// Dismissable banners shown at the top of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKey {
    Preview,
    Trial,
}

impl BannerKey {
    pub fn as_str(self) -> &'static str {
        match self {
            BannerKey::Preview => "preview",
            BannerKey::Trial => "trial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preview" => Some(BannerKey::Preview),
            "trial" => Some(BannerKey::Trial),
            _ => None,
        }
    }
}
