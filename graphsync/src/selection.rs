//! Row selection and ref visibility.

use std::collections::BTreeMap;

use graphsync_core::types::{repo_path_from_ref_id, HiddenRef, RefType, RowKind, WHOLE_REMOTE};
use serde::Deserialize;

use crate::config::ShowDetailsView;
use crate::protocol::SelectedRows;
use crate::provider::CommitDetails;

/// The single selected row. `selected_rows` is always derived from
/// `selected_id` and never set on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionState {
    selected_id: Option<String>,
    selected_rows: Option<SelectedRows>,
    first_selection: bool,
}

impl Default for SelectionState {
    fn default() -> Self {
        Self { selected_id: None, selected_rows: None, first_selection: true }
    }
}

impl SelectionState {
    /// Sets the selection. Returns `false` when the id is unchanged.
    pub fn set(&mut self, id: Option<String>) -> bool {
        if self.selected_id == id {
            return false;
        }
        self.selected_rows = id.as_ref().map(|id| {
            let mut rows = SelectedRows::new();
            rows.insert(id.clone(), true);
            rows
        });
        self.selected_id = id;
        true
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    pub fn selected_rows(&self) -> Option<&SelectedRows> {
        self.selected_rows.as_ref()
    }

    pub fn is_first_selection(&self) -> bool {
        self.first_selection
    }

    /// Marks the next selection as the first one, as when the view reopens.
    pub fn reset_first_selection(&mut self) {
        self.first_selection = true;
    }

    pub fn mark_selected_once(&mut self) {
        self.first_selection = false;
    }
}

/// Whether the details view should stay as it is when showing a selection.
///
/// The first selection after the view opens only reveals details when the
/// user has not turned them off; later ones only when they follow selection.
pub fn preserve_visibility(first_selection: bool, mode: ShowDetailsView) -> bool {
    if first_selection {
        mode == ShowDetailsView::Off
    } else {
        mode != ShowDetailsView::Selection
    }
}

/// Broadcast once a debounced selection change settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionChangeEvent {
    pub id: Option<String>,
    pub kind: Option<RowKind>,
    pub first: bool,
    pub details: Option<CommitDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefItemKind {
    LocalBranch,
    RemoteBranch,
    Tag,
}

/// A branch or tag as the host's context menus describe it. Remote branch
/// names carry their remote, as in `origin/feature`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefItem {
    pub id: String,
    pub name: String,
    pub kind: RefItemKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HideTarget {
    Ref(RefItem),
    Group(Vec<RefItem>),
}

fn split_remote(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((remote, branch)) => (Some(remote), branch),
        None => (None, name),
    }
}

/// Normalizes a hide request into storable entries.
///
/// With `whole_remote`, remote branches are stored under the `*` name so every
/// branch of that remote is hidden while local twins stay visible.
pub fn normalize_hidden_refs(target: &HideTarget, whole_remote: bool) -> Vec<HiddenRef> {
    let items: &[RefItem] = match target {
        HideTarget::Ref(item) => std::slice::from_ref(item),
        HideTarget::Group(items) => items,
    };
    items
        .iter()
        .map(|item| match item.kind {
            RefItemKind::RemoteBranch => {
                let (owner, branch) = split_remote(&item.name);
                HiddenRef {
                    id: item.id.clone(),
                    ref_type: RefType::Remote,
                    name: if whole_remote { WHOLE_REMOTE.to_owned() } else { branch.to_owned() },
                    owner: owner.map(str::to_owned),
                }
            }
            RefItemKind::LocalBranch => HiddenRef {
                id: item.id.clone(),
                ref_type: RefType::Head,
                name: item.name.clone(),
                owner: None,
            },
            RefItemKind::Tag => HiddenRef {
                id: item.id.clone(),
                ref_type: RefType::Tag,
                name: item.name.clone(),
                owner: None,
            },
        })
        .collect()
}

/// Keeps only the hidden refs that belong to `repo_path`.
///
/// Stored entries are trusted as-is; they are not checked against the
/// repository's live branches and tags.
pub fn filter_hidden_refs(
    stored: &BTreeMap<String, HiddenRef>,
    repo_path: &str,
) -> BTreeMap<String, HiddenRef> {
    stored
        .iter()
        .filter(|(id, _)| repo_path_from_ref_id(id) == repo_path)
        .map(|(id, r)| (id.clone(), r.clone()))
        .collect()
}
