//! The loaded slice of the commit graph.
//!
//! A [`GraphWindow`] is an immutable value: expanding it with another page
//! produces a new window that the controller swaps in. The continuation cursor
//! is held here as plain data; fetching is the controller's job.

use std::collections::{BTreeMap, HashSet};

use graphsync_core::types::GraphRow;

use crate::protocol::Paging;
use crate::provider::GraphPage;

/// Where an id stands relative to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPresence {
    Known,
    /// Exists upstream but is never rendered.
    Skipped,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphWindow {
    repo_path: String,
    rows: Vec<GraphRow>,
    ids: HashSet<String>,
    skipped_ids: HashSet<String>,
    avatars: BTreeMap<String, String>,
    cursor: Option<String>,
    has_more: bool,
    selected_id: Option<String>,
}

impl GraphWindow {
    /// Builds a window from an initial page.
    pub fn from_page(page: GraphPage) -> Self {
        let mut window = GraphWindow {
            repo_path: page.repo_path,
            selected_id: page.selected_id,
            avatars: page.avatars,
            cursor: page.cursor,
            has_more: page.has_more,
            ..GraphWindow::default()
        };
        window.push_rows(page.rows);
        window.skipped_ids = page
            .skipped_ids
            .into_iter()
            .filter(|id| !window.ids.contains(id))
            .collect();
        window
    }

    /// Returns a new window holding every row of `self` followed by the new
    /// rows of `page`. Rows already present are not duplicated.
    pub fn with_page(&self, page: GraphPage) -> Self {
        let mut next = self.clone();
        next.push_rows(page.rows);
        next.skipped_ids.extend(page.skipped_ids);
        let ids = &next.ids;
        next.skipped_ids.retain(|id| !ids.contains(id));
        for (email, uri) in page.avatars {
            next.avatars.entry(email).or_insert(uri);
        }
        next.cursor = page.cursor;
        next.has_more = page.has_more;
        if next.selected_id.is_none() {
            next.selected_id = page.selected_id;
        }
        next
    }

    fn push_rows(&mut self, rows: Vec<GraphRow>) {
        for row in rows {
            if self.ids.insert(row.id.clone()) {
                self.rows.push(row);
            }
        }
    }

    pub fn repo_path(&self) -> &str {
        &self.repo_path
    }

    pub fn rows(&self) -> &[GraphRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn is_skipped(&self, id: &str) -> bool {
        self.skipped_ids.contains(id)
    }

    pub fn presence(&self, id: &str) -> RowPresence {
        if self.skipped_ids.contains(id) {
            RowPresence::Skipped
        } else if self.ids.contains(id) {
            RowPresence::Known
        } else {
            RowPresence::Missing
        }
    }

    pub fn skipped_ids(&self) -> &HashSet<String> {
        &self.skipped_ids
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    pub fn avatars(&self) -> &BTreeMap<String, String> {
        &self.avatars
    }

    pub fn has_avatar(&self, email: &str) -> bool {
        self.avatars.contains_key(email)
    }

    /// Adds resolved avatars. Existing entries are never removed.
    pub fn merge_avatars(&mut self, resolved: impl IntoIterator<Item = (String, String)>) {
        self.avatars.extend(resolved);
    }

    /// Cursor for the next page, present only while more rows are advertised.
    pub fn continuation(&self) -> Option<&str> {
        if self.has_more {
            self.cursor.as_deref()
        } else {
            None
        }
    }

    pub fn paging(&self) -> Paging {
        Paging { starting_cursor: self.cursor.clone(), has_more: self.has_more }
    }
}
