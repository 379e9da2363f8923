//! Background thread that owns a git2::Repository for its lifetime.
//!
//! git2::Repository is !Send, so it is opened inside the thread and never
//! leaves it. Requests arrive over a crossbeam channel; each carries its own
//! reply sender.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use git2::{Commit, ErrorCode, Oid, Repository, Sort, Status, StatusOptions};
use graphsync_core::types::{GraphRow, RefType, RowKind, RowRef, WorkingTreeStats};
use log::{debug, error};
use regex::{Regex, RegexBuilder};
use tokio_util::sync::CancellationToken;

use crate::config::CommitOrdering;
use crate::git::types::{parse_query, GitRequest, SearchOperator, SearchTerm, WORK_DIR_ID};
use crate::protocol::SearchQuery;
use crate::provider::{CommitDetails, GraphPage, ProviderError, SearchError, SearchPage};

/// Entry point for the worker thread of the repository at `path`.
///
/// Loops until every sender is dropped. If the repository cannot be opened
/// the thread exits at once and callers observe a closed channel.
pub fn git_worker_loop(path: String, rx: Receiver<GitRequest>) {
    let repo = match Repository::open(&path) {
        Ok(r) => r,
        Err(e) => {
            error!("cannot open repository {path}: {e}");
            return;
        }
    };

    for request in rx {
        handle_request(&repo, &path, request);
    }
    debug!("git worker for {path} stopped");
}

/// Reply send errors are ignored; the caller stopped waiting.
fn handle_request(repo: &Repository, path: &str, request: GitRequest) {
    match request {
        GitRequest::Page { anchor, offset, limit, ordering, reply } => {
            let _ = reply.send(load_page(repo, path, anchor.as_deref(), offset, limit, ordering));
        }
        GitRequest::Search { query, offset, limit, ordering, token, reply } => {
            let _ = reply.send(search(repo, &query, offset, limit, ordering, &token));
        }
        GitRequest::WorkingTreeStats { reply } => {
            let _ = reply.send(working_tree_stats(repo));
        }
        GitRequest::ResolveRow { id, kind, reply } => {
            let _ = reply.send(resolve_row(repo, &id, kind));
        }
    }
}

/// Commits in display order.
struct Walk {
    order: Vec<Oid>,
    stashes: HashSet<Oid>,
    /// Index and untracked-file commits of stashes.
    skipped: HashSet<Oid>,
    head: Option<Oid>,
}

fn stash_ids(repo: &Repository) -> Vec<Oid> {
    match repo.reflog("refs/stash") {
        Ok(reflog) => reflog.iter().map(|entry| entry.id_new()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Walks every branch, remote branch, tag, HEAD and stash in `ordering`.
/// Children always come before their parents.
fn walk(repo: &Repository, ordering: CommitOrdering) -> Result<Walk, git2::Error> {
    let head = repo.head().ok().and_then(|h| h.target());
    let stashes: HashSet<Oid> = stash_ids(repo).into_iter().collect();
    let mut skipped = HashSet::new();
    for id in &stashes {
        let commit = repo.find_commit(*id)?;
        skipped.extend(commit.parent_ids().skip(1));
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.set_sorting(match ordering {
        CommitOrdering::Topo => Sort::TOPOLOGICAL,
        CommitOrdering::Date | CommitOrdering::AuthorDate => Sort::TOPOLOGICAL | Sort::TIME,
    })?;
    for glob in ["refs/heads", "refs/remotes", "refs/tags"] {
        revwalk.push_glob(glob)?;
    }
    if let Some(head) = head {
        revwalk.push(head)?;
    }
    for id in &stashes {
        revwalk.push(*id)?;
    }
    let mut order = revwalk.collect::<Result<Vec<_>, _>>()?;
    if ordering == CommitOrdering::AuthorDate {
        order = sort_by_author_date(repo, &order)?;
    }
    order.retain(|id| !skipped.contains(id));

    Ok(Walk { order, stashes, skipped, head })
}

/// Reorders `ids` newest author date first without ever placing a parent
/// before one of its children. Ties keep their position in `ids`.
fn sort_by_author_date(repo: &Repository, ids: &[Oid]) -> Result<Vec<Oid>, git2::Error> {
    let index: HashMap<Oid, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut parents = vec![Vec::new(); ids.len()];
    let mut unvisited_children = vec![0usize; ids.len()];
    let mut times = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let commit = repo.find_commit(*id)?;
        times.push(commit.author().when().seconds());
        for parent in commit.parent_ids() {
            if let Some(&p) = index.get(&parent) {
                parents[i].push(p);
                unvisited_children[p] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<(i64, Reverse<usize>)> = (0..ids.len())
        .filter(|&i| unvisited_children[i] == 0)
        .map(|i| (times[i], Reverse(i)))
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some((_, Reverse(i))) = ready.pop() {
        order.push(ids[i]);
        for &p in &parents[i] {
            unvisited_children[p] -= 1;
            if unvisited_children[p] == 0 {
                ready.push((times[p], Reverse(p)));
            }
        }
    }
    Ok(order)
}

/// Builds the decoration for a full reference name, if it is one the graph
/// draws. Ids have the form `<repo>|heads/<name>`.
fn row_ref(repo_path: &str, full_name: &str, head_branch: Option<&str>) -> Option<RowRef> {
    if let Some(branch) = full_name.strip_prefix("refs/heads/") {
        return Some(RowRef {
            id: format!("{repo_path}|heads/{branch}"),
            name: branch.to_owned(),
            ref_type: RefType::Head,
            owner: None,
            is_current_head: head_branch == Some(branch),
        });
    }
    if let Some(rest) = full_name.strip_prefix("refs/remotes/") {
        let (remote, branch) = rest.split_once('/')?;
        if branch == "HEAD" {
            return None;
        }
        return Some(RowRef {
            id: format!("{repo_path}|remotes/{rest}"),
            name: branch.to_owned(),
            ref_type: RefType::Remote,
            owner: Some(remote.to_owned()),
            is_current_head: false,
        });
    }
    let tag = full_name.strip_prefix("refs/tags/")?;
    Some(RowRef {
        id: format!("{repo_path}|tags/{tag}"),
        name: tag.to_owned(),
        ref_type: RefType::Tag,
        owner: None,
        is_current_head: false,
    })
}

fn decorations(repo: &Repository, repo_path: &str) -> Result<HashMap<Oid, Vec<RowRef>>, git2::Error> {
    let head_branch = repo
        .head()
        .ok()
        .filter(|h| h.is_branch())
        .and_then(|h| h.shorthand().map(str::to_owned));

    let mut refs: HashMap<Oid, Vec<RowRef>> = HashMap::new();
    for reference in repo.references()? {
        let reference = reference?;
        let Some(name) = reference.name() else {
            continue;
        };
        let Some(row_ref) = row_ref(repo_path, name, head_branch.as_deref()) else {
            continue;
        };
        // Tags on trees or blobs have no row.
        let Ok(commit) = reference.peel_to_commit() else {
            continue;
        };
        refs.entry(commit.id()).or_default().push(row_ref);
    }
    Ok(refs)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn commit_time_ms(commit: &Commit<'_>) -> i64 {
    commit.time().seconds() * 1000
}

fn commit_row(
    repo: &Repository,
    id: Oid,
    walk: &Walk,
    refs: &HashMap<Oid, Vec<RowRef>>,
) -> Result<GraphRow, git2::Error> {
    let commit = repo.find_commit(id)?;
    let stash = walk.stashes.contains(&id);
    // A stash only draws its base commit as parent.
    let parents: Vec<String> = if stash {
        commit.parent_ids().take(1).map(|p| p.to_string()).collect()
    } else {
        commit.parent_ids().map(|p| p.to_string()).collect()
    };
    let kind = if stash {
        RowKind::Stash
    } else if commit.parent_count() > 1 {
        RowKind::MergeCommit
    } else {
        RowKind::Commit
    };
    let author = commit.author();
    Ok(GraphRow {
        id: id.to_string(),
        kind,
        parents,
        author: author.name().unwrap_or_default().to_owned(),
        email: author.email().unwrap_or_default().to_owned(),
        date: commit_time_ms(&commit),
        message: commit.message().unwrap_or_default().trim_end().to_owned(),
        refs: refs.get(&id).cloned().unwrap_or_default(),
    })
}

fn work_dir_row(repo: &Repository, head: Option<Oid>) -> Result<Option<GraphRow>, git2::Error> {
    if repo.is_bare() {
        return Ok(None);
    }
    let stats = working_tree_stats(repo)?;
    if stats == WorkingTreeStats::default() {
        return Ok(None);
    }
    Ok(Some(GraphRow {
        id: WORK_DIR_ID.to_owned(),
        kind: RowKind::WorkDir,
        parents: head.map(|h| vec![h.to_string()]).unwrap_or_default(),
        author: String::new(),
        email: String::new(),
        date: now_ms(),
        message: String::new(),
        refs: Vec::new(),
    }))
}

/// Loads rows from walk position `offset`.
///
/// The page is extended past `limit` to include `anchor` when it lies further
/// down. The first page also carries the working-tree row when the tree is
/// dirty, and selects the anchor or else HEAD.
fn load_page(
    repo: &Repository,
    path: &str,
    anchor: Option<&str>,
    offset: usize,
    limit: usize,
    ordering: CommitOrdering,
) -> Result<GraphPage, git2::Error> {
    let walk = walk(repo, ordering)?;
    let refs = decorations(repo, path)?;
    let len = walk.order.len();
    let start = offset.min(len);

    let anchor_pos = anchor
        .and_then(|a| Oid::from_str(a).ok())
        .and_then(|oid| walk.order.iter().position(|id| *id == oid));
    let mut end = start.saturating_add(limit).min(len);
    if let Some(pos) = anchor_pos {
        if pos >= end {
            end = pos + 1;
        }
    }

    let mut rows = Vec::with_capacity(end - start + 1);
    if offset == 0 {
        rows.extend(work_dir_row(repo, walk.head)?);
    }
    for id in &walk.order[start..end] {
        rows.push(commit_row(repo, *id, &walk, &refs)?);
    }

    let has_more = end < len;
    let selected_id = if offset == 0 {
        anchor_pos.map(|p| walk.order[p]).or(walk.head).map(|id| id.to_string())
    } else {
        None
    };
    debug!("{path}: rows {start}..{end} of {len}");

    Ok(GraphPage {
        repo_path: path.to_owned(),
        rows,
        skipped_ids: walk.skipped.iter().map(Oid::to_string).collect(),
        avatars: BTreeMap::new(),
        cursor: has_more.then(|| end.to_string()),
        has_more,
        selected_id,
    })
}

enum Matcher {
    Message(Regex),
    Author(Regex),
    Commit(String),
}

impl Matcher {
    fn new(term: &SearchTerm, query: &SearchQuery) -> Result<Self, SearchError> {
        if term.operator == SearchOperator::Commit {
            return Ok(Matcher::Commit(term.value.to_ascii_lowercase()));
        }
        let pattern = if query.match_regex { term.value.clone() } else { regex::escape(&term.value) };
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(!query.match_case)
            .build()
            .map_err(|e| SearchError::InvalidQuery(e.to_string()))?;
        Ok(match term.operator {
            SearchOperator::Author => Matcher::Author(regex),
            _ => Matcher::Message(regex),
        })
    }

    fn is_match(&self, commit: &Commit<'_>) -> bool {
        match self {
            Matcher::Message(re) => re.is_match(commit.message().unwrap_or_default()),
            Matcher::Author(re) => {
                let author = commit.author();
                author.name().is_some_and(|n| re.is_match(n)) || author.email().is_some_and(|e| re.is_match(e))
            }
            Matcher::Commit(prefix) => commit.id().to_string().starts_with(prefix.as_str()),
        }
    }
}

/// Scans the walk from `offset` until `limit` matches are found.
///
/// The token is checked before every commit; a cancelled search returns
/// [`SearchError::Cancelled`] with nothing partial.
fn search(
    repo: &Repository,
    query: &SearchQuery,
    offset: usize,
    limit: usize,
    ordering: CommitOrdering,
    token: &CancellationToken,
) -> Result<SearchPage, SearchError> {
    let terms = parse_query(&query.query);
    if terms.is_empty() {
        return Ok(SearchPage::default());
    }
    let matchers = terms
        .iter()
        .map(|term| Matcher::new(term, query))
        .collect::<Result<Vec<_>, _>>()?;

    let walk = walk(repo, ordering).map_err(ProviderError::from)?;
    let len = walk.order.len();
    let mut position = offset.min(len);
    let mut matches = Vec::new();
    while position < len && matches.len() < limit {
        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        let id = walk.order[position];
        position += 1;
        let commit = repo.find_commit(id).map_err(ProviderError::from)?;
        let matched = if query.match_all {
            matchers.iter().all(|m| m.is_match(&commit))
        } else {
            matchers.iter().any(|m| m.is_match(&commit))
        };
        if matched {
            matches.push((id.to_string(), commit_time_ms(&commit)));
        }
    }

    let has_more = position < len;
    Ok(SearchPage { matches, cursor: has_more.then(|| position.to_string()), has_more })
}

fn working_tree_stats(repo: &Repository) -> Result<WorkingTreeStats, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut stats = WorkingTreeStats::default();
    for entry in statuses.iter() {
        let status = entry.status();
        if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
            stats.added += 1;
        } else if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
            stats.deleted += 1;
        } else if status.intersects(
            Status::WT_MODIFIED
                | Status::INDEX_MODIFIED
                | Status::WT_RENAMED
                | Status::INDEX_RENAMED
                | Status::WT_TYPECHANGE
                | Status::INDEX_TYPECHANGE,
        ) {
            stats.modified += 1;
        }
    }
    Ok(stats)
}

fn resolve_row(repo: &Repository, id: &str, kind: RowKind) -> Result<Option<CommitDetails>, git2::Error> {
    if kind == RowKind::WorkDir {
        let head = repo.head().ok().and_then(|h| h.target());
        return Ok(Some(CommitDetails {
            id: id.to_owned(),
            kind,
            author: String::new(),
            email: String::new(),
            date: now_ms(),
            message: String::new(),
            parents: head.map(|h| vec![h.to_string()]).unwrap_or_default(),
        }));
    }

    let Ok(oid) = Oid::from_str(id) else {
        return Ok(None);
    };
    let commit = match repo.find_commit(oid) {
        Ok(commit) => commit,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let author = commit.author();
    Ok(Some(CommitDetails {
        id: id.to_owned(),
        kind,
        author: author.name().unwrap_or_default().to_owned(),
        email: author.email().unwrap_or_default().to_owned(),
        date: commit_time_ms(&commit),
        message: commit.message().unwrap_or_default().to_owned(),
        parents: commit.parent_ids().map(|p| p.to_string()).collect(),
    }))
}
