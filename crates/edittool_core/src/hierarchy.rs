use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::KindGraph;

pub type PageId = i64;

/// One item of the page containment hierarchy, as stored in the page index or
/// declared in `pages/*.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PageRecord {
    pub id: PageId,
    #[serde(default)]
    pub parent: Option<PageId>,
    pub kind: String,
    pub title: String,
    pub slug: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("hierarchy has no root page")]
    NoRoot,
    #[error("hierarchy has multiple roots: pages {0} and {1}")]
    MultipleRoots(PageId, PageId),
    #[error("duplicate page id {0}")]
    DuplicateId(PageId),
    #[error("page {page} references missing parent {parent}")]
    MissingParent { page: PageId, parent: PageId },
    #[error("page {0} participates in a parent cycle")]
    Cycle(PageId),
}

/// A validated, read-only view of the page tree for the duration of one
/// resolution call: exactly one root, every parent present, no cycles.
#[derive(Debug, Clone)]
pub struct HierarchySnapshot {
    pages: BTreeMap<PageId, PageRecord>,
    root: PageId,
}

impl HierarchySnapshot {
    pub fn from_records(records: Vec<PageRecord>) -> Result<Self, SnapshotError> {
        let mut pages = BTreeMap::new();
        let mut root = None;
        for record in records {
            if record.parent.is_none() {
                match root {
                    None => root = Some(record.id),
                    Some(existing) => return Err(SnapshotError::MultipleRoots(existing, record.id)),
                }
            }
            if pages.insert(record.id, record.clone()).is_some() {
                return Err(SnapshotError::DuplicateId(record.id));
            }
        }
        let root = root.ok_or(SnapshotError::NoRoot)?;

        let snapshot = Self { pages, root };
        for page in snapshot.pages.values() {
            if let Some(parent) = page.parent
                && !snapshot.pages.contains_key(&parent)
            {
                return Err(SnapshotError::MissingParent {
                    page: page.id,
                    parent,
                });
            }
        }
        // every page must reach the root without revisiting a node
        for page in snapshot.pages.values() {
            let mut seen = BTreeSet::new();
            let mut cursor = page.id;
            loop {
                if !seen.insert(cursor) {
                    return Err(SnapshotError::Cycle(page.id));
                }
                match snapshot.pages[&cursor].parent {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }
        }
        Ok(snapshot)
    }

    pub fn root(&self) -> &PageRecord {
        &self.pages[&self.root]
    }

    pub fn get(&self, id: PageId) -> Option<&PageRecord> {
        self.pages.get(&id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.values()
    }

    /// Inclusive ancestor chain ordered root-first.
    pub fn ancestor_chain(&self, id: PageId) -> Vec<PageId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.pages[&current].parent;
        }
        chain.reverse();
        chain
    }

    pub fn depth(&self, id: PageId) -> usize {
        self.ancestor_chain(id).len() - 1
    }
}

/// Content-kind filter for the chooser start-page resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindFilter {
    /// The universal kind: no filtering at all.
    Any,
    Kinds(BTreeSet<String>),
}

impl KindFilter {
    /// An empty kind list means "no filter".
    pub fn from_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = kinds.into_iter().map(Into::into).collect();
        if set.is_empty() {
            Self::Any
        } else {
            Self::Kinds(set)
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

/// Pick the start page for a hierarchical picker: the deepest page that is an
/// ancestor (inclusive) of every page matching the kind filter. The universal
/// filter short-circuits to the root; an empty match set degrades to the root
/// rather than erroring.
pub fn resolve_root<'a>(
    snapshot: &'a HierarchySnapshot,
    filter: &KindFilter,
    kinds: &KindGraph,
) -> &'a PageRecord {
    let wanted = match filter {
        KindFilter::Any => return snapshot.root(),
        KindFilter::Kinds(wanted) => wanted,
    };

    let matching: Vec<PageId> = snapshot
        .pages()
        .filter(|page| kinds.matches(&page.kind, wanted))
        .map(|page| page.id)
        .collect();
    let Some((first, rest)) = matching.split_first() else {
        return snapshot.root();
    };

    // longest common prefix of the root-first ancestor chains
    let mut prefix = snapshot.ancestor_chain(*first);
    for id in rest {
        let chain = snapshot.ancestor_chain(*id);
        let common = prefix
            .iter()
            .zip(chain.iter())
            .take_while(|(left, right)| left == right)
            .count();
        prefix.truncate(common);
    }
    let lca = *prefix.last().unwrap_or(&snapshot.root().id);
    snapshot.get(lca).unwrap_or_else(|| snapshot.root())
}

#[cfg(test)]
mod tests {
    use super::{HierarchySnapshot, KindFilter, PageRecord, SnapshotError, resolve_root};
    use crate::model::KindGraph;

    fn page(id: i64, parent: Option<i64>, kind: &str, title: &str) -> PageRecord {
        PageRecord {
            id,
            parent,
            kind: kind.to_string(),
            title: title.to_string(),
            slug: title.to_lowercase().replace(' ', "-"),
        }
    }

    fn events_site() -> HierarchySnapshot {
        HierarchySnapshot::from_records(vec![
            page(1, None, "page", "Root"),
            page(2, Some(1), "event_index_page", "Events index"),
            page(3, Some(2), "event_page", "Event 1"),
            page(4, Some(2), "event_page", "Event 2"),
            page(5, Some(1), "about_page", "About"),
        ])
        .expect("snapshot")
    }

    fn flat_graph(kinds: &[&str]) -> KindGraph {
        let mut graph = KindGraph::default();
        for kind in kinds {
            graph.insert(kind, None);
        }
        graph
    }

    #[test]
    fn snapshot_requires_exactly_one_root() {
        let error = HierarchySnapshot::from_records(vec![
            page(1, None, "page", "Root"),
            page(2, None, "page", "Other root"),
        ])
        .expect_err("must fail");
        assert_eq!(error, SnapshotError::MultipleRoots(1, 2));

        let error = HierarchySnapshot::from_records(Vec::new()).expect_err("must fail");
        assert_eq!(error, SnapshotError::NoRoot);
    }

    #[test]
    fn snapshot_rejects_missing_parent_and_duplicate_id() {
        let error = HierarchySnapshot::from_records(vec![
            page(1, None, "page", "Root"),
            page(2, Some(9), "page", "Stray"),
        ])
        .expect_err("must fail");
        assert_eq!(error, SnapshotError::MissingParent { page: 2, parent: 9 });

        let error = HierarchySnapshot::from_records(vec![
            page(1, None, "page", "Root"),
            page(1, Some(1), "page", "Clone"),
        ])
        .expect_err("must fail");
        assert_eq!(error, SnapshotError::DuplicateId(1));
    }

    #[test]
    fn ancestor_chain_is_root_first_inclusive() {
        let snapshot = events_site();
        assert_eq!(snapshot.ancestor_chain(3), vec![1, 2, 3]);
        assert_eq!(snapshot.ancestor_chain(1), vec![1]);
        assert_eq!(snapshot.depth(3), 2);
    }

    #[test]
    fn universal_filter_returns_root_directly() {
        let snapshot = events_site();
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        let resolved = resolve_root(&snapshot, &KindFilter::Any, &graph);
        assert_eq!(resolved.id, snapshot.root().id);

        // an empty kind list denotes the universal filter
        assert!(KindFilter::from_kinds(Vec::<String>::new()).is_any());
    }

    #[test]
    fn empty_match_set_falls_back_to_root() {
        let snapshot = events_site();
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        let filter = KindFilter::from_kinds(["gallery_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.id, snapshot.root().id);
    }

    #[test]
    fn single_match_resolves_to_itself() {
        let snapshot = events_site();
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        let filter = KindFilter::from_kinds(["about_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.id, 5);
    }

    #[test]
    fn matches_under_one_subtree_resolve_to_their_index() {
        let snapshot = events_site();
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        let filter = KindFilter::from_kinds(["event_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.title, "Events index");
    }

    #[test]
    fn matches_across_subtrees_resolve_to_shared_ancestor() {
        let snapshot = events_site();
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        let filter = KindFilter::from_kinds(["event_page", "about_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.id, snapshot.root().id);
    }

    #[test]
    fn second_event_index_widens_the_resolved_root() {
        let mut records: Vec<PageRecord> = events_site().pages().cloned().collect();
        records.push(page(6, Some(1), "event_index_page", "Events index 2"));
        records.push(page(7, Some(6), "event_page", "Event 3"));
        let snapshot = HierarchySnapshot::from_records(records).expect("snapshot");
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);

        let filter = KindFilter::from_kinds(["event_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.id, snapshot.root().id);
    }

    #[test]
    fn filter_matches_specialized_kinds() {
        let mut records: Vec<PageRecord> = events_site().pages().cloned().collect();
        records.push(page(6, Some(2), "gala_event_page", "Gala"));
        let snapshot = HierarchySnapshot::from_records(records).expect("snapshot");

        let mut graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        graph.insert("gala_event_page", Some("event_page"));

        let filter = KindFilter::from_kinds(["event_page"]);
        let resolved = resolve_root(&snapshot, &filter, &graph);
        assert_eq!(resolved.title, "Events index");
    }
}
