use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::hierarchy::{HierarchySnapshot, KindFilter, PageId, PageRecord};
use crate::migrate::{ensure_db_parent, open_connection, run_migrations};
use crate::model::KindGraph;
use crate::runtime::{ResolvedPaths, normalize_for_display};

#[derive(Debug, Deserialize)]
struct PageFile {
    #[serde(default)]
    pages: Vec<PageRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageIndexReport {
    pub db_path: String,
    pub indexed_pages: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredPageStats {
    pub indexed_pages: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub max_depth: usize,
}

/// Collect page declarations from every `pages/*.toml` file. Order across
/// files is the walk order; ids are validated later when the snapshot is
/// built, not here.
pub fn scan_page_records(pages_dir: &Path) -> Result<Vec<PageRecord>> {
    let mut records = Vec::new();
    if !pages_dir.exists() {
        return Ok(records);
    }

    for entry in WalkDir::new(pages_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", pages_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: PageFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        records.extend(parsed.pages);
    }
    Ok(records)
}

/// Validate the declared pages and replace the stored index with them in one
/// transaction. Each row carries its materialized path (`/1/4/9/`) and depth
/// so stored resolution can work on path prefixes alone.
pub fn rebuild_index(paths: &ResolvedPaths) -> Result<PageIndexReport> {
    let records = scan_page_records(&paths.pages_dir)?;
    if records.is_empty() {
        bail!(
            "no pages declared under {}; nothing to index",
            normalize_for_display(&paths.pages_dir)
        );
    }
    let snapshot = HierarchySnapshot::from_records(records)
        .context("page declarations do not form a valid hierarchy")?;

    ensure_db_parent(paths)?;
    run_migrations(paths).context("failed to prepare page index schema")?;
    let mut connection = open_connection(paths)?;
    let indexed_at_unix = unix_timestamp()?;

    // parents must be inserted before children to satisfy the FK
    let mut ordered: Vec<&PageRecord> = snapshot.pages().collect();
    ordered.sort_by_key(|page| (snapshot.depth(page.id), page.id));

    let transaction = connection
        .transaction()
        .context("failed to start index rebuild transaction")?;
    transaction
        .execute("DELETE FROM pages", [])
        .context("failed to clear pages table")?;

    let mut statement = transaction
        .prepare(
            "INSERT INTO pages (
                id,
                parent_id,
                kind,
                title,
                slug,
                path,
                depth,
                indexed_at_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .context("failed to prepare pages insert")?;

    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut max_depth = 0usize;
    for page in &ordered {
        let depth = snapshot.depth(page.id);
        max_depth = max_depth.max(depth);
        *by_kind.entry(page.kind.clone()).or_insert(0) += 1;
        statement
            .execute(params![
                page.id,
                page.parent,
                page.kind,
                page.title,
                page.slug,
                materialized_path(&snapshot, page.id),
                i64::try_from(depth).context("depth does not fit into i64")?,
                i64::try_from(indexed_at_unix).context("timestamp does not fit into i64")?,
            ])
            .with_context(|| format!("failed to insert page {}", page.id))?;
    }
    drop(statement);

    transaction
        .commit()
        .context("failed to commit index rebuild transaction")?;

    Ok(PageIndexReport {
        db_path: normalize_for_display(&paths.db_path),
        indexed_pages: snapshot.len(),
        by_kind,
        max_depth,
    })
}

/// Rehydrate the stored index into an in-memory snapshot. Returns None when
/// the database or the pages table does not exist yet.
pub fn load_snapshot(paths: &ResolvedPaths) -> Result<Option<HierarchySnapshot>> {
    let connection = match open_indexed_connection(paths)? {
        Some(connection) => connection,
        None => return Ok(None),
    };

    let mut statement = connection
        .prepare("SELECT id, parent_id, kind, title, slug FROM pages ORDER BY id ASC")
        .context("failed to prepare pages query")?;
    let rows = statement
        .query_map([], |row| {
            Ok(PageRecord {
                id: row.get(0)?,
                parent: row.get(1)?,
                kind: row.get(2)?,
                title: row.get(3)?,
                slug: row.get(4)?,
            })
        })
        .context("failed to run pages query")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("failed to decode page row")?);
    }
    if records.is_empty() {
        return Ok(None);
    }
    let snapshot = HierarchySnapshot::from_records(records)
        .context("stored page index is not a valid hierarchy")?;
    Ok(Some(snapshot))
}

pub fn load_index_stats(paths: &ResolvedPaths) -> Result<Option<StoredPageStats>> {
    let connection = match open_indexed_connection(paths)? {
        Some(connection) => connection,
        None => return Ok(None),
    };

    let indexed_pages = count_query(&connection, "SELECT COUNT(*) FROM pages")
        .context("failed to count indexed pages")?;
    let max_depth = count_query(&connection, "SELECT COALESCE(MAX(depth), 0) FROM pages")
        .context("failed to read max depth")?;
    let by_kind = kind_counts(&connection)?;

    Ok(Some(StoredPageStats {
        indexed_pages,
        by_kind,
        max_depth,
    }))
}

/// Stored twin of `hierarchy::resolve_root`: the kind filter is expanded to
/// the concrete kinds it covers, matching rows are fetched by an IN query,
/// and the deepest shared ancestor is the longest common prefix of their
/// materialized paths. Returns None when no index has been built.
pub fn resolve_root_stored(
    paths: &ResolvedPaths,
    filter: &KindFilter,
    kinds: &KindGraph,
) -> Result<Option<PageRecord>> {
    let connection = match open_indexed_connection(paths)? {
        Some(connection) => connection,
        None => return Ok(None),
    };
    let root = match load_root_row(&connection)? {
        Some(root) => root,
        None => return Ok(None),
    };

    let wanted = match filter {
        KindFilter::Any => return Ok(Some(root)),
        KindFilter::Kinds(wanted) => kinds.expand(wanted),
    };
    if wanted.is_empty() {
        return Ok(Some(root));
    }

    let placeholders = (1..=wanted.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT path FROM pages WHERE kind IN ({placeholders}) ORDER BY id ASC");
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare kind match query")?;
    let values: Vec<&str> = wanted.iter().map(String::as_str).collect();
    let rows = statement
        .query_map(rusqlite::params_from_iter(values), |row| {
            row.get::<_, String>(0)
        })
        .context("failed to run kind match query")?;

    let mut prefix: Option<Vec<PageId>> = None;
    for row in rows {
        let path = row.context("failed to decode page path")?;
        let ids = parse_materialized_path(&path)?;
        prefix = Some(match prefix {
            None => ids,
            Some(mut current) => {
                let common = current
                    .iter()
                    .zip(ids.iter())
                    .take_while(|(left, right)| left == right)
                    .count();
                current.truncate(common);
                current
            }
        });
    }

    let lca = match prefix.as_deref().and_then(<[PageId]>::last) {
        Some(id) => *id,
        None => return Ok(Some(root)),
    };
    let resolved = load_page_row(&connection, lca)?;
    Ok(Some(resolved.unwrap_or(root)))
}

fn materialized_path(snapshot: &HierarchySnapshot, id: PageId) -> String {
    let mut out = String::from("/");
    for ancestor in snapshot.ancestor_chain(id) {
        out.push_str(&ancestor.to_string());
        out.push('/');
    }
    out
}

fn parse_materialized_path(path: &str) -> Result<Vec<PageId>> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .parse::<PageId>()
                .with_context(|| format!("invalid page id `{segment}` in stored path `{path}`"))
        })
        .collect()
}

fn load_root_row(connection: &Connection) -> Result<Option<PageRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT id, parent_id, kind, title, slug
             FROM pages
             WHERE parent_id IS NULL
             LIMIT 1",
        )
        .context("failed to prepare root lookup")?;
    let mut rows = statement.query([]).context("failed to run root lookup")?;
    match rows.next().context("failed to read root row")? {
        Some(row) => Ok(Some(decode_page_row(row)?)),
        None => Ok(None),
    }
}

fn load_page_row(connection: &Connection, id: PageId) -> Result<Option<PageRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT id, parent_id, kind, title, slug
             FROM pages
             WHERE id = ?1
             LIMIT 1",
        )
        .context("failed to prepare page lookup")?;
    let mut rows = statement
        .query([id])
        .context("failed to run page lookup")?;
    match rows.next().context("failed to read page row")? {
        Some(row) => Ok(Some(decode_page_row(row)?)),
        None => Ok(None),
    }
}

fn decode_page_row(row: &rusqlite::Row<'_>) -> Result<PageRecord> {
    Ok(PageRecord {
        id: row.get(0).context("failed to decode page id")?,
        parent: row.get(1).context("failed to decode page parent")?,
        kind: row.get(2).context("failed to decode page kind")?,
        title: row.get(3).context("failed to decode page title")?,
        slug: row.get(4).context("failed to decode page slug")?,
    })
}

fn open_indexed_connection(paths: &ResolvedPaths) -> Result<Option<Connection>> {
    if !paths.db_path.exists() {
        return Ok(None);
    }
    let connection = open_connection(paths)?;
    if !table_exists(&connection, "pages")? {
        return Ok(None);
    }
    Ok(Some(connection))
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

fn kind_counts(connection: &Connection) -> Result<BTreeMap<String, usize>> {
    let mut statement = connection
        .prepare(
            "SELECT kind, COUNT(*) AS count
             FROM pages
             GROUP BY kind
             ORDER BY kind ASC",
        )
        .context("failed to prepare kind aggregation query")?;

    let rows = statement
        .query_map([], |row| {
            let kind: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((kind, count))
        })
        .context("failed to run kind aggregation query")?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (kind, count) = row.context("failed to read kind aggregation row")?;
        let count = usize::try_from(count).context("kind count does not fit into usize")?;
        out.insert(kind, count);
    }
    Ok(out)
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{load_index_stats, load_snapshot, rebuild_index, resolve_root_stored};
    use crate::hierarchy::{KindFilter, resolve_root};
    use crate::model::KindGraph;
    use crate::runtime::{ResolvedPaths, ValueSource};

    fn paths(project_root: &Path) -> ResolvedPaths {
        ResolvedPaths {
            models_dir: project_root.join("models"),
            pages_dir: project_root.join("pages"),
            state_dir: project_root.join(".edittool"),
            data_dir: project_root.join(".edittool").join("data"),
            db_path: project_root
                .join(".edittool")
                .join("data")
                .join("edittool.db"),
            config_path: project_root.join(".edittool").join("config.toml"),
            project_root: project_root.to_path_buf(),
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    fn write_events_site(pages_dir: &Path) {
        fs::create_dir_all(pages_dir).expect("create pages dir");
        fs::write(
            pages_dir.join("site.toml"),
            r#"
[[pages]]
id = 1
kind = "page"
title = "Root"
slug = "root"

[[pages]]
id = 2
parent = 1
kind = "event_index_page"
title = "Events index"
slug = "events"

[[pages]]
id = 5
parent = 1
kind = "about_page"
title = "About"
slug = "about"
"#,
        )
        .expect("write site.toml");
        fs::write(
            pages_dir.join("events.toml"),
            r#"
[[pages]]
id = 3
parent = 2
kind = "event_page"
title = "Event 1"
slug = "event-1"

[[pages]]
id = 4
parent = 2
kind = "event_page"
title = "Event 2"
slug = "event-2"
"#,
        )
        .expect("write events.toml");
    }

    fn flat_graph(kinds: &[&str]) -> KindGraph {
        let mut graph = KindGraph::default();
        for kind in kinds {
            graph.insert(kind, None);
        }
        graph
    }

    #[test]
    fn rebuild_index_persists_declared_pages() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);
        write_events_site(&paths.pages_dir);

        let report = rebuild_index(&paths).expect("rebuild");
        assert!(paths.db_path.exists());
        assert_eq!(report.indexed_pages, 5);
        assert_eq!(report.max_depth, 2);
        assert_eq!(report.by_kind.get("event_page"), Some(&2));

        let stats = load_index_stats(&paths)
            .expect("load stats")
            .expect("stats must exist");
        assert_eq!(stats.indexed_pages, 5);
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn rebuild_index_rejects_invalid_hierarchy() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);
        fs::create_dir_all(&paths.pages_dir).expect("create pages dir");
        fs::write(
            paths.pages_dir.join("broken.toml"),
            "[[pages]]\nid = 1\nparent = 9\nkind = \"page\"\ntitle = \"Stray\"\nslug = \"stray\"\n",
        )
        .expect("write broken.toml");

        let error = rebuild_index(&paths).expect_err("must fail");
        assert!(error.to_string().contains("valid hierarchy"));
    }

    #[test]
    fn stored_snapshot_round_trips() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);
        write_events_site(&paths.pages_dir);
        rebuild_index(&paths).expect("rebuild");

        let snapshot = load_snapshot(&paths)
            .expect("load snapshot")
            .expect("snapshot must exist");
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.root().id, 1);
        assert_eq!(snapshot.ancestor_chain(4), vec![1, 2, 4]);
    }

    #[test]
    fn stored_resolution_agrees_with_in_memory_resolver() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);
        write_events_site(&paths.pages_dir);
        rebuild_index(&paths).expect("rebuild");

        let snapshot = load_snapshot(&paths)
            .expect("load snapshot")
            .expect("snapshot must exist");
        let graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);

        for filter in [
            KindFilter::Any,
            KindFilter::from_kinds(["event_page"]),
            KindFilter::from_kinds(["about_page"]),
            KindFilter::from_kinds(["event_page", "about_page"]),
            KindFilter::from_kinds(["gallery_page"]),
        ] {
            let in_memory = resolve_root(&snapshot, &filter, &graph);
            let stored = resolve_root_stored(&paths, &filter, &graph)
                .expect("stored resolve")
                .expect("index must exist");
            assert_eq!(stored.id, in_memory.id, "filter {filter:?} diverged");
        }
    }

    #[test]
    fn stored_resolution_matches_specialized_kinds() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);
        write_events_site(&paths.pages_dir);
        fs::write(
            paths.pages_dir.join("gala.toml"),
            "[[pages]]\nid = 6\nparent = 2\nkind = \"gala_event_page\"\ntitle = \"Gala\"\nslug = \"gala\"\n",
        )
        .expect("write gala.toml");
        rebuild_index(&paths).expect("rebuild");

        let mut graph = flat_graph(&["page", "event_page", "event_index_page", "about_page"]);
        graph.insert("gala_event_page", Some("event_page"));

        let resolved = resolve_root_stored(&paths, &KindFilter::from_kinds(["event_page"]), &graph)
            .expect("stored resolve")
            .expect("index must exist");
        assert_eq!(resolved.title, "Events index");
    }

    #[test]
    fn queries_return_none_without_an_index() {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        let paths = paths(&project_root);

        assert!(load_snapshot(&paths).expect("load snapshot").is_none());
        assert!(load_index_stats(&paths).expect("load stats").is_none());
        let graph = KindGraph::default();
        assert!(
            resolve_root_stored(&paths, &KindFilter::Any, &graph)
                .expect("stored resolve")
                .is_none()
        );
    }
}
