//! Full path reconstruction over the flat record set.
//!
//! The MFT only stores `(id, parent id, name)` per record. Paths are resolved
//! iteratively with an explicit memo map; every walk keeps its own visited
//! set so cycles and dangling parents left behind by corruption fall back to
//! the bare name instead of looping.

use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::mft::FileRecord;

pub const PATH_SEPARATOR: char = '\\';

/// Resolve the full path of every record, keyed by record id.
///
/// With duplicate ids, the last record wins.
pub fn resolve_paths(records: &[FileRecord]) -> HashMap<u64, String> {
    let by_id: HashMap<u64, &FileRecord> = records.iter().map(|r| (r.record_id, r)).collect();

    let mut memo: HashMap<u64, String> = HashMap::with_capacity(by_id.len());
    let mut unresolved = 0usize;

    // Input order, so cycle fallbacks do not depend on hashing.
    for start in records.iter().map(|r| r.record_id) {
        if memo.contains_key(&start) {
            continue;
        }

        // Climb until something already known, a root-level entry, a missing
        // parent, or a cycle.
        let mut chain: Vec<u64> = Vec::new();
        let mut on_chain: HashSet<u64> = HashSet::new();
        let mut base: Option<String> = None;
        let mut id = start;
        loop {
            if let Some(known) = memo.get(&id) {
                base = Some(known.clone());
                break;
            }
            let entry = by_id[&id];
            let (parent, name) = (entry.parent_directory_id, entry.file_name.as_str());
            chain.push(id);
            on_chain.insert(id);

            if entry.is_root_level() {
                break;
            }
            if !by_id.contains_key(&parent) {
                unresolved += 1;
                debug!("Record {} ({}) references missing parent {}", id, name, parent);
                break;
            }
            if on_chain.contains(&parent) {
                unresolved += 1;
                debug!("Record {} ({}) closes a parent cycle via {}", id, name, parent);
                break;
            }
            id = parent;
        }

        // Unwind: the deepest entry on the chain is either rooted at `base`
        // or stands alone under its own name.
        let mut prefix = base;
        while let Some(id) = chain.pop() {
            let name = &by_id[&id].file_name;
            let path = match prefix {
                Some(p) => format!("{}{}{}", p, PATH_SEPARATOR, name),
                None => name.to_string(),
            };
            memo.insert(id, path.clone());
            prefix = Some(path);
        }
    }

    if unresolved > 0 {
        info!("{} records have an unresolvable parent chain", unresolved);
    }
    memo
}

/// Fill `full_path` on every record.
pub fn reconstruct_paths(records: &mut [FileRecord]) {
    info!("Building full paths for {} entries", records.len());
    let paths = resolve_paths(records);
    for record in records.iter_mut() {
        record.full_path = paths.get(&record.record_id).cloned();
    }
}

/// Normalise a user supplied path: `/` becomes `\`, a leading `\\.\` or
/// drive letter and leading separators are dropped.
pub fn normalize_query(query: &str) -> String {
    let mut path = query.replace('/', "\\");
    if let Some(rest) = path.strip_prefix("\\\\.\\") {
        path = rest.to_string();
    }
    if let Some(idx) = path.find(":\\") {
        path = path[idx + 2..].to_string();
    }
    path.trim_start_matches(PATH_SEPARATOR).to_string()
}

/// Case-insensitive lookup of a record by its reconstructed path.
pub fn find_by_path<'a>(records: &'a [FileRecord], query: &str) -> Vec<&'a FileRecord> {
    let wanted = normalize_query(query).to_lowercase();
    records
        .iter()
        .filter(|r| {
            r.full_path
                .as_deref()
                .is_some_and(|p| p.to_lowercase() == wanted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, parent: u64, name: &str) -> FileRecord {
        FileRecord {
            record_id: id,
            parent_directory_id: parent,
            file_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_nested_path() {
        let records = vec![rec(5, 5, "."), rec(10, 5, "docs"), rec(20, 10, "a.txt")];
        let paths = resolve_paths(&records);
        assert_eq!(paths[&20], "docs\\a.txt");
        assert_eq!(paths[&10], "docs");
        assert_eq!(paths[&5], ".");
    }

    #[test]
    fn test_deep_chain_shares_ancestors() {
        let mut records = vec![rec(5, 5, ".")];
        for id in 100..2100u64 {
            records.push(rec(id, if id == 100 { 5 } else { id - 1 }, "d"));
        }
        records.push(rec(9000, 2099, "leaf"));
        let paths = resolve_paths(&records);
        assert_eq!(paths[&100], "d");
        assert_eq!(paths[&101], "d\\d");
        assert_eq!(paths[&9000].matches('\\').count(), 2000);
        assert!(paths[&9000].ends_with("\\leaf"));
    }

    #[test]
    fn test_self_reference_and_missing_parent() {
        let records = vec![rec(30, 30, "self"), rec(40, 777, "orphan"), rec(41, 40, "child")];
        let paths = resolve_paths(&records);
        assert_eq!(paths[&30], "self");
        assert_eq!(paths[&40], "orphan");
        assert_eq!(paths[&41], "orphan\\child");
    }

    #[test]
    fn test_cycle_terminates() {
        let records = vec![rec(50, 51, "a"), rec(51, 52, "b"), rec(52, 50, "c")];
        let paths = resolve_paths(&records);
        assert_eq!(paths.len(), 3);
        for p in paths.values() {
            assert!(p.split('\\').count() <= 3, "{p}");
        }
    }

    #[test]
    fn test_cycle_breaks_at_first_record_in_input_order() {
        let records = vec![rec(50, 51, "a"), rec(51, 52, "b"), rec(52, 50, "c")];
        for _ in 0..16 {
            let paths = resolve_paths(&records);
            assert_eq!(paths[&52], "c");
            assert_eq!(paths[&51], "c\\b");
            assert_eq!(paths[&50], "c\\b\\a");
        }

        let reordered = vec![rec(52, 50, "c"), rec(50, 51, "a"), rec(51, 52, "b")];
        let paths = resolve_paths(&reordered);
        assert_eq!(paths[&51], "b");
        assert_eq!(paths[&52], "b\\a\\c");
    }

    #[test]
    fn test_reconstruct_and_find() {
        let mut records = vec![rec(5, 5, "."), rec(10, 5, "Docs"), rec(20, 10, "A.txt")];
        reconstruct_paths(&mut records);
        assert_eq!(records[2].full_path.as_deref(), Some("Docs\\A.txt"));

        let hits = find_by_path(&records, "C:\\docs\\a.txt");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, 20);
        assert_eq!(find_by_path(&records, "//./C:/Docs/A.txt").len(), 1);
        assert!(find_by_path(&records, "docs\\b.txt").is_empty());
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("C:\\Users\\x"), "Users\\x");
        assert_eq!(normalize_query("\\Users/x"), "Users\\x");
        assert_eq!(normalize_query("\\\\.\\D:\\y"), "y");
    }
}
