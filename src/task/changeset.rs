//! ChangeSet: file-level modifications destined for source control.
//!
//! Each task produces a fragment; the orchestrator aggregates the fragments
//! of successful tasks into a new ChangeSet before review and publication.
//! Aggregation never mutates its inputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// `content` replaces the whole file (or creates it)
    Full,
    Delete,
}

/// One file's change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub mode: FileMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

impl FileChange {
    pub fn full(content: impl Into<String>) -> Self {
        Self {
            mode: FileMode::Full,
            content: content.into(),
        }
    }

    pub fn delete() -> Self {
        Self {
            mode: FileMode::Delete,
            content: String::new(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.mode == FileMode::Delete
    }
}

/// Mapping from repository path to change, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeMap<String, FileChange>);

/// Two tasks touched the same path; the later one (in plan order) won.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    pub path: String,
    pub overridden: TaskId,
    pub winner: TaskId,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a change while a fragment is being built. Later writes to the same path win.
    pub fn insert(&mut self, path: impl Into<String>, change: FileChange) {
        self.0.insert(path.into(), change);
    }

    pub fn with(mut self, path: impl Into<String>, change: FileChange) -> Self {
        self.insert(path, change);
        self
    }

    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.0.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileChange)> {
        self.0.iter().map(|(path, change)| (path.as_str(), change))
    }

    /// Aggregate task fragments, given in plan order, into a new ChangeSet.
    ///
    /// When two fragments touch the same path the later one wins and the
    /// collision is reported.
    pub fn aggregate<'a, I>(fragments: I) -> (ChangeSet, Vec<PathConflict>)
    where
        I: IntoIterator<Item = (TaskId, &'a ChangeSet)>,
    {
        let mut merged: BTreeMap<String, FileChange> = BTreeMap::new();
        let mut owner: BTreeMap<String, TaskId> = BTreeMap::new();
        let mut conflicts = Vec::new();

        for (task_id, fragment) in fragments {
            for (path, change) in fragment.iter() {
                if let Some(previous) = owner.insert(path.to_string(), task_id) {
                    if previous != task_id {
                        conflicts.push(PathConflict {
                            path: path.to_string(),
                            overridden: previous,
                            winner: task_id,
                        });
                    }
                }
                merged.insert(path.to_string(), change.clone());
            }
        }

        (ChangeSet(merged), conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_is_ordered_and_reports_conflicts() {
        let (a, b) = (TaskId::new(), TaskId::new());
        let first = ChangeSet::new()
            .with("server/routers/upload.py", FileChange::full("v1"))
            .with("server/main.py", FileChange::full("app"));
        let second = ChangeSet::new().with("server/main.py", FileChange::full("app + router"));

        let (merged, conflicts) = ChangeSet::aggregate([(a, &first), (b, &second)]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("server/main.py").unwrap().content, "app + router");
        assert_eq!(
            conflicts,
            vec![PathConflict {
                path: "server/main.py".to_string(),
                overridden: a,
                winner: b,
            }]
        );
        // inputs untouched
        assert_eq!(first.get("server/main.py").unwrap().content, "app");
    }

    #[test]
    fn test_serializes_as_path_map() {
        let cs = ChangeSet::new()
            .with("a.txt", FileChange::full("hi"))
            .with("old.txt", FileChange::delete());
        let json = serde_json::to_value(&cs).unwrap();
        assert_eq!(json["a.txt"]["mode"], "full");
        assert_eq!(json["old.txt"]["mode"], "delete");
        assert!(json["old.txt"].get("content").is_none());
    }
}
