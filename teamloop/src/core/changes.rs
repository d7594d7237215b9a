//! Change sets between two sandbox fingerprint snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Size and content hash of one file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    pub size_bytes: u64,
    pub content_hash: String,
}

/// Relative path (forward slashes) -> fingerprint.
pub type FingerprintMap = BTreeMap<String, FileFingerprint>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Compare two snapshots. All three lists come out sorted by path.
pub fn diff_fingerprints(prev: &FingerprintMap, cur: &FingerprintMap) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, now) in cur {
        match prev.get(path) {
            None => changes.added.push(path.clone()),
            Some(before)
                if before.size_bytes != now.size_bytes
                    || before.content_hash != now.content_hash =>
            {
                changes.modified.push(path.clone());
            }
            Some(_) => {}
        }
    }
    changes.removed = prev
        .keys()
        .filter(|path| !cur.contains_key(*path))
        .cloned()
        .collect();
    changes
}
