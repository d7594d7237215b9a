//! Content fingerprints of a sandbox tree.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::changes::{FileFingerprint, FingerprintMap};

/// Files above this size are sampled instead of hashed in full.
pub const FULL_HASH_THRESHOLD: u64 = 8_000_000;

/// Build-cache and VCS directories that never hold generated sources.
const SKIP_DIRS: &[&str] = &["__pycache__", ".pytest_cache", "node_modules", "target", ".git"];

const READ_CHUNK: usize = 256 * 1024;

/// Fingerprint every regular file under `root`.
///
/// A missing root yields an empty map. Unreadable entries are skipped.
pub fn fingerprint_tree(root: &Path) -> FingerprintMap {
    fingerprint_tree_with(root, FULL_HASH_THRESHOLD)
}

pub fn fingerprint_tree_with(root: &Path, threshold: u64) -> FingerprintMap {
    let mut out = FingerprintMap::new();
    if !root.is_dir() {
        return out;
    }
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        match hash_file(entry.path(), threshold) {
            Ok((size_bytes, content_hash)) => {
                out.insert(
                    rel.clone(),
                    FileFingerprint {
                        path: rel,
                        size_bytes,
                        content_hash,
                    },
                );
            }
            Err(err) => warn!(path = %rel, err = %err, "skipping file during fingerprint"),
        }
    }
    out
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

/// Return `(size, sha256 hex)` for one file.
///
/// At or below `threshold` the whole stream is hashed. Above it, only the first and
/// last `threshold / 2` bytes plus the decimal size are hashed, so an edit confined to
/// the middle of a very large file goes unnoticed.
pub fn hash_file(path: &Path, threshold: u64) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = Sha256::new();
    if size <= threshold {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    } else {
        let half = threshold / 2;
        hash_window(&mut file, half, &mut hasher)?;
        file.seek(SeekFrom::Start(size.saturating_sub(half)))?;
        hash_window(&mut file, half, &mut hasher)?;
        hasher.update(size.to_string().as_bytes());
    }
    Ok((size, hex::encode(hasher.finalize())))
}

fn hash_window(file: &mut File, len: u64, hasher: &mut Sha256) -> io::Result<()> {
    let mut window = file.take(len);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = window.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::changes::diff_fingerprints;
    use std::fs;

    #[test]
    fn fingerprints_nested_files_with_forward_slashes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("pkg")).expect("mkdir");
        fs::write(temp.path().join("pkg").join("a.py"), "abc").expect("write");
        let map = fingerprint_tree(temp.path());
        let fp = map.get("pkg/a.py").expect("fingerprint");
        assert_eq!(fp.size_bytes, 3);
        assert_eq!(
            fp.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn skips_cache_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("__pycache__")).expect("mkdir");
        fs::write(temp.path().join("__pycache__").join("main.pyc"), "x").expect("write");
        fs::create_dir_all(temp.path().join(".git")).expect("mkdir");
        fs::write(temp.path().join(".git").join("HEAD"), "x").expect("write");
        fs::write(temp.path().join("main.py"), "x").expect("write");
        let keys: Vec<String> = fingerprint_tree(temp.path()).into_keys().collect();
        assert_eq!(keys, ["main.py"]);
    }

    #[test]
    fn missing_root_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(fingerprint_tree(&temp.path().join("nope")).is_empty());
    }

    #[test]
    fn snapshots_diff_into_added_modified_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("b.txt"), "bbbb").expect("write");
        fs::write(root.join("c.txt"), "cccc").expect("write");
        let first = fingerprint_tree(root);

        fs::write(root.join("a.txt"), "new").expect("write");
        let second = fingerprint_tree(root);
        let changes = diff_fingerprints(&first, &second);
        assert_eq!(changes.added, ["a.txt"]);
        assert!(changes.modified.is_empty() && changes.removed.is_empty());

        fs::write(root.join("b.txt"), "bbbc").expect("write");
        let third = fingerprint_tree(root);
        let changes = diff_fingerprints(&second, &third);
        assert_eq!(changes.modified, ["b.txt"]);
        assert!(changes.added.is_empty() && changes.removed.is_empty());

        fs::remove_file(root.join("c.txt")).expect("remove");
        let fourth = fingerprint_tree(root);
        let changes = diff_fingerprints(&third, &fourth);
        assert_eq!(changes.removed, ["c.txt"]);
        assert!(changes.added.is_empty() && changes.modified.is_empty());
    }

    /// Large files are sampled: edits at the edges change the hash, edits in the
    /// middle do not.
    #[test]
    fn large_files_hash_head_and_tail_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("big.bin");
        let mut data = vec![b'a'; 100];
        fs::write(&path, &data).expect("write");
        let (size, base) = hash_file(&path, 10).expect("hash");
        assert_eq!(size, 100);

        data[50] = b'b';
        fs::write(&path, &data).expect("write");
        assert_eq!(hash_file(&path, 10).expect("hash").1, base);

        data[98] = b'b';
        fs::write(&path, &data).expect("write");
        assert_ne!(hash_file(&path, 10).expect("hash").1, base);
    }

    #[test]
    fn sampled_hash_includes_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let short = temp.path().join("short.bin");
        let long = temp.path().join("long.bin");
        fs::write(&short, vec![b'a'; 100]).expect("write");
        fs::write(&long, vec![b'a'; 101]).expect("write");
        assert_ne!(
            hash_file(&short, 10).expect("hash").1,
            hash_file(&long, 10).expect("hash").1
        );
    }
}
