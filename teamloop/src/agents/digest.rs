//! Bounded digest of generated files, read back from the sandbox for review.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::debug;

const HEAD_LINES: usize = 120;
const TAIL_LINES: usize = 80;
const MAX_PART_CHARS: usize = 18_000;
const PART_TRUNCATED: &str = "\n...<truncated>...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub path: String,
    pub size_bytes: u64,
    pub head: String,
    /// Empty unless the file has more than `HEAD_LINES` lines.
    pub tail: String,
}

/// Digest `paths` under `root` in case-insensitive order.
///
/// Paths that resolve outside `root` and files that cannot be read are skipped.
pub fn build_digest<'a>(root: &Path, paths: impl IntoIterator<Item = &'a str>) -> Vec<FileDigest> {
    let Ok(root) = fs::canonicalize(root) else {
        return Vec::new();
    };
    let mut paths: Vec<&str> = paths.into_iter().collect();
    paths.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    paths.dedup();

    let mut out = Vec::with_capacity(paths.len());
    for rel in paths {
        let Ok(resolved) = fs::canonicalize(root.join(rel)) else {
            debug!(path = rel, "digest skipped missing file");
            continue;
        };
        if !resolved.starts_with(&root) || !resolved.is_file() {
            debug!(path = rel, "digest skipped path outside sandbox or not a file");
            continue;
        }
        let Ok(raw) = fs::read(&resolved) else {
            continue;
        };
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = text.lines().collect();
        let head = lines[..lines.len().min(HEAD_LINES)].join("\n");
        let tail = if lines.len() > HEAD_LINES {
            lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
        } else {
            String::new()
        };
        out.push(FileDigest {
            path: rel.to_string(),
            size_bytes: raw.len() as u64,
            head: cap_part(head),
            tail: cap_part(tail),
        });
    }
    out
}

fn cap_part(text: String) -> String {
    match text.char_indices().nth(MAX_PART_CHARS) {
        Some((idx, _)) => format!("{}{PART_TRUNCATED}", &text[..idx]),
        None => text,
    }
}

pub fn format_digest(digests: &[FileDigest]) -> String {
    let mut out = String::new();
    for digest in digests {
        let _ = writeln!(out, "== File: {} ({} bytes) ==", digest.path, digest.size_bytes);
        if !digest.head.trim().is_empty() {
            out.push_str("[HEAD]\n");
            out.push_str(&digest.head);
            out.push('\n');
        }
        if !digest.tail.trim().is_empty() {
            out.push_str("[TAIL]\n");
            out.push_str(&digest.tail);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_files_have_head_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.py"), "a\nb\n").expect("write");
        let digests = build_digest(temp.path(), ["main.py"]);
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].head, "a\nb");
        assert!(digests[0].tail.is_empty());
        assert_eq!(digests[0].size_bytes, 4);
    }

    #[test]
    fn long_files_get_head_and_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body: String = (0..300).map(|i| format!("line {i}\n")).collect();
        fs::write(temp.path().join("big.py"), body).expect("write");
        let digest = &build_digest(temp.path(), ["big.py"])[0];
        assert!(digest.head.starts_with("line 0\n"));
        assert!(digest.head.ends_with("line 119"));
        assert!(digest.tail.starts_with("line 220\n"));
        assert!(digest.tail.ends_with("line 299"));
    }

    #[test]
    fn parts_are_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("wide.py"), "x".repeat(MAX_PART_CHARS + 10)).expect("write");
        let digest = &build_digest(temp.path(), ["wide.py"])[0];
        assert!(digest.head.ends_with("...<truncated>..."));
        assert_eq!(digest.head.chars().count(), MAX_PART_CHARS + PART_TRUNCATED.len());
    }

    #[test]
    fn skips_missing_and_escaping_paths_and_orders_case_insensitively() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("game");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(temp.path().join("secret.txt"), "s").expect("write");
        fs::write(root.join("b.py"), "b").expect("write");
        fs::write(root.join("A.py"), "a").expect("write");
        let digests = build_digest(&root, ["b.py", "../secret.txt", "missing.py", "A.py"]);
        let paths: Vec<&str> = digests.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["A.py", "b.py"]);
    }

    #[test]
    fn format_labels_files_and_parts() {
        let text = format_digest(&[FileDigest {
            path: "main.py".to_string(),
            size_bytes: 3,
            head: "abc".to_string(),
            tail: String::new(),
        }]);
        assert_eq!(text, "== File: main.py (3 bytes) ==\n[HEAD]\nabc");
    }
}
