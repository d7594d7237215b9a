//! Sandbox-confined, per-file atomic writes of generated files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, instrument, warn};

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("path {path:?} resolves outside the sandbox root")]
    SandboxEscape { path: String },
    /// The target is an existing directory, or one of its parents is an existing file.
    #[error("path {path:?} conflicts with an existing {existing} in the sandbox")]
    PathConflict {
        path: String,
        existing: &'static str,
    },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes files under one sandbox root.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    /// Create the root if needed and resolve it to its canonical form.
    pub fn open(root: &Path) -> Result<Self, WriteError> {
        fs::create_dir_all(root).map_err(io_err(root))?;
        let root = fs::canonicalize(root).map_err(io_err(root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `rel` under the root without touching the filesystem.
    ///
    /// The containment check compares path components, so `/sandbox-other` is not
    /// accepted as being inside `/sandbox`.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, WriteError> {
        let escape = || WriteError::SandboxEscape {
            path: rel.to_string(),
        };
        let mut resolved = self.root.clone();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if resolved == self.root || !resolved.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(escape());
        }
        Ok(resolved)
    }

    /// Check that the deepest existing ancestor of `target` still lies inside the root
    /// once symlinks are followed.
    fn check_existing_ancestor(&self, rel: &str, target: &Path) -> Result<(), WriteError> {
        let mut probe = target.parent();
        while let Some(dir) = probe {
            if dir.exists() {
                let canonical = fs::canonicalize(dir).map_err(io_err(dir))?;
                if !canonical.starts_with(&self.root) {
                    return Err(WriteError::SandboxEscape {
                        path: rel.to_string(),
                    });
                }
                return Ok(());
            }
            probe = dir.parent();
        }
        Ok(())
    }

    /// Reject a target that is already a directory, or whose parent chain runs through
    /// an existing file.
    fn check_path_conflict(&self, rel: &str, target: &Path) -> Result<(), WriteError> {
        let conflict = |existing| WriteError::PathConflict {
            path: rel.to_string(),
            existing,
        };
        if target.is_dir() {
            return Err(conflict("directory"));
        }
        let mut probe = target.parent();
        while let Some(dir) = probe
            && dir.starts_with(&self.root)
            && dir != self.root
        {
            if dir.exists() && !dir.is_dir() {
                return Err(conflict("file"));
            }
            probe = dir.parent();
        }
        Ok(())
    }

    /// Write every file, in case-insensitive path order.
    ///
    /// All paths are resolved and checked before the first write, so an escaping or
    /// conflicting path leaves the sandbox untouched. Each file is replaced atomically; the set as a
    /// whole is not.
    #[instrument(skip_all, fields(root = %self.root.display(), files = files.len()))]
    pub fn write_all(&self, files: &BTreeMap<String, String>) -> Result<Vec<String>, WriteError> {
        let mut ordered: Vec<&String> = files.keys().collect();
        ordered.sort_by(|a, b| {
            a.to_lowercase()
                .cmp(&b.to_lowercase())
                .then_with(|| a.cmp(b))
        });

        let mut planned = Vec::with_capacity(ordered.len());
        for rel in ordered {
            let target = self.resolve(rel)?;
            self.check_existing_ancestor(rel, &target)?;
            self.check_path_conflict(rel, &target)?;
            planned.push((rel, target));
        }

        let mut written = Vec::with_capacity(planned.len());
        for (rel, target) in planned {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
                let canonical = fs::canonicalize(parent).map_err(io_err(parent))?;
                if !canonical.starts_with(&self.root) {
                    warn!(path = %rel, "parent directory resolved outside sandbox");
                    return Err(WriteError::SandboxEscape { path: rel.clone() });
                }
            }
            let content = files.get(rel).map(String::as_str).unwrap_or_default();
            StagedFile::stage(&target, content.as_bytes())?.commit()?;
            debug!(path = %rel, bytes = content.len(), "wrote artifact");
            written.push(rel.clone());
        }
        Ok(written)
    }
}

/// Content staged in a sibling temp file, not yet visible at its target path.
///
/// Dropping without [`StagedFile::commit`] removes the temp file and leaves the target
/// as it was.
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn stage(target: &Path, content: &[u8]) -> Result<Self, WriteError> {
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            STAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let staged = Self {
            tmp,
            target: target.to_path_buf(),
            committed: false,
        };
        let mut file = File::create(&staged.tmp).map_err(io_err(&staged.tmp))?;
        file.write_all(content).map_err(io_err(&staged.tmp))?;
        file.sync_all().map_err(io_err(&staged.tmp))?;
        Ok(staged)
    }

    /// Atomically replace the target with the staged content.
    pub fn commit(mut self) -> Result<(), WriteError> {
        fs::rename(&self.tmp, &self.target).map_err(io_err(&self.target))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed
            && let Err(err) = fs::remove_file(&self.tmp)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp.display(), err = %err, "failed to remove staged temp file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_nested_files_and_overwrites() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        let written = writer
            .write_all(&files(&[("pkg/util.py", "x = 1\n"), ("Main.py", "old")]))
            .expect("write");
        assert_eq!(written, ["Main.py", "pkg/util.py"]);

        writer
            .write_all(&files(&[("Main.py", "new")]))
            .expect("overwrite");
        let root = writer.root();
        assert_eq!(fs::read_to_string(root.join("Main.py")).expect("read"), "new");
        assert_eq!(
            fs::read_to_string(root.join("pkg").join("util.py")).expect("read"),
            "x = 1\n"
        );
        assert_eq!(dir_entries(root), ["Main.py", "pkg"]);
    }

    #[test]
    fn escape_aborts_before_any_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        let err = writer
            .write_all(&files(&[("a.txt", "fine"), ("z/../../evil.txt", "bad")]))
            .expect_err("escape");
        assert!(matches!(err, WriteError::SandboxEscape { .. }));
        assert!(dir_entries(writer.root()).is_empty());
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn existing_directory_at_target_is_a_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        fs::create_dir_all(writer.root().join("pkg")).expect("mkdir");

        let err = writer
            .write_all(&files(&[("main.py", "x"), ("pkg", "file")]))
            .expect_err("conflict");
        assert!(matches!(
            err,
            WriteError::PathConflict {
                existing: "directory",
                ..
            }
        ));
        assert_eq!(dir_entries(writer.root()), ["pkg"]);
    }

    #[test]
    fn existing_file_in_parent_chain_is_a_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        fs::write(writer.root().join("pkg"), "file").expect("seed");

        let err = writer
            .write_all(&files(&[("a.py", "x"), ("pkg/sub/b.py", "y")]))
            .expect_err("conflict");
        assert!(matches!(
            err,
            WriteError::PathConflict { existing: "file", .. }
        ));
        assert_eq!(dir_entries(writer.root()), ["pkg"]);
    }

    #[test]
    fn resolve_rejects_absolute_and_root_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(temp.path()).expect("open");
        assert!(writer.resolve("/etc/passwd").is_err());
        assert!(writer.resolve("..").is_err());
        assert!(writer.resolve(".").is_err());
        assert!(writer.resolve("a/../b.txt").is_ok());
    }

    /// A sibling directory sharing the root's name as a prefix is still outside.
    #[test]
    fn sibling_with_common_prefix_is_outside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        let err = writer.resolve("../game-other/x.txt").expect_err("escape");
        assert!(matches!(err, WriteError::SandboxEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_pointing_outside_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).expect("mkdir");
        let writer = ArtifactWriter::open(&temp.path().join("game")).expect("open");
        std::os::unix::fs::symlink(&outside, writer.root().join("link")).expect("symlink");

        let err = writer
            .write_all(&files(&[("link/x.txt", "bad")]))
            .expect_err("escape");
        assert!(matches!(err, WriteError::SandboxEscape { .. }));
        assert!(dir_entries(&outside).is_empty());
    }

    #[test]
    fn interrupted_write_leaves_previous_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("main.py");
        fs::write(&target, "previous").expect("seed");

        let staged = StagedFile::stage(&target, b"replacement").expect("stage");
        assert_eq!(fs::read_to_string(&target).expect("read"), "previous");
        drop(staged);

        assert_eq!(fs::read_to_string(&target).expect("read"), "previous");
        assert_eq!(dir_entries(temp.path()), ["main.py"]);
    }

    #[test]
    fn interrupted_write_leaves_new_target_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("fresh.py");
        let staged = StagedFile::stage(&target, b"content").expect("stage");
        drop(staged);
        assert!(!target.exists());
        assert!(dir_entries(temp.path()).is_empty());
    }

    #[test]
    fn commit_replaces_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("main.py");
        fs::write(&target, "previous").expect("seed");
        StagedFile::stage(&target, b"replacement")
            .expect("stage")
            .commit()
            .expect("commit");
        assert_eq!(fs::read_to_string(&target).expect("read"), "replacement");
        assert_eq!(dir_entries(temp.path()), ["main.py"]);
    }
}
