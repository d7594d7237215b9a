//! Contract for generated file sets.
//!
//! Model output is untrusted. Before anything touches the sandbox, the payload must
//! match the file-set schema and every path must be a plain relative path that cannot
//! address anything outside the sandbox root. Checks run in a fixed order and stop at
//! the first violation, which is reported with the rule and offending path.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const FILE_SET_SCHEMA: &str = include_str!("../../schemas/generated_file_set.schema.json");

/// Upper bound on files in one generation.
pub const MAX_FILES: usize = 50;
/// Upper bound on one file's content, in characters.
pub const MAX_CONTENT_CHARS: usize = 300_000;

static FILE_SET_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(FILE_SET_SCHEMA).expect("file set schema should be valid json");
    validator_for(&schema).expect("file set schema should compile")
});

/// One generated file as emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// The generation payload: `{"files": [{"path", "content"}...], "notes": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFileSet {
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub notes: String,
}

/// A specific contract rule that a file set broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("output does not match the file set schema: {0}")]
    Schema(String),
    #[error("files must be non-empty")]
    EmptyFileSet,
    #[error("too many files: {count} > {max}", max = MAX_FILES)]
    TooManyFiles { count: usize },
    #[error("files[{index}].path must be non-empty")]
    EmptyPath { index: usize },
    #[error("path {path:?} must be relative and must not start with '/', './' or '../'")]
    NotRelative { path: String },
    #[error("path {path:?} must not carry a drive or scheme prefix")]
    VolumePrefix { path: String },
    #[error("path {path:?} contains a null byte")]
    NullByte { path: String },
    #[error("path {path:?} must not contain '..' segments")]
    ParentSegment { path: String },
    #[error("path {path:?} must name a file, not a directory")]
    NotAFile { path: String },
    #[error("duplicate path (case-insensitive): {path:?}")]
    DuplicatePath { path: String },
    #[error("path {path:?} is used both as a file and as a directory")]
    FileDirConflict { path: String },
    #[error("file {path:?} too large: {chars} > {max} characters", max = MAX_CONTENT_CHARS)]
    ContentTooLarge { path: String, chars: usize },
}

/// The designated entry point was absent from an otherwise valid file set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "missing required file {required:?} (paths must be relative to the sandbox root, \
     e.g. {required:?} rather than \"<dir>/{required}\")"
)]
pub struct MissingRequiredFile {
    pub required: String,
}

/// A file set that passed every contract rule, with normalized paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFileSet {
    files: Vec<GeneratedFile>,
    notes: String,
}

impl GeneratedFileSet {
    /// Check `value` against the schema and deserialize it.
    pub fn from_value(value: &Value) -> Result<Self, ContractViolation> {
        let messages: Vec<String> = FILE_SET_VALIDATOR
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(ContractViolation::Schema(messages.join("; ")));
        }
        serde_json::from_value(value.clone()).map_err(|err| ContractViolation::Schema(err.to_string()))
    }

    /// Apply every contract rule in order, returning the normalized set.
    pub fn validate(self) -> Result<ValidatedFileSet, ContractViolation> {
        if self.files.is_empty() {
            return Err(ContractViolation::EmptyFileSet);
        }
        if self.files.len() > MAX_FILES {
            return Err(ContractViolation::TooManyFiles {
                count: self.files.len(),
            });
        }

        let mut files = Vec::with_capacity(self.files.len());
        for (index, file) in self.files.into_iter().enumerate() {
            let path = validate_path(index, &file.path)?;
            files.push(GeneratedFile {
                path,
                content: file.content,
            });
        }

        let mut seen = HashSet::new();
        for file in &files {
            if !seen.insert(file.path.to_lowercase()) {
                return Err(ContractViolation::DuplicatePath {
                    path: file.path.clone(),
                });
            }
        }

        let dirs: HashSet<String> = seen
            .iter()
            .flat_map(|path| {
                path.match_indices('/')
                    .map(|(at, _)| path[..at].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        if let Some(file) = files
            .iter()
            .find(|file| dirs.contains(&file.path.to_lowercase()))
        {
            return Err(ContractViolation::FileDirConflict {
                path: file.path.clone(),
            });
        }

        for file in &files {
            let chars = file.content.chars().count();
            if chars > MAX_CONTENT_CHARS {
                return Err(ContractViolation::ContentTooLarge {
                    path: file.path.clone(),
                    chars,
                });
            }
        }

        Ok(ValidatedFileSet {
            files,
            notes: self.notes,
        })
    }
}

impl ValidatedFileSet {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|file| file.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Caller-level check that `required` is among the validated paths.
    pub fn require(&self, required: &str) -> Result<(), MissingRequiredFile> {
        if self.paths().any(|path| path == required) {
            return Ok(());
        }
        Err(MissingRequiredFile {
            required: required.to_string(),
        })
    }

    pub fn into_file_map(self) -> BTreeMap<String, String> {
        self.files
            .into_iter()
            .map(|file| (file.path, file.content))
            .collect()
    }
}

/// Trim and normalize separators (`\` becomes `/`).
pub fn normalize_path(raw: &str) -> String {
    raw.trim().replace('\\', "/")
}

fn validate_path(index: usize, raw: &str) -> Result<String, ContractViolation> {
    let path = normalize_path(raw);
    if path.is_empty() {
        return Err(ContractViolation::EmptyPath { index });
    }
    if path.starts_with('/') || path.starts_with("./") || path.starts_with("../") {
        return Err(ContractViolation::NotRelative { path });
    }
    let first = path.split('/').next().unwrap_or_default();
    if first.contains(':') {
        return Err(ContractViolation::VolumePrefix { path });
    }
    if path.contains('\0') {
        return Err(ContractViolation::NullByte { path });
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(ContractViolation::ParentSegment { path });
    }
    if path.ends_with('/') || path.rsplit('/').next() == Some(".") {
        return Err(ContractViolation::NotAFile { path });
    }
    Ok(path)
}
