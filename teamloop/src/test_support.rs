//! Scripted collaborators and fixtures for pipeline tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::contract::{GeneratedFile, GeneratedFileSet};
use crate::core::retry::RetryPolicy;
use crate::core::types::VerificationReport;
use crate::io::chat::{ChatClient, ChatError, ChatMessage};
use crate::io::verifier::Verifier;

/// Chat client that replays queued replies and records every request.
///
/// When the queue is empty it answers with the fallback reply if one was set,
/// otherwise with a non-transient error.
#[derive(Debug, Default)]
pub struct ScriptedChat {
    replies: RefCell<VecDeque<Result<String, ChatError>>>,
    fallback: Option<String>,
    calls: RefCell<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<Result<String, ChatError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answer every call with `reply`.
    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ChatClient for ScriptedChat {
    fn chat(&self, messages: &[ChatMessage], _temperature: f64) -> Result<String, ChatError> {
        self.calls.borrow_mut().push(messages.to_vec());
        if let Some(reply) = self.replies.borrow_mut().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(ChatError::Config("scripted chat has no reply left".to_string())),
        }
    }
}

/// Verifier that replays queued reports and counts invocations.
///
/// The last report repeats once the queue is down to one entry.
#[derive(Debug)]
pub struct ScriptedVerifier {
    reports: RefCell<VecDeque<VerificationReport>>,
    calls: Cell<u32>,
}

impl ScriptedVerifier {
    pub fn new(reports: Vec<VerificationReport>) -> Self {
        Self {
            reports: RefCell::new(reports.into()),
            calls: Cell::new(0),
        }
    }

    pub fn always(report: VerificationReport) -> Self {
        Self::new(vec![report])
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _root: &Path) -> Result<VerificationReport> {
        self.calls.set(self.calls.get() + 1);
        let mut reports = self.reports.borrow_mut();
        if reports.len() > 1 {
            return reports
                .pop_front()
                .ok_or_else(|| anyhow!("scripted verifier has no report left"));
        }
        reports
            .front()
            .cloned()
            .ok_or_else(|| anyhow!("scripted verifier has no report left"))
    }
}

pub fn passing_report() -> VerificationReport {
    VerificationReport {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

pub fn failing_report(stderr: &str) -> VerificationReport {
    VerificationReport {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// A fenced ```json generation reply containing `files`.
pub fn file_set_reply(files: &[(&str, &str)]) -> String {
    let set = GeneratedFileSet {
        files: files
            .iter()
            .map(|(path, content)| GeneratedFile {
                path: (*path).to_string(),
                content: (*content).to_string(),
            })
            .collect(),
        notes: String::new(),
    };
    let body = serde_json::to_string_pretty(&set).expect("file set should serialize");
    format!("```json\n{body}\n```")
}

/// Retry policy with millisecond backoff so exhaustion tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

/// Temporary directory holding a `game` sandbox and a `logs` directory.
pub struct TestSandbox {
    temp: TempDir,
}

impl TestSandbox {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        std::fs::create_dir_all(temp.path().join("game"))?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn workdir(&self) -> PathBuf {
        self.temp.path().join("game")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.temp.path().join("logs")
    }

    /// Relative paths of every file under the sandbox, sorted.
    pub fn sandbox_files(&self) -> Vec<String> {
        let root = self.workdir();
        let mut files: Vec<String> = walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&root)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        files
    }
}
