//! Append-only JSONL run log, one record per pipeline snapshot.
//!
//! Writing is best-effort: a failure to create, fingerprint or append is logged with
//! `warn!` and the run carries on. Records never contain generated file contents.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::changes::{ChangeSet, FingerprintMap, diff_fingerprints};
use crate::core::state::{PipelineState, StateSnapshot};
use crate::core::types::{Stage, TraceEntry, utc_timestamp};
use crate::io::fingerprint::fingerprint_tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEvent {
    Start,
    Step,
    Exception,
    Final,
}

#[derive(Debug, Serialize)]
struct RunLogRecord<'a> {
    ts: String,
    run_id: &'a str,
    event: LogEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir: Option<String>,
    state: StateSnapshot<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir_fingerprints: Option<&'a FingerprintMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir_changes: Option<ChangeSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_trace: Option<&'a TraceEntry>,
}

/// Run identifier derived from the UTC start time, e.g. `20250101T120000Z`.
pub fn make_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Sink for one run's records.
#[derive(Debug)]
pub struct RunLog {
    run_id: String,
    path: PathBuf,
    workdir: PathBuf,
    fingerprints: bool,
    prev_fingerprints: Option<FingerprintMap>,
}

impl RunLog {
    /// Create `run_<run_id>.jsonl` under `log_dir`.
    ///
    /// If that file already exists (two runs started in the same second), a numeric
    /// suffix is added to the run id so records of different runs never interleave.
    pub fn create(log_dir: &Path, run_id: &str, workdir: &Path, fingerprints: bool) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("create log dir {}", log_dir.display()))?;
        let mut candidate = run_id.to_string();
        let mut suffix = 1u32;
        loop {
            let path = log_dir.join(format!("run_{candidate}.jsonl"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "created run log");
                    return Ok(Self {
                        run_id: candidate,
                        path,
                        workdir: workdir.to_path_buf(),
                        fingerprints,
                        prev_fingerprints: None,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    candidate = format!("{run_id}-{suffix}");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create run log {}", path.display()));
                }
            }
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Failures are logged and swallowed.
    pub fn append(
        &mut self,
        event: LogEvent,
        state: &PipelineState,
        stage: Option<Stage>,
        detail: Option<&str>,
    ) {
        if let Err(err) = self.try_append(event, state, stage, detail) {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "run log append failed");
        }
    }

    fn try_append(
        &mut self,
        event: LogEvent,
        state: &PipelineState,
        stage: Option<Stage>,
        detail: Option<&str>,
    ) -> Result<()> {
        let current = self.fingerprints.then(|| fingerprint_tree(&self.workdir));
        let changes = match (&self.prev_fingerprints, &current) {
            (Some(prev), Some(cur)) => Some(diff_fingerprints(prev, cur)),
            _ => None,
        };
        let workdir = (event == LogEvent::Start).then(|| {
            std::path::absolute(&self.workdir)
                .unwrap_or_else(|_| self.workdir.clone())
                .display()
                .to_string()
        });

        let record = RunLogRecord {
            ts: utc_timestamp(),
            run_id: &self.run_id,
            event,
            stage,
            detail,
            workdir,
            state: state.snapshot(),
            workdir_fingerprints: current.as_ref(),
            workdir_changes: changes,
            last_trace: state.last_trace(),
        };
        let mut line = serde_json::to_string(&record).context("serialize run log record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open run log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append run log {}", self.path.display()))?;

        if current.is_some() {
            self.prev_fingerprints = current;
        }
        Ok(())
    }
}
