//! The workflow engine: drives one run from goal to a terminal state.
//!
//! Stages execute strictly one after another on a single [`PipelineState`]. After
//! each stage the engine appends one trace entry, writes one run log record and asks
//! [`next_transition`] where to go. Generation and verification failures stay inside
//! the retry loop; only [`PipelineAbort`] ends a run early.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agents::coder::{GenerationError, parse_files, request_files};
use crate::agents::prompt::{CoderPromptInputs, PromptBuilder};
use crate::agents::{CallError, CallSettings, architect, pm, reviewer};
use crate::core::contract::ContractViolation;
use crate::core::retry::{RetryPolicy, Transient};
use crate::core::routing::{INITIAL_STAGE, next_transition};
use crate::core::state::PipelineState;
use crate::core::types::{FailureKind, Stage, Terminal, Transition};
use crate::io::artifacts::{ArtifactWriter, WriteError};
use crate::io::chat::{ChatClient, ChatError};
use crate::io::config::TeamConfig;
use crate::io::run_log::{LogEvent, RunLog, make_run_id};
use crate::io::verifier::Verifier;

const FAULT_MARKER: &str = "[fault injected]";

/// Failures that end a run immediately, outside the generation retry budget.
#[derive(Debug, Error)]
pub enum PipelineAbort {
    #[error("TransportError: chat call failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: ChatError,
    },
    #[error("BackendError: {0}")]
    Backend(#[source] ChatError),
    #[error("SandboxEscape: {path:?} resolves outside the sandbox root")]
    SandboxEscape { path: String },
    #[error("ArtifactError: {0}")]
    Artifact(#[source] WriteError),
    #[error("VerifierError: {0:#}")]
    Verifier(anyhow::Error),
}

impl From<CallError> for PipelineAbort {
    fn from(err: CallError) -> Self {
        if err.error.is_transient() {
            PipelineAbort::Transport {
                attempts: err.attempts,
                source: err.error,
            }
        } else {
            PipelineAbort::Backend(err.error)
        }
    }
}

impl From<WriteError> for PipelineAbort {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::SandboxEscape { path } => PipelineAbort::SandboxEscape { path },
            other => PipelineAbort::Artifact(other),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStop {
    /// Verification passed and the reviewer ran.
    Succeeded,
    /// Verification still failed when the iteration budget ran out.
    BudgetExhausted { iterations: u32, max_iterations: u32 },
    /// A run-fatal failure; `reason` is the surfaced error text.
    Aborted { reason: String },
}

impl PipelineStop {
    pub fn terminal(&self) -> Terminal {
        match self {
            PipelineStop::Succeeded => Terminal::DoneOk,
            _ => Terminal::DoneFailed,
        }
    }
}

/// Summary of a run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub stop: PipelineStop,
    pub state: PipelineState,
    pub log_path: Option<PathBuf>,
}

/// Run-wide knobs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_iterations: u32,
    pub required_file: String,
    /// Force the first verification pass that reaches the oracle to fail.
    pub fault_inject: bool,
    pub temperature: f64,
    pub retry: RetryPolicy,
    pub prompt_budget_bytes: usize,
}

impl PipelineSettings {
    pub fn from_config(cfg: &TeamConfig, fault_inject: bool) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            required_file: cfg.required_file.clone(),
            fault_inject,
            temperature: cfg.chat.temperature,
            retry: cfg.retry,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
        }
    }
}

/// One configured pipeline. `general` plans, designs and reviews; `coder` generates.
pub struct Pipeline<'a, C: ChatClient, V: Verifier> {
    general: &'a C,
    coder: &'a C,
    verifier: &'a V,
    writer: ArtifactWriter,
    sandbox_name: String,
    prompts: PromptBuilder,
    calls: CallSettings,
    settings: PipelineSettings,
    run_log: Option<RunLog>,
}

impl<'a, C: ChatClient, V: Verifier> Pipeline<'a, C, V> {
    /// Open (and create if needed) the sandbox at `workdir`.
    pub fn new(
        general: &'a C,
        coder: &'a C,
        verifier: &'a V,
        workdir: &Path,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let writer = ArtifactWriter::open(workdir)
            .with_context(|| format!("open sandbox {}", workdir.display()))?;
        let sandbox_name = writer
            .root()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            general,
            coder,
            verifier,
            writer,
            sandbox_name,
            prompts: PromptBuilder::new(settings.prompt_budget_bytes),
            calls: CallSettings {
                temperature: settings.temperature,
                retry: settings.retry,
            },
            settings,
            run_log: None,
        })
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn sandbox_root(&self) -> &Path {
        self.writer.root()
    }

    pub fn run(self, goal: &str) -> PipelineOutcome {
        self.run_from(PipelineState::new(goal))
    }

    /// Drive `state` from the initial stage to a terminal state.
    ///
    /// Stages whose output is already present in `state` are not re-run.
    #[instrument(skip_all, fields(max_iterations = self.settings.max_iterations))]
    pub fn run_from(mut self, mut state: PipelineState) -> PipelineOutcome {
        let run_id = self
            .run_log
            .as_ref()
            .map_or_else(make_run_id, |log| log.run_id().to_string());
        self.append_log(LogEvent::Start, &state, None, None);

        let mut stage = INITIAL_STAGE;
        let terminal = loop {
            match self.execute(stage, &mut state) {
                Ok(message) => state.record(stage, message),
                Err(abort) => {
                    let reason = abort.to_string();
                    warn!(%stage, reason = %reason, "run aborted");
                    state.record(stage, format!("aborted: {reason}"));
                    state.error.clone_from(&reason);
                    state.error_kind = None;
                    self.append_log(LogEvent::Exception, &state, Some(stage), Some(&reason));
                    self.append_log(LogEvent::Final, &state, None, Some("aborted"));
                    return self.finish(run_id, PipelineStop::Aborted { reason }, state);
                }
            }
            self.append_log(LogEvent::Step, &state, Some(stage), None);
            match next_transition(stage, &state, self.settings.max_iterations) {
                Transition::Next(next) => stage = next,
                Transition::Finish(terminal) => break terminal,
            }
        };

        let stop = match terminal {
            Terminal::DoneOk => PipelineStop::Succeeded,
            Terminal::DoneFailed => {
                state.error = format!(
                    "RetryBudgetExhausted after {} iterations: {}",
                    state.iteration, state.error
                );
                PipelineStop::BudgetExhausted {
                    iterations: state.iteration,
                    max_iterations: self.settings.max_iterations,
                }
            }
        };
        info!(?stop, iteration = state.iteration, "run finished");
        let detail = match terminal {
            Terminal::DoneOk => "done_ok",
            Terminal::DoneFailed => "done_failed",
        };
        self.append_log(LogEvent::Final, &state, None, Some(detail));
        self.finish(run_id, stop, state)
    }

    fn finish(self, run_id: String, stop: PipelineStop, state: PipelineState) -> PipelineOutcome {
        PipelineOutcome {
            run_id,
            stop,
            state,
            log_path: self.run_log.map(|log| log.path().to_path_buf()),
        }
    }

    fn append_log(
        &mut self,
        event: LogEvent,
        state: &PipelineState,
        stage: Option<Stage>,
        detail: Option<&str>,
    ) {
        if let Some(log) = self.run_log.as_mut() {
            log.append(event, state, stage, detail);
        }
    }

    /// Run one stage and return its trace message.
    fn execute(&self, stage: Stage, state: &mut PipelineState) -> Result<String, PipelineAbort> {
        match stage {
            Stage::Pm => self.plan(state),
            Stage::Architect => self.design(state),
            Stage::Coder => self.generate(state),
            Stage::Qa => self.verify(state),
            Stage::Reviewer => Ok(self.review(state)),
        }
    }

    fn plan(&self, state: &mut PipelineState) -> Result<String, PipelineAbort> {
        if !state.requirements.trim().is_empty() {
            info!("requirements present; planning skipped");
            return Ok("Requirements reused (memoized)".to_string());
        }
        state.requirements =
            pm::write_requirements(self.general, &self.prompts, &self.calls, &state.goal)?;
        Ok(format!(
            "Requirements drafted ({} chars)",
            state.requirements.chars().count()
        ))
    }

    fn design(&self, state: &mut PipelineState) -> Result<String, PipelineAbort> {
        if !state.architecture.trim().is_empty() {
            info!("architecture present; design skipped");
            return Ok("Architecture reused (memoized)".to_string());
        }
        state.architecture = architect::design(
            self.general,
            &self.prompts,
            &self.calls,
            &state.requirements,
            &self.settings.required_file,
        )?;
        Ok(format!(
            "Architecture drafted ({} chars)",
            state.architecture.chars().count()
        ))
    }

    fn generate(&self, state: &mut PipelineState) -> Result<String, PipelineAbort> {
        if state.has_error() {
            state.iteration += 1;
        }
        let raw = request_files(
            self.coder,
            &self.prompts,
            &self.calls,
            &CoderPromptInputs {
                requirements: &state.requirements,
                architecture: &state.architecture,
                previous_error: &state.error,
                required_file: &self.settings.required_file,
                sandbox_name: &self.sandbox_name,
            },
        )?;

        let files = match parse_files(&raw, &self.settings.required_file, &self.sandbox_name) {
            Ok(set) => set.into_file_map(),
            Err(err) => return Ok(reject_generation(state, &err, &raw)),
        };

        let written = match self.writer.write_all(&files) {
            Ok(written) => written,
            Err(WriteError::PathConflict { path, existing }) => {
                warn!(path = %path, existing, "generated path collides with the sandbox");
                let err = GenerationError::from(ContractViolation::FileDirConflict { path });
                return Ok(reject_generation(state, &err, &raw));
            }
            Err(err) => return Err(err.into()),
        };
        state.files = files;
        state.clear_error();
        Ok(format!("Code written: {} files", written.len()))
    }

    fn verify(&self, state: &mut PipelineState) -> Result<String, PipelineAbort> {
        if state.has_generation_failure() {
            return Ok("Verification skipped: generation failed".to_string());
        }
        let mut report = self
            .verifier
            .verify(self.writer.root())
            .map_err(PipelineAbort::Verifier)?;

        let inject = self.settings.fault_inject && !state.fault_injected;
        if inject {
            if report.passed() {
                report.exit_code = Some(1);
            }
            state.fault_injected = true;
            warn!("fault injected into verification");
        }
        let mut text = report.render();
        if inject {
            text.push('\n');
            text.push_str(FAULT_MARKER);
        }
        state.verification_report.clone_from(&text);

        if report.passed() {
            state.clear_error();
            return Ok("Verification passed".to_string());
        }
        state.set_failure(FailureKind::VerificationFailure, text);
        if inject {
            Ok(format!("Verification failed {FAULT_MARKER}"))
        } else {
            Ok(format!("Verification failed ({})", exit_label(report.exit_code)))
        }
    }

    /// Best effort: a failing review leaves the notes empty and the run successful.
    fn review(&self, state: &mut PipelineState) -> String {
        let paths = state.files.keys().map(String::as_str);
        match reviewer::review(self.general, &self.prompts, &self.calls, self.writer.root(), paths) {
            Ok(notes) => {
                state.review_notes = notes;
                "Review complete".to_string()
            }
            Err(err) => {
                warn!(error = %err.error, attempts = err.attempts, "review unavailable");
                state.review_notes.clear();
                format!("Review unavailable: {}", err.error)
            }
        }
    }
}

fn exit_label(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("returncode={code}"),
        None => "returncode=timeout".to_string(),
    }
}

/// Record a rejected generation attempt as a recoverable failure.
fn reject_generation(state: &mut PipelineState, err: &GenerationError, raw: &str) -> String {
    warn!(kind = %err.kind(), error = %err, "generation rejected");
    let text = err.error_text(raw);
    state.verification_report.clone_from(&text);
    state.set_failure(err.kind(), text);
    format!("Generation rejected: {}", err.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedChat, ScriptedVerifier, TestSandbox, failing_report, fast_retry, file_set_reply,
        passing_report,
    };

    fn settings(max_iterations: u32) -> PipelineSettings {
        PipelineSettings {
            max_iterations,
            required_file: "main.py".to_string(),
            fault_inject: false,
            temperature: 0.2,
            retry: fast_retry(),
            prompt_budget_bytes: 60_000,
        }
    }

    fn planning_chat() -> ScriptedChat {
        ScriptedChat::new(vec![
            Ok("reqs".to_string()),
            Ok("arch".to_string()),
            Ok("notes".to_string()),
        ])
    }

    #[test]
    fn happy_path_runs_every_stage_once() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = planning_chat();
        let coder = ScriptedChat::always(file_set_reply(&[("main.py", "print(1)")]));
        let verifier = ScriptedVerifier::always(passing_report());
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert_eq!(outcome.stop, PipelineStop::Succeeded);
        assert_eq!(outcome.state.iteration, 0);
        assert!(outcome.state.error.is_empty());
        assert_eq!(outcome.state.review_notes, "notes");
        let stages: Vec<Stage> = outcome.state.trace.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            [Stage::Pm, Stage::Architect, Stage::Coder, Stage::Qa, Stage::Reviewer]
        );
        assert_eq!(sandbox.sandbox_files(), ["main.py"]);
        assert!(outcome.log_path.is_none());
    }

    #[test]
    fn verification_failure_feeds_back_into_generation() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = planning_chat();
        let coder = ScriptedChat::always(file_set_reply(&[("main.py", "print(1)")]));
        let verifier = ScriptedVerifier::new(vec![failing_report("SyntaxError"), passing_report()]);
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert_eq!(outcome.stop, PipelineStop::Succeeded);
        assert_eq!(outcome.state.iteration, 1);
        assert_eq!(verifier.calls(), 2);
        let retry_prompt = &coder.calls()[1][1].content;
        assert!(retry_prompt.contains("Previous Attempt Failed"));
        assert!(retry_prompt.contains("SyntaxError"));
    }

    #[test]
    fn generation_failure_skips_the_oracle() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = planning_chat();
        let coder = ScriptedChat::new(vec![
            Ok("no json here".to_string()),
            Ok(file_set_reply(&[("main.py", "")])),
        ]);
        let verifier = ScriptedVerifier::always(passing_report());
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert_eq!(outcome.stop, PipelineStop::Succeeded);
        assert_eq!(outcome.state.iteration, 1);
        assert_eq!(verifier.calls(), 1);
        let qa_messages: Vec<&str> = outcome
            .state
            .trace
            .iter()
            .filter(|t| t.stage == Stage::Qa)
            .map(|t| t.message.as_str())
            .collect();
        assert_eq!(
            qa_messages,
            ["Verification skipped: generation failed", "Verification passed"]
        );
    }

    #[test]
    fn echoed_sandbox_prefix_lands_at_root() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = planning_chat();
        let coder = ScriptedChat::always(file_set_reply(&[
            ("game/main.py", "print(1)"),
            ("game/pkg/util.py", ""),
        ]));
        let verifier = ScriptedVerifier::always(passing_report());
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert_eq!(outcome.stop, PipelineStop::Succeeded);
        assert_eq!(sandbox.sandbox_files(), ["main.py", "pkg/util.py"]);
    }

    #[test]
    fn non_transient_backend_error_aborts_without_retry() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = ScriptedChat::new(vec![Err(ChatError::Decode("garbage".to_string()))]);
        let coder = ScriptedChat::default();
        let verifier = ScriptedVerifier::always(passing_report());
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert!(matches!(outcome.stop, PipelineStop::Aborted { .. }));
        assert!(outcome.state.error.starts_with("BackendError: "));
        assert_eq!(general.call_count(), 1);
        assert_eq!(coder.call_count(), 0);
    }

    #[test]
    fn oracle_that_cannot_run_aborts() {
        let sandbox = TestSandbox::new().expect("sandbox");
        let general = planning_chat();
        let coder = ScriptedChat::always(file_set_reply(&[("main.py", "")]));
        let verifier = ScriptedVerifier::new(Vec::new());
        let outcome = Pipeline::new(&general, &coder, &verifier, &sandbox.workdir(), settings(3))
            .expect("pipeline")
            .run("make X");

        assert!(outcome.state.error.starts_with("VerifierError: "));
        assert_eq!(outcome.stop.terminal(), Terminal::DoneFailed);
        let last = outcome.state.last_trace().expect("trace");
        assert_eq!(last.stage, Stage::Qa);
        assert!(last.message.starts_with("aborted: "));
    }

    #[test]
    fn abort_maps_write_errors() {
        let escape = PipelineAbort::from(WriteError::SandboxEscape {
            path: "../x".to_string(),
        });
        assert!(escape.to_string().starts_with("SandboxEscape: "));
        let transport = PipelineAbort::from(CallError {
            attempts: 4,
            error: ChatError::Transport("refused".to_string()),
        });
        assert!(transport.to_string().starts_with("TransportError: "));
    }
}
