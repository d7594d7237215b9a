//! Verification oracle adapter.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, instrument};

use crate::core::types::VerificationReport;
use crate::io::config::VerifyConfig;
use crate::io::process::run_with_timeout;

/// Opaque pass/fail check run against the sandbox. Exit code zero means pass.
///
/// An `Err` means the oracle itself could not run and aborts the pipeline; a failing
/// check is an `Ok` report with a non-zero exit code.
pub trait Verifier {
    fn verify(&self, root: &Path) -> Result<VerificationReport>;
}

/// Runs a configured command inside the sandbox root.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandVerifier {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &VerifyConfig) -> Self {
        Self::new(
            cfg.command.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.output_limit_bytes,
        )
    }
}

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(root = %root.display(), program = ?self.command.first()))]
    fn verify(&self, root: &Path) -> Result<VerificationReport> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("verify command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(root);
        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes)?;
        let report = VerificationReport {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        };
        info!(exit_code = ?report.exit_code, "verification finished");
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandVerifier {
        CommandVerifier::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
            10_000,
        )
    }

    #[test]
    fn runs_inside_sandbox_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("main.py"), "").expect("write");
        let report = sh("test -f main.py && echo found").verify(temp.path()).expect("verify");
        assert!(report.passed());
        assert_eq!(report.stdout, "found\n");
    }

    #[test]
    fn non_zero_exit_is_a_failing_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = sh("echo broken >&2; exit 1").verify(temp.path()).expect("verify");
        assert!(!report.passed());
        assert_eq!(report.render(), "returncode=1\nstdout:\n\nstderr:\nbroken\n");
    }

    #[test]
    fn timeout_is_a_failing_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = CommandVerifier::new(
            vec!["sh".to_string(), "-c".to_string(), "exec sleep 5".to_string()],
            Duration::from_millis(200),
            1_000,
        );
        let report = verifier.verify(temp.path()).expect("verify");
        assert_eq!(report.exit_code, None);
        assert!(report.render().starts_with("returncode=timeout"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = CommandVerifier::new(
            vec!["no-such-oracle-binary".to_string()],
            Duration::from_secs(1),
            100,
        );
        assert!(verifier.verify(temp.path()).is_err());
    }
}
