//! Generation stage: requirements and design to a validated file set.
//!
//! The model reply is untrusted text. It goes through extraction, the file-set
//! contract and the required-file check before the pipeline may write anything.

use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::core::contract::{
    ContractViolation, GeneratedFileSet, MissingRequiredFile, ValidatedFileSet, normalize_path,
};
use crate::core::json_extract::{ExtractError, extract_json_object};
use crate::core::persona::Persona;
use crate::core::types::FailureKind;
use crate::io::chat::ChatClient;

use super::prompt::{CoderPromptInputs, PromptBuilder};
use super::{CallError, CallSettings, ask};

/// Model text kept in a rejection message, in characters.
const RAW_OUTPUT_CHARS: usize = 2_000;

/// Why a generation attempt was rejected. Every variant is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("ProtocolError: {0}")]
    Protocol(#[from] ExtractError),
    #[error("ContractViolation: {0}")]
    Contract(#[from] ContractViolation),
    #[error("MissingRequiredFile: {0}")]
    MissingRequiredFile(#[from] MissingRequiredFile),
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerationError::Protocol(_) => FailureKind::ProtocolError,
            GenerationError::Contract(_) => FailureKind::ContractViolation,
            GenerationError::MissingRequiredFile(_) => FailureKind::MissingRequiredFile,
        }
    }

    /// Error text fed back to the next attempt, with the head of the raw reply.
    pub fn error_text(&self, raw: &str) -> String {
        let head = match raw.char_indices().nth(RAW_OUTPUT_CHARS) {
            Some((idx, _)) => &raw[..idx],
            None => raw,
        };
        format!("{self}\nRawOutput:\n{head}")
    }
}

/// Ask the coder model for a file set. Returns the raw reply.
#[instrument(skip_all, fields(retry = !input.previous_error.is_empty()))]
pub fn request_files<C: ChatClient>(
    client: &C,
    prompts: &PromptBuilder,
    settings: &CallSettings,
    input: &CoderPromptInputs<'_>,
) -> Result<String, CallError> {
    ask(client, Persona::Coder, prompts.coder(input), settings)
}

/// Turn a raw reply into a file set that is safe to write.
///
/// Paths echoing the sandbox directory (`game/main.py`) are rebased onto the root
/// before validation.
pub fn parse_files(
    raw: &str,
    required_file: &str,
    sandbox_name: &str,
) -> Result<ValidatedFileSet, GenerationError> {
    let object = extract_json_object(raw)?;
    let mut set = GeneratedFileSet::from_value(&Value::Object(object))?;
    for file in &mut set.files {
        file.path = strip_sandbox_prefix(&normalize_path(&file.path), sandbox_name);
    }
    let validated = set.validate()?;
    validated.require(required_file)?;
    Ok(validated)
}

fn strip_sandbox_prefix(path: &str, sandbox_name: &str) -> String {
    if sandbox_name.is_empty() {
        return path.to_string();
    }
    let prefix_len = sandbox_name.len() + 1;
    match (path.get(..sandbox_name.len()), path.get(sandbox_name.len()..prefix_len)) {
        (Some(head), Some("/")) if head.eq_ignore_ascii_case(sandbox_name) => {
            warn!(path, "stripped sandbox directory from generated path");
            path[prefix_len..].to_string()
        }
        _ => path.to_string(),
    }
}
