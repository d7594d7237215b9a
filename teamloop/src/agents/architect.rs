//! Design stage: requirements to a file layout.

use tracing::instrument;

use crate::core::persona::Persona;
use crate::io::chat::ChatClient;

use super::prompt::PromptBuilder;
use super::{CallError, CallSettings, ask};

#[instrument(skip_all, fields(required_file = %required_file))]
pub fn design<C: ChatClient>(
    client: &C,
    prompts: &PromptBuilder,
    settings: &CallSettings,
    requirements: &str,
    required_file: &str,
) -> Result<String, CallError> {
    let prompt = prompts.architect(requirements, required_file);
    let reply = ask(client, Persona::Architect, prompt, settings)?;
    Ok(reply.trim().to_string())
}
