//! Planning stage: one-line goal to requirements document.

use tracing::instrument;

use crate::core::persona::Persona;
use crate::io::chat::ChatClient;

use super::prompt::PromptBuilder;
use super::{CallError, CallSettings, ask};

#[instrument(skip_all)]
pub fn write_requirements<C: ChatClient>(
    client: &C,
    prompts: &PromptBuilder,
    settings: &CallSettings,
    goal: &str,
) -> Result<String, CallError> {
    let reply = ask(client, Persona::ProductManager, prompts.pm(goal), settings)?;
    Ok(reply.trim().to_string())
}
