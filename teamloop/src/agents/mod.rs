//! Model-driven stages: planning, design, generation and review.
//!
//! Each stage renders its prompt, calls a [`ChatClient`] under the retry policy and
//! hands plain values back to the pipeline. None of them touch [`PipelineState`]
//! directly.
//!
//! [`PipelineState`]: crate::core::state::PipelineState

use tracing::debug;

use crate::core::persona::Persona;
use crate::core::retry::{RetryExhausted, RetryPolicy};
use crate::io::chat::{ChatClient, ChatError, ChatMessage};

pub mod architect;
pub mod coder;
pub mod digest;
pub mod pm;
pub mod prompt;
pub mod reviewer;

/// A chat call that failed for good, after retries where they applied.
pub type CallError = RetryExhausted<ChatError>;

/// Sampling and retry settings shared by every stage.
#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub temperature: f64,
    pub retry: RetryPolicy,
}

/// Send `persona`'s system prompt and `user_prompt`, retrying transient failures.
pub(crate) fn ask<C: ChatClient>(
    client: &C,
    persona: Persona,
    user_prompt: String,
    settings: &CallSettings,
) -> Result<String, CallError> {
    let messages = [
        ChatMessage::system(persona.system_prompt()),
        ChatMessage::user(user_prompt),
    ];
    let reply = settings
        .retry
        .run(|attempt| {
            debug!(stage = %persona.stage(), attempt, "chat call");
            client.chat(&messages, settings.temperature)
        })?;
    debug!(stage = %persona.stage(), reply_chars = reply.chars().count(), "chat reply");
    Ok(reply)
}
