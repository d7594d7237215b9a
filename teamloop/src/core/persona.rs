//! System prompts for the model-driven stages.
//!
//! The system prompt is the only thing a chat backend learns about who is calling.
//! The offline mock backend maps it back to a persona to pick a canned answer.

use crate::core::types::Stage;

const PM_SYSTEM: &str = "You are the product manager of a small software team. \
Turn the user's one-line goal into a short requirements document: goal, user stories, \
scope, non-goals, acceptance criteria and risks. Plain text, no code.";

const ARCHITECT_SYSTEM: &str = "You are the software architect of a small software team. \
Given a requirements document, describe the file layout of a minimal Python project and \
the responsibility of each file. Keep it small enough to generate in one pass. Plain text, no code.";

const CODER_SYSTEM: &str = "You are the engineer of a small software team. \
You write complete, runnable source files. Reply with a single JSON object inside a \
```json fenced block and nothing else.";

const REVIEWER_SYSTEM: &str = "You are the code reviewer of a small software team. \
You receive a digest of generated files (possibly truncated). Never ask for the code to be \
pasted; review what you were given.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    ProductManager,
    Architect,
    Coder,
    Reviewer,
}

impl Persona {
    pub const ALL: [Persona; 4] = [
        Persona::ProductManager,
        Persona::Architect,
        Persona::Coder,
        Persona::Reviewer,
    ];

    pub fn system_prompt(self) -> &'static str {
        match self {
            Persona::ProductManager => PM_SYSTEM,
            Persona::Architect => ARCHITECT_SYSTEM,
            Persona::Coder => CODER_SYSTEM,
            Persona::Reviewer => REVIEWER_SYSTEM,
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Persona::ProductManager => Stage::Pm,
            Persona::Architect => Stage::Architect,
            Persona::Coder => Stage::Coder,
            Persona::Reviewer => Stage::Reviewer,
        }
    }

    pub fn from_system_prompt(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|persona| persona.system_prompt() == text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompts_map_back_to_personas() {
        for persona in Persona::ALL {
            assert_eq!(
                Persona::from_system_prompt(persona.system_prompt()),
                Some(persona)
            );
        }
        assert_eq!(Persona::from_system_prompt("someone else"), None);
    }
}
