//! Review stage: notes on the files that passed verification.

use std::path::Path;

use tracing::instrument;

use crate::core::persona::Persona;
use crate::io::chat::ChatClient;

use super::digest::{build_digest, format_digest};
use super::prompt::PromptBuilder;
use super::{CallError, CallSettings, ask};

/// Review the files as they exist on disk under `sandbox_root`.
#[instrument(skip_all, fields(root = %sandbox_root.display()))]
pub fn review<'a, C: ChatClient>(
    client: &C,
    prompts: &PromptBuilder,
    settings: &CallSettings,
    sandbox_root: &Path,
    paths: impl IntoIterator<Item = &'a str>,
) -> Result<String, CallError> {
    let digest = format_digest(&build_digest(sandbox_root, paths));
    let reply = ask(client, Persona::Reviewer, prompts.reviewer(&digest), settings)?;
    Ok(reply.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryPolicy;
    use crate::test_support::ScriptedChat;

    #[test]
    fn review_reads_files_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("main.py"), "print('on disk')\n").expect("write");
        let chat = ScriptedChat::new(vec![Ok(" looks fine ".to_string())]);
        let settings = CallSettings {
            temperature: 0.2,
            retry: RetryPolicy::default(),
        };
        let notes = review(
            &chat,
            &PromptBuilder::new(60_000),
            &settings,
            temp.path(),
            ["main.py"],
        )
        .expect("review");
        assert_eq!(notes, "looks fine");
        let prompt = &chat.calls()[0][1].content;
        assert!(prompt.contains("== File: main.py (17 bytes) =="));
        assert!(prompt.contains("print('on disk')"));
    }
}
