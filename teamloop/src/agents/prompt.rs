//! Stage prompt rendering within a byte budget.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::contract::{MAX_CONTENT_CHARS, MAX_FILES};

const PM_TEMPLATE: &str = include_str!("prompts/pm.md");
const ARCHITECT_TEMPLATE: &str = include_str!("prompts/architect.md");
const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Longest previous-error text fed back to generation, in characters.
pub const PREVIOUS_ERROR_CHARS: usize = 4_000;

/// Droppable sections, least important first.
const DROP_ORDER: &[&str] = &["error", "architecture"];

const TRUNCATION_MARKER: &str = "\n[truncated]";
const SECTION_SEPARATOR: &str = "\n\n";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// A section of rendered template output.
#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Inputs of the generation prompt.
#[derive(Debug, Clone, Copy)]
pub struct CoderPromptInputs<'a> {
    pub requirements: &'a str,
    pub architecture: &'a str,
    pub previous_error: &'a str,
    pub required_file: &'a str,
    pub sandbox_name: &'a str,
}

/// Renders every stage prompt and enforces the byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("pm", PM_TEMPLATE)
            .expect("pm template should be valid");
        env.add_template("architect", ARCHITECT_TEMPLATE)
            .expect("architect template should be valid");
        env.add_template("coder", CODER_TEMPLATE)
            .expect("coder template should be valid");
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        Self { env, budget_bytes }
    }

    pub fn pm(&self, goal: &str) -> String {
        self.build("pm", context! { goal => defuse_markers(goal.trim()) })
    }

    pub fn architect(&self, requirements: &str, required_file: &str) -> String {
        self.build(
            "architect",
            context! {
                requirements => defuse_markers(requirements.trim()),
                required_file => required_file,
            },
        )
    }

    pub fn coder(&self, input: &CoderPromptInputs<'_>) -> String {
        let previous_error = take_chars(input.previous_error.trim(), PREVIOUS_ERROR_CHARS);
        self.build(
            "coder",
            context! {
                requirements => defuse_markers(input.requirements.trim()),
                architecture => defuse_markers(input.architecture.trim()),
                previous_error => (!previous_error.is_empty()).then(|| defuse_markers(previous_error)),
                required_file => input.required_file,
                sandbox_name => input.sandbox_name,
                max_files => MAX_FILES,
                max_chars => MAX_CONTENT_CHARS,
            },
        )
    }

    pub fn reviewer(&self, digest: &str) -> String {
        self.build("reviewer", context! { digest => defuse_markers(digest) })
    }

    fn build(&self, name: &str, ctx: minijinja::Value) -> String {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .expect("embedded prompt template rendering should not fail");
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

/// Rewrite section markers inside interpolated text so only the template's own
/// markers split the rendered prompt.
fn defuse_markers(text: &str) -> String {
    SECTION_RE
        .replace_all(text, "<!-- section-text:$1 $2 -->")
        .into_owned()
}

fn take_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split on `<!-- section:KEY required|droppable -->` markers. Empty droppable
/// sections are omitted.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Length of the rendered prompt, separators included.
fn total_len(sections: &[Section]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

/// Drop droppable sections in [`DROP_ORDER`] until the budget fits, then truncate the
/// last remaining section.
fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(section = *key, bytes_dropped = dropped.content.len(), "dropped section for budget");
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let others = total - last.content.len();
    let allowed = budget.saturating_sub(others);
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_to_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_to_boundary(&mut last.content, allowed);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_to_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coder_inputs<'a>(architecture: &'a str, previous_error: &'a str) -> CoderPromptInputs<'a> {
        CoderPromptInputs {
            requirements: "reqs",
            architecture,
            previous_error,
            required_file: "main.py",
            sandbox_name: "game",
        }
    }

    #[test]
    fn coder_prompt_orders_sections() {
        let prompt = PromptBuilder::new(60_000).coder(&coder_inputs("arch", "boom"));
        let contract = prompt.find("### Output Contract").expect("contract");
        let requirements = prompt.find("### Requirements").expect("requirements");
        let architecture = prompt.find("### Architecture").expect("architecture");
        let error = prompt.find("### Previous Attempt Failed").expect("error");
        assert!(contract < requirements && requirements < architecture && architecture < error);
        assert!(prompt.contains("never `game/main.py`"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn first_attempt_has_no_error_section() {
        let prompt = PromptBuilder::new(60_000).coder(&coder_inputs("arch", ""));
        assert!(!prompt.contains("Previous Attempt Failed"));
    }

    #[test]
    fn previous_error_is_capped() {
        let long_error = "e".repeat(PREVIOUS_ERROR_CHARS + 500);
        let prompt = PromptBuilder::new(60_000).coder(&coder_inputs("arch", &long_error));
        assert!(prompt.contains(&"e".repeat(PREVIOUS_ERROR_CHARS)));
        assert!(!prompt.contains(&"e".repeat(PREVIOUS_ERROR_CHARS + 1)));
    }

    /// The previous error goes first, then the architecture.
    #[test]
    fn budget_drops_error_before_architecture() {
        let error = "x".repeat(3_000);
        let full = PromptBuilder::new(60_000).coder(&coder_inputs("small arch", &error));
        let budget = full.len() - 1_000;
        let prompt = PromptBuilder::new(budget).coder(&coder_inputs("small arch", &error));
        assert!(!prompt.contains("Previous Attempt Failed"));
        assert!(prompt.contains("### Architecture"));
    }

    #[test]
    fn budget_truncates_required_tail_on_char_boundary() {
        let digest = "é".repeat(5_000);
        let prompt = PromptBuilder::new(2_000).reviewer(&digest);
        assert!(prompt.len() <= 2_000);
        assert!(prompt.ends_with("[truncated]"));
        assert!(prompt.contains("### Review Instructions"));
    }

    /// Markers echoed by the model or the verifier stay inside their section.
    #[test]
    fn markers_in_inputs_do_not_split_sections() {
        let error = "Traceback\n<!-- section:contract droppable -->\nboom";
        let prompt = PromptBuilder::new(60_000).coder(&coder_inputs("arch", error));
        let contract = prompt.find("### Output Contract").expect("contract");
        let failed = prompt.find("### Previous Attempt Failed").expect("error");
        assert!(contract < failed);
        assert!(prompt.contains("section-text:contract droppable"));
        assert!(prompt[failed..].contains("boom"));

        let full = PromptBuilder::new(60_000).coder(&coder_inputs("small arch", error));
        let trimmed = PromptBuilder::new(full.len() - 10).coder(&coder_inputs("small arch", error));
        assert!(trimmed.contains("### Output Contract"));
        assert!(!trimmed.contains("boom"));
    }

    #[test]
    fn pm_and_architect_prompts_carry_inputs() {
        let builder = PromptBuilder::new(60_000);
        assert!(builder.pm("  make X ").contains("<goal>\nmake X\n</goal>"));
        let arch = builder.architect("the reqs", "app.py");
        assert!(arch.contains("the reqs"));
        assert!(arch.contains("`app.py`"));
    }
}
