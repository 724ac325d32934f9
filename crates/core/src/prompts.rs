//! Prompt templates.
//!
//! Every template has a built-in default compiled into the crate. A directory
//! of `<name>.md` files can override any of them. Placeholders are written as
//! `{name}` and filled by [`PromptSet::render`].

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder pattern"));

/// The templates the simulator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prompt {
    /// Case generation. Placeholder: `{disease}`.
    GenerateCase,
    /// First priming message. Placeholders: `{patient_name}`, `{personality}`, `{hidden_truth}`.
    PersonaInstructions,
    /// Second priming message, the model's acknowledgment.
    PersonaAck,
    /// Grading request. Placeholders: `{hidden_truth}`, `{diagnosis}`,
    /// `{justification}`, `{plan}`, `{history}`.
    EvaluateCase,
}

impl Prompt {
    pub const ALL: [Prompt; 4] = [
        Prompt::GenerateCase,
        Prompt::PersonaInstructions,
        Prompt::PersonaAck,
        Prompt::EvaluateCase,
    ];

    /// File stem of the override file for this template.
    pub fn name(self) -> &'static str {
        match self {
            Prompt::GenerateCase => "generate_case",
            Prompt::PersonaInstructions => "persona_instructions",
            Prompt::PersonaAck => "persona_ack",
            Prompt::EvaluateCase => "evaluate_case",
        }
    }

    fn default_text(self) -> &'static str {
        match self {
            Prompt::GenerateCase => include_str!("../prompts/generate_case.md"),
            Prompt::PersonaInstructions => include_str!("../prompts/persona_instructions.md"),
            Prompt::PersonaAck => include_str!("../prompts/persona_ack.md"),
            Prompt::EvaluateCase => include_str!("../prompts/evaluate_case.md"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    templates: HashMap<Prompt, String>,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            templates: Prompt::ALL
                .iter()
                .map(|p| (*p, p.default_text().trim().to_string()))
                .collect(),
        }
    }
}

impl PromptSet {
    /// Loads the defaults, then overrides every template that has a matching
    /// `<name>.md` file in `dir`. Unknown files are ignored.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut set = Self::default();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Prompt::ALL.iter().find(|p| p.name() == stem) {
                Some(prompt) => {
                    let content = std::fs::read_to_string(&path)?;
                    set.templates.insert(*prompt, content.trim().to_string());
                    info!(prompt = stem, "Loaded prompt override");
                }
                None => debug!(file = %path.display(), "Ignoring unknown prompt file"),
            }
        }
        Ok(set)
    }

    pub fn template(&self, prompt: Prompt) -> &str {
        self.templates
            .get(&prompt)
            .map(String::as_str)
            .unwrap_or_else(|| prompt.default_text())
    }

    /// Fills `{name}` placeholders in one pass, so text inside a value is
    /// never itself treated as a placeholder. Unknown placeholders are kept.
    pub fn render(&self, prompt: Prompt, values: &[(&str, &str)]) -> String {
        PLACEHOLDER
            .replace_all(self.template(prompt), |caps: &Captures<'_>| {
                values
                    .iter()
                    .find(|(name, _)| *name == &caps[1])
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_prompt() {
        let set = PromptSet::default();
        for prompt in Prompt::ALL {
            assert!(!set.template(prompt).is_empty(), "{:?} is empty", prompt);
        }
        assert!(set.template(Prompt::GenerateCase).contains("{disease}"));
        assert!(set.template(Prompt::PersonaInstructions).contains("{hidden_truth}"));
        assert!(set.template(Prompt::EvaluateCase).contains("{history}"));
    }

    #[test]
    fn test_render_replaces_placeholders_only() {
        let set = PromptSet::default();
        let text = set.render(Prompt::GenerateCase, &[("disease", "Leptospirose")]);

        assert!(text.contains("PATOLOGIA SORTEADA: Leptospirose"));
        assert!(!text.contains("{disease}"));
        // The JSON skeleton's braces survive.
        assert!(text.contains("\"hidden_truth\": {"));
    }

    #[test]
    fn test_render_does_not_expand_placeholders_inside_values() {
        let set = PromptSet::default();
        let text = set.render(
            Prompt::EvaluateCase,
            &[("diagnosis", "{history}"), ("history", "[]")],
        );
        assert!(text.contains("Hipótese Diagnóstica: \"{history}\""));
        assert!(text.contains("HISTÓRICO DE AÇÕES E PERGUNTAS: []"));
    }

    #[test]
    fn test_from_dir_overrides_known_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("persona_ack.md"), "  Ok, entendido.\n").unwrap();
        std::fs::write(dir.path().join("unrelated.md"), "ignored").unwrap();
        std::fs::write(dir.path().join("evaluate_case.txt"), "ignored").unwrap();

        let set = PromptSet::from_dir(dir.path()).unwrap();

        assert_eq!(set.template(Prompt::PersonaAck), "Ok, entendido.");
        assert_eq!(
            set.template(Prompt::EvaluateCase),
            PromptSet::default().template(Prompt::EvaluateCase)
        );
    }

    #[test]
    fn test_from_dir_missing_directory() {
        assert!(PromptSet::from_dir(Path::new("/definitely/not/here")).is_err());
    }
}
