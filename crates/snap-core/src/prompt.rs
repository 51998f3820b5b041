//! Prompt rendering: condition in, chat messages out.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ExperimentDesign};
use crate::errors::{SnapError, SnapResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message as sent to an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Turns a condition into the exact messages sent to the model.
///
/// Rendering must be pure: the same condition always renders the same
/// messages, otherwise cache fingerprints drift between runs.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, condition: &Condition) -> Vec<ChatMessage>;

    /// Fail early when `design` references stimuli this renderer cannot produce.
    fn check(&self, _design: &ExperimentDesign) -> SnapResult<()> {
        Ok(())
    }
}

/// Stimulus texts loaded from YAML.
///
/// ```yaml
/// instruction: "Answer with a single number from 1 to 7."
/// system_prompts:
///   NEU: "You are a survey respondent."
/// contexts:
///   C0: ""
/// items:
///   M01:
///     P1: "Lying is sometimes acceptable."
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stimuli {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub system_prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub contexts: BTreeMap<String, String>,
    /// item id -> paraphrase id -> text
    pub items: BTreeMap<String, BTreeMap<String, String>>,
}

/// Renders `[system?, user]` where the user turn is context, item text and
/// instruction separated by blank lines. Empty parts are omitted.
#[derive(Debug, Clone)]
pub struct StimulusRenderer {
    stimuli: Stimuli,
}

impl StimulusRenderer {
    pub fn new(stimuli: Stimuli) -> Self {
        Self { stimuli }
    }

    pub fn load(path: &Path) -> SnapResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapError::config(format!("failed to read stimuli {}: {}", path.display(), e))
        })?;
        let stimuli: Stimuli = serde_yaml::from_str(&content).map_err(|e| {
            SnapError::config(format!("failed to parse stimuli {}: {}", path.display(), e))
        })?;
        Ok(Self::new(stimuli))
    }

    fn lookup<'a>(map: &'a BTreeMap<String, String>, id: &str) -> &'a str {
        map.get(id).map(String::as_str).unwrap_or_default()
    }
}

impl PromptRenderer for StimulusRenderer {
    fn render(&self, condition: &Condition) -> Vec<ChatMessage> {
        let s = &self.stimuli;
        let mut messages = Vec::with_capacity(2);

        let system = Self::lookup(&s.system_prompts, &condition.system_prompt_id);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }

        let item = s
            .items
            .get(&condition.item_id)
            .map(|p| Self::lookup(p, &condition.paraphrase_id))
            .unwrap_or_default();
        let user = [
            Self::lookup(&s.contexts, &condition.context_id),
            item,
            s.instruction.as_str(),
        ]
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
        messages.push(ChatMessage::user(user));
        messages
    }

    fn check(&self, design: &ExperimentDesign) -> SnapResult<()> {
        let s = &self.stimuli;
        for prompt in &design.system_prompts {
            if !s.system_prompts.contains_key(prompt) {
                return Err(SnapError::config(format!(
                    "stimuli missing system prompt '{prompt}'"
                )));
            }
        }
        for context in design.contexts.values().flatten() {
            if !s.contexts.contains_key(context) {
                return Err(SnapError::config(format!(
                    "stimuli missing context '{context}'"
                )));
            }
        }
        for item in design.items.values().flatten() {
            let Some(paraphrases) = s.items.get(item) else {
                return Err(SnapError::config(format!("stimuli missing item '{item}'")));
            };
            if let Some(missing) = design
                .paraphrases
                .iter()
                .find(|p| !paraphrases.contains_key(*p))
            {
                return Err(SnapError::config(format!(
                    "stimuli missing paraphrase '{missing}' for item '{item}'"
                )));
            }
        }
        Ok(())
    }
}
