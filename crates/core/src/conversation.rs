//! Conversation Session
//!
//! The model keeps no state between calls. Persona and case consistency come
//! from replaying the whole history on every turn: two priming messages that
//! inject the persona rules and the hidden truth, then alternating user
//! actions and model replies.

use crate::{
    case::Case,
    error::ApiError,
    llm_client::LLMClient,
    prompts::{Prompt, PromptSet},
};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{info, warn};

/// Number of priming messages at the start of every history.
pub const PRIMING_LEN: usize = 2;

/// Replies at or above this many characters go to the exam narrator.
const SPEAKABLE_MAX_CHARS: usize = 200;

/// Shown in the patient's speech bubble when a reply is an exam result.
pub const NARRATOR_PLACEHOLDER: &str = "(Analisando prontuário...)";

static EXAM_VOCABULARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)exame|resultado|hba1c|leuc|hemograma|tórax|abdome|vr|referência")
        .expect("valid exam vocabulary pattern")
});

static ACTION_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^Ação do Médico: "(.*)"\. Justificativa: "(.*)"\.$"#)
        .expect("valid action pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// What the player did and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalAction {
    pub action: String,
    pub justification: String,
}

impl ClinicalAction {
    pub fn new(action: impl Into<String>, justification: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            justification: justification.into(),
        }
    }

    /// The text sent to the model for this action.
    pub fn to_prompt(&self) -> String {
        format!(
            "Ação do Médico: \"{}\". Justificativa: \"{}\".",
            self.action, self.justification
        )
    }

    /// Recovers the pair from a message text built by [`Self::to_prompt`].
    pub fn parse(text: &str) -> Option<Self> {
        let caps = ACTION_TEXT.captures(text.trim())?;
        Some(Self::new(&caps[1], &caps[2]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// The structured pair a user message was built from. Older snapshots
    /// lack it and fall back to [`ClinicalAction::parse`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ClinicalAction>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            action: None,
        }
    }

    pub fn from_action(action: ClinicalAction) -> Self {
        Self {
            role: Role::User,
            content: action.to_prompt(),
            action: Some(action),
        }
    }
}

/// Who a model reply should be attributed to on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Short lay-language answer the patient can say.
    PatientSpeech,
    /// Exam or result text from the narrator.
    ExamResult,
}

impl ReplyKind {
    pub fn classify(reply: &str) -> Self {
        if reply.chars().count() < SPEAKABLE_MAX_CHARS && !EXAM_VOCABULARY.is_match(reply) {
            ReplyKind::PatientSpeech
        } else {
            ReplyKind::ExamResult
        }
    }

    /// The patient's speech-bubble text for `reply`.
    pub fn patient_line(self, reply: &str) -> String {
        match self {
            ReplyKind::PatientSpeech => format!("\"{}\"", reply.trim()),
            ReplyKind::ExamResult => NARRATOR_PLACEHOLDER.to_string(),
        }
    }
}

/// Builds the two priming messages for `case`.
pub fn initialize(case: &Case, prompts: &PromptSet) -> Vec<Message> {
    let hidden_truth = case.hidden_truth_json();
    let instructions = prompts.render(
        Prompt::PersonaInstructions,
        &[
            ("patient_name", &case.patient.name),
            ("personality", &case.patient.personality),
            ("hidden_truth", &hidden_truth),
        ],
    );
    vec![
        Message::new(Role::User, instructions),
        Message::new(Role::Model, prompts.template(Prompt::PersonaAck)),
    ]
}

/// Appends `action`, sends the whole history and appends the reply.
///
/// On failure the user message is removed again, so the history never holds
/// an unanswered action.
pub async fn append_exchange(
    history: &mut Vec<Message>,
    client: &dyn LLMClient,
    credential: &SecretString,
    action: ClinicalAction,
) -> Result<String, ApiError> {
    history.push(Message::from_action(action));
    match client.converse(credential, history).await {
        Ok(reply) => {
            history.push(Message::new(Role::Model, reply.clone()));
            info!(history_len = history.len(), "Exchange completed");
            Ok(reply)
        }
        Err(e) => {
            history.pop();
            warn!(error = %e, "Exchange failed; discarded the unanswered action");
            Err(e)
        }
    }
}

/// One line of the visible encounter log rebuilt from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Action(ClinicalAction),
    /// A user message whose action could not be recovered.
    RawUser(String),
    Reply(String),
}

/// Rebuilds the visible log from everything after the priming messages.
pub fn replay(history: &[Message]) -> Vec<LogLine> {
    history
        .iter()
        .skip(PRIMING_LEN)
        .map(|m| match m.role {
            Role::Model => LogLine::Reply(m.content.clone()),
            Role::User => m
                .action
                .clone()
                .or_else(|| ClinicalAction::parse(&m.content))
                .map(LogLine::Action)
                .unwrap_or_else(|| LogLine::RawUser(m.content.clone())),
        })
        .collect()
}
