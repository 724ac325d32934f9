//! Evaluation Service
//!
//! Grades the player's final submission against the hidden truth and the
//! actions they took, returning a report as HTML markup written by the model.

use crate::{
    case::Case,
    conversation::{Message, PRIMING_LEN},
    error::{ApiError, EncounterError},
    llm_client::{LLMClient, ResponseMode, strip_code_fences},
    prompts::{Prompt, PromptSet},
};
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

/// The player's final answer for a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub diagnosis: String,
    pub justification: String,
    pub plan: String,
}

impl Submission {
    pub fn new(
        diagnosis: impl Into<String>,
        justification: impl Into<String>,
        plan: impl Into<String>,
    ) -> Self {
        Self {
            diagnosis: diagnosis.into(),
            justification: justification.into(),
            plan: plan.into(),
        }
    }

    /// Every field of the final chart is mandatory.
    pub fn validate(&self) -> Result<(), EncounterError> {
        let blank = [&self.diagnosis, &self.justification, &self.plan]
            .iter()
            .any(|field| field.trim().is_empty());
        if blank {
            return Err(EncounterError::Validation(
                "Por favor, preencha todos os campos do prontuário final.".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Produces the report markup for `submission`.
    async fn evaluate(
        &self,
        credential: &SecretString,
        case: &Case,
        submission: &Submission,
        history: &[Message],
    ) -> Result<String, ApiError>;
}

pub struct LLMEvaluator {
    llm: Arc<dyn LLMClient>,
    prompts: Arc<PromptSet>,
}

impl LLMEvaluator {
    pub fn new(llm: Arc<dyn LLMClient>, prompts: Arc<PromptSet>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl Evaluator for LLMEvaluator {
    async fn evaluate(
        &self,
        credential: &SecretString,
        case: &Case,
        submission: &Submission,
        history: &[Message],
    ) -> Result<String, ApiError> {
        let prompt = evaluation_prompt(&self.prompts, case, submission, history);
        let text = self
            .llm
            .generate_text(credential, &prompt, ResponseMode::Text)
            .await?;
        info!(chars = text.len(), "Received evaluation report");
        Ok(strip_code_fences(&text))
    }
}

/// Builds the grading request. Only the player's exchanges are embedded; the
/// priming messages already live in the hidden truth.
fn evaluation_prompt(
    prompts: &PromptSet,
    case: &Case,
    submission: &Submission,
    history: &[Message],
) -> String {
    let exchanges = history.get(PRIMING_LEN..).unwrap_or_default();
    let history_json = serde_json::to_string(exchanges).unwrap_or_else(|_| "[]".to_string());
    let hidden_truth = case.hidden_truth_json();
    prompts.render(
        Prompt::EvaluateCase,
        &[
            ("hidden_truth", &hidden_truth),
            ("diagnosis", &submission.diagnosis),
            ("justification", &submission.justification),
            ("plan", &submission.plan),
            ("history", &history_json),
        ],
    )
}
