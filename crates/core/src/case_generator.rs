//! Case Generation Service
//!
//! Turns a drawn disease name into a complete [`Case`] by asking the model for
//! a structured JSON scenario.

use crate::{
    case::{Case, HiddenTruth, Patient, Triage},
    error::ApiError,
    llm_client::{LLMClient, ResponseMode, strip_code_fences},
    prompts::{Prompt, PromptSet},
};
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};

/// Defines the contract for any service that can produce a clinical case.
#[async_trait]
pub trait CaseGenerator: Send + Sync {
    /// Generates a case whose hidden diagnosis is `disease`.
    ///
    /// # Errors
    ///
    /// Returns the model client's error, or [`ApiError::MalformedResponse`]
    /// when the answer is not a valid case document.
    async fn generate(&self, credential: &SecretString, disease: &str) -> Result<Case, ApiError>;
}

/// A `CaseGenerator` backed by the generation model in structured-output mode.
///
/// If the model rejects structured-output mode, the client retries once in
/// plain-text mode and the raw text is parsed the same way.
pub struct LLMCaseGenerator {
    llm: Arc<dyn LLMClient>,
    prompts: Arc<PromptSet>,
}

impl LLMCaseGenerator {
    /// Creates a new generator.
    ///
    /// # Arguments
    ///
    /// * `llm` - The model client.
    /// * `prompts` - Templates; [`Prompt::GenerateCase`] is used.
    pub fn new(llm: Arc<dyn LLMClient>, prompts: Arc<PromptSet>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl CaseGenerator for LLMCaseGenerator {
    async fn generate(&self, credential: &SecretString, disease: &str) -> Result<Case, ApiError> {
        let prompt = self
            .prompts
            .render(Prompt::GenerateCase, &[("disease", disease)]);
        let text = self
            .llm
            .generate_text(credential, &prompt, ResponseMode::Json)
            .await?;
        let case = parse_case(&text)?;
        info!(patient = %case.patient.name, "Generated case");
        Ok(case)
    }
}

/// Parses model output into a case, tolerating Markdown code fences.
pub fn parse_case(text: &str) -> Result<Case, ApiError> {
    serde_json::from_str(&strip_code_fences(text)).map_err(|e| {
        warn!(error = %e, "Model answer is not a valid case document");
        ApiError::MalformedResponse(format!("invalid case JSON: {}", e))
    })
}

/// A mock `CaseGenerator` for development and tests.
///
/// Always produces the same patient; the drawn disease becomes the diagnosis.
pub struct MockCaseGenerator;

#[async_trait]
impl CaseGenerator for MockCaseGenerator {
    async fn generate(&self, _credential: &SecretString, disease: &str) -> Result<Case, ApiError> {
        Ok(Case {
            patient: Patient {
                name: "José da Silva".to_string(),
                age: "58".to_string(),
                gender: "Masculino".to_string(),
                job: "Pedreiro".to_string(),
                visual_appearance: "Sudoreico, em regular estado geral".to_string(),
                personality: "Ansioso".to_string(),
            },
            triage: Triage {
                chief_complaint: "Não tô me sentindo bem, doutor".to_string(),
                vitals: "PA 140x90, FC 104, FR 22, Temp 37.8, SatO2 94%".to_string(),
            },
            hidden_truth: HiddenTruth {
                history_hpi: format!("Quadro típico de {}", disease),
                history_social: "Tabagista 30 maços-ano".to_string(),
                physical_exam: "Sem achados além do esperado".to_string(),
                labs_and_imaging: "Compatíveis com o diagnóstico".to_string(),
                diagnosis: disease.to_string(),
                pathophysiology: format!("Fisiopatologia clássica de {}", disease),
            },
        })
    }
}
