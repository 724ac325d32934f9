//! Encounter Controller
//!
//! Owns the [`Session`] and drives one shift: admitting patients, relaying
//! the player's actions to the model, and grading the final submission. Every
//! state change is followed by a snapshot so the shift can be resumed, and
//! everything the player should see is emitted as an [`Event`].

use crate::{
    Event, LogCategory,
    case_generator::CaseGenerator,
    conversation::{self, ClinicalAction, LogLine, ReplyKind},
    disease_pool::DiseaseSource,
    emit,
    error::EncounterError,
    evaluation::{Evaluator, Submission},
    llm_client::LLMClient,
    prompts::PromptSet,
    session::{Session, SessionStore},
};
use rand::{SeedableRng, rngs::StdRng};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// The services an encounter depends on.
#[derive(Clone)]
pub struct EncounterServices {
    pub llm: Arc<dyn LLMClient>,
    pub case_generator: Arc<dyn CaseGenerator>,
    pub evaluator: Arc<dyn Evaluator>,
    pub disease_source: Arc<dyn DiseaseSource>,
    pub store: Arc<dyn SessionStore>,
    pub prompts: Arc<PromptSet>,
}

pub struct Encounter {
    services: EncounterServices,
    session: Session,
    rng: StdRng,
    events: Option<mpsc::Sender<Event>>,
}

impl Encounter {
    pub fn new(services: EncounterServices) -> Self {
        Self::with_rng(services, StdRng::from_os_rng())
    }

    /// Uses `rng` for disease draws, so a seeded generator gives a
    /// reproducible shift.
    pub fn with_rng(services: EncounterServices, rng: StdRng) -> Self {
        Self {
            services,
            session: Session::default(),
            rng,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn has_credential(&self) -> bool {
        self.session.has_credential()
    }

    pub fn has_active_case(&self) -> bool {
        self.session.case.is_some()
    }

    /// Restores the stored snapshot, if any. Returns `true` when a case was
    /// in progress; its card and log are re-emitted.
    ///
    /// An unreadable snapshot is reported and treated as absent.
    pub async fn resume(&mut self) -> bool {
        let session = match self.services.store.load() {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session snapshot");
                emit(
                    &self.events,
                    Event::log(
                        format!("Sessão anterior ilegível, ignorada: {}", e),
                        LogCategory::Error,
                    ),
                )
                .await;
                return false;
            }
        };
        self.session = session;

        let Some(case) = &self.session.case else {
            return false;
        };
        info!(case_number = self.session.case_count, "Resuming encounter");
        emit(
            &self.events,
            Event::CaseReady {
                case_number: self.session.case_count,
                card: case.card(),
            },
        )
        .await;
        for event in self.replay_log() {
            emit(&self.events, event).await;
        }
        true
    }

    /// Replaces the session credential and saves the snapshot right away.
    pub fn set_credential(&mut self, credential: SecretString) -> Result<(), EncounterError> {
        let trimmed = credential.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(EncounterError::Validation("Insira a chave API.".to_string()));
        }
        self.session.credential = Some(SecretString::from(trimmed.to_string()));
        self.services.store.save(&self.session)?;
        Ok(())
    }

    /// Stores the credential and admits the first patient.
    pub async fn start_shift(&mut self, credential: SecretString) -> Result<(), EncounterError> {
        self.set_credential(credential)?;
        info!("Shift started");
        self.new_case().await
    }

    /// Draws a disease, generates a case for it and primes the conversation.
    ///
    /// The previous case stays in place until generation succeeds.
    pub async fn new_case(&mut self) -> Result<(), EncounterError> {
        let Some(credential) = self.session.credential.as_ref() else {
            return Err(EncounterError::Validation("Insira a chave API.".to_string()));
        };
        emit(
            &self.events,
            Event::log("ADMITINDO PACIENTE...", LogCategory::System),
        )
        .await;

        let Some(disease) = self
            .session
            .pool
            .get_next(self.services.disease_source.as_ref(), &mut self.rng)
            .await
        else {
            return Err(EncounterError::Validation(
                "A lista de doenças está vazia.".to_string(),
            ));
        };
        info!(%disease, "Disease drawn");

        let case = match self.services.case_generator.generate(credential, &disease).await {
            Ok(case) => case,
            Err(e) => {
                error!(error = %e, "Case generation failed");
                let err = EncounterError::CaseGenerationFailed(e);
                emit(
                    &self.events,
                    Event::Error {
                        message: format!("Erro crítico ao gerar caso: {}", err),
                    },
                )
                .await;
                return Err(err);
            }
        };

        self.session.history = conversation::initialize(&case, &self.services.prompts);
        self.session.case_count += 1;
        let card = case.card();
        self.session.case = Some(case);
        self.checkpoint().await;

        emit(
            &self.events,
            Event::CaseReady {
                case_number: self.session.case_count,
                card,
            },
        )
        .await;
        Ok(())
    }

    /// Sends one clinical action to the patient and the exam narrator.
    pub async fn perform_action(
        &mut self,
        action: &str,
        justification: &str,
    ) -> Result<ReplyKind, EncounterError> {
        let (action, justification) = (action.trim(), justification.trim());
        if action.is_empty() || justification.is_empty() {
            return Err(EncounterError::Validation(
                "Preencha a Ação e a Justificativa.".to_string(),
            ));
        }
        if self.session.case.is_none() {
            return Err(EncounterError::NoActiveCase);
        }
        let Some(credential) = self.session.credential.as_ref() else {
            return Err(EncounterError::NoActiveCase);
        };

        emit(
            &self.events,
            Event::log(format!("AÇÃO: {}", action), LogCategory::User),
        )
        .await;
        emit(
            &self.events,
            Event::log(format!("JUSTIF: {}", justification), LogCategory::System),
        )
        .await;

        let result = conversation::append_exchange(
            &mut self.session.history,
            self.services.llm.as_ref(),
            credential,
            ClinicalAction::new(action, justification),
        )
        .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                emit(
                    &self.events,
                    Event::log(format!("ERRO FINAL: {}", e), LogCategory::Error),
                )
                .await;
                return Err(e.into());
            }
        };

        let kind = ReplyKind::classify(&reply);
        emit(&self.events, Event::log(reply.clone(), LogCategory::System)).await;
        emit(
            &self.events,
            Event::ExchangeCompleted {
                patient_line: kind.patient_line(&reply),
                reply,
                kind,
            },
        )
        .await;
        self.checkpoint().await;
        Ok(kind)
    }

    /// Grades the final chart. On success the snapshot is cleared; on failure
    /// the encounter continues untouched.
    pub async fn submit(
        &mut self,
        diagnosis: &str,
        justification: &str,
        plan: &str,
    ) -> Result<String, EncounterError> {
        let submission = Submission::new(diagnosis.trim(), justification.trim(), plan.trim());
        submission.validate()?;
        let (Some(case), Some(credential)) = (&self.session.case, &self.session.credential)
        else {
            return Err(EncounterError::NoActiveCase);
        };

        emit(
            &self.events,
            Event::log("AUDITANDO PRONTUÁRIO...", LogCategory::System),
        )
        .await;
        let markup = match self
            .services
            .evaluator
            .evaluate(credential, case, &submission, &self.session.history)
            .await
        {
            Ok(markup) => markup,
            Err(e) => {
                error!(error = %e, "Evaluation failed");
                emit(
                    &self.events,
                    Event::Error {
                        message: "Erro na auditoria. Tente novamente.".to_string(),
                    },
                )
                .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.services.store.clear() {
            warn!(error = %e, "Failed to clear the session snapshot");
        }
        info!(case_number = self.session.case_count, "Case submitted");
        emit(
            &self.events,
            Event::ReportReady {
                markup: markup.clone(),
            },
        )
        .await;
        Ok(markup)
    }

    /// The visible log of the current case, rebuilt from the history.
    pub fn replay_log(&self) -> Vec<Event> {
        conversation::replay(&self.session.history)
            .into_iter()
            .flat_map(|line| match line {
                LogLine::Action(a) => vec![
                    Event::log(format!("AÇÃO: {}", a.action), LogCategory::User),
                    Event::log(format!("JUSTIF: {}", a.justification), LogCategory::System),
                ],
                LogLine::RawUser(text) => vec![Event::log(text, LogCategory::User)],
                LogLine::Reply(text) => vec![Event::log(text, LogCategory::System)],
            })
            .collect()
    }

    /// Saves the snapshot. A failed save is reported but does not undo the
    /// in-memory state.
    async fn checkpoint(&self) {
        if let Err(e) = self.services.store.save(&self.session) {
            error!(error = %e, "Failed to save the session snapshot");
            emit(
                &self.events,
                Event::log(
                    format!("Falha ao salvar a sessão: {}", e),
                    LogCategory::Error,
                ),
            )
            .await;
        }
    }
}
