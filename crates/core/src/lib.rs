pub mod case;
pub mod case_generator;
pub mod conversation;
pub mod disease_pool;
pub mod encounter;
pub mod error;
pub mod evaluation;
pub mod llm_client;
pub mod prompts;
pub mod resilient;
pub mod session;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{case::PatientCard, conversation::ReplyKind};

/// Domain events the core emits to whatever presentation layer is attached.
///
/// The core never renders anything itself; a front-end subscribes to these
/// through an `mpsc` channel and decides how to display them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new case was admitted. Only the public patient/triage fields are exposed.
    CaseReady { case_number: u32, card: PatientCard },
    /// A line for the encounter log.
    Log { text: String, category: LogCategory },
    /// The model answered a user action.
    ExchangeCompleted {
        reply: String,
        kind: ReplyKind,
        /// What the patient's speech bubble should show for this reply.
        patient_line: String,
    },
    /// The graded report is ready for display.
    ReportReady { markup: String },
    /// A user-visible failure. The operation can be retried as a whole.
    Error { message: String },
}

/// Category tag of an encounter log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogCategory {
    User,
    System,
    Error,
    RetryNotice,
}

impl Event {
    pub fn log(text: impl Into<String>, category: LogCategory) -> Self {
        Self::Log {
            text: text.into(),
            category,
        }
    }
}

/// Sends an event if a subscriber is attached.
pub(crate) async fn emit(events: &Option<mpsc::Sender<Event>>, event: Event) {
    if let Some(tx) = events {
        if tx.send(event).await.is_err() {
            tracing::warn!("Failed to deliver event: receiver dropped.");
        }
    }
}
