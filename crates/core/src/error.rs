//! Error types shared by the model client, the generators and the encounter
//! controller.

/// Failures of a call to the generation endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP 400. Never retried; usually a capability mismatch such as the
    /// model alias rejecting structured-output mode.
    #[error("HTTP 400: Bad Request ({0})")]
    BadRequest(String),
    /// Network error, non-2xx status or an unreadable body. Retryable.
    #[error("transient failure: {message}")]
    TransientFailure {
        status: Option<u16>,
        message: String,
    },
    /// Every allowed attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<ApiError>,
    },
    /// The body arrived but did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::TransientFailure {
            status,
            message: message.into(),
        }
    }

    /// Whether the resilient client may try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure { .. })
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadRequest(_))
    }
}

/// Errors surfaced by the encounter controller to the presentation layer.
#[derive(Debug, thiserror::Error)]
pub enum EncounterError {
    /// Required user input is missing. Never reaches the network layer.
    #[error("{0}")]
    Validation(String),
    #[error("case generation failed: {0}")]
    CaseGenerationFailed(#[source] ApiError),
    #[error("no case is in progress")]
    NoActiveCase,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures reading or writing the session snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on session snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("session snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A disease list could not be fetched.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SourceError(pub String);
