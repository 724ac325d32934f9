use clap::Parser;
use plantao_core::{
    disease_pool::DEFAULT_DELIMITER,
    llm_client::{DEFAULT_API_BASE, DEFAULT_MODEL},
    resilient::RetryPolicy,
    session::JsonFileStore,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Command-line arguments. Each one overrides its environment variable.
#[derive(Debug, Default, Parser)]
#[command(version, about = "Plantão: simulador de atendimento clínico")]
pub struct Args {
    /// Model identifier (GEMINI_MODEL).
    #[arg(long)]
    pub model: Option<String>,
    /// Disease list file or URL (DISEASE_LIST).
    #[arg(long)]
    pub diseases: Option<String>,
    /// Session snapshot file (SESSION_PATH).
    #[arg(long)]
    pub session_path: Option<PathBuf>,
    /// Directory of prompt overrides (PROMPTS_PATH).
    #[arg(long)]
    pub prompts: Option<PathBuf>,
    /// Discard any saved session and start a new shift.
    #[arg(long)]
    pub fresh: bool,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub gemini_api_key: Option<SecretString>,
    pub model: String,
    pub api_base: String,
    /// File path or URL; the built-in list is used when unset.
    pub disease_list: Option<String>,
    pub disease_delimiter: char,
    pub session_path: PathBuf,
    pub prompts_path: Option<PathBuf>,
    pub max_attempts: u32,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(SecretString::from);

        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let api_base =
            std::env::var("GEMINI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        let disease_list = std::env::var("DISEASE_LIST").ok().filter(|s| !s.is_empty());
        let disease_delimiter = match std::env::var("DISEASE_DELIMITER") {
            Err(_) => DEFAULT_DELIMITER,
            Ok(raw) => {
                let mut chars = raw.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(ConfigError::InvalidValue(
                            "DISEASE_DELIMITER".to_string(),
                            format!("'{}' is not a single character", raw),
                        ));
                    }
                }
            }
        };

        let session_path = std::env::var("SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| JsonFileStore::default_path());
        let prompts_path = std::env::var("PROMPTS_PATH").ok().map(PathBuf::from);

        let max_attempts = match std::env::var("MAX_ATTEMPTS") {
            Err(_) => RetryPolicy::default().max_attempts,
            Ok(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "MAX_ATTEMPTS".to_string(),
                        format!("'{}' is not a positive integer", raw),
                    )
                })?,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            model,
            api_base,
            disease_list,
            disease_delimiter,
            session_path,
            prompts_path,
            max_attempts,
            log_level,
        })
    }

    /// Applies command-line overrides.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(model) = &args.model {
            self.model = model.clone();
        }
        if let Some(diseases) = &args.diseases {
            self.disease_list = Some(diseases.clone());
        }
        if let Some(path) = &args.session_path {
            self.session_path = path.clone();
        }
        if let Some(path) = &args.prompts {
            self.prompts_path = Some(path.clone());
        }
        self
    }

    /// The configured API key, if any. Without one the key is asked for
    /// interactively.
    pub fn api_key(&self) -> Result<SecretString, ConfigError> {
        self.gemini_api_key
            .as_ref()
            .map(|key| SecretString::from(key.expose_secret().to_string()))
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}
