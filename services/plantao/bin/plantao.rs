//! Main Entrypoint for the Plantão terminal simulator
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Building the model client and the core services.
//! 4. Reading stdin on its own thread and running the interactive loop until
//!    the player quits or presses Ctrl+C.

use anyhow::Context;
use clap::Parser;
use plantao_core::{
    Event,
    case_generator::LLMCaseGenerator,
    disease_pool::{BuiltinDiseaseSource, DiseaseSource, source_for},
    encounter::{Encounter, EncounterServices},
    evaluation::LLMEvaluator,
    llm_client::{GeminiClient, LLMClient},
    prompts::PromptSet,
    resilient::{ReqwestTransport, ResilientClient},
    session::{JsonFileStore, SessionStore},
};
use plantao_service::{
    config::{Args, Config},
    repl::{Repl, spawn_stdin_reader},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

const EVENT_BUFFER: usize = 64;

/// Builds the encounter and every service it depends on.
fn build_encounter(
    config: &Config,
    prompts: PromptSet,
    fresh: bool,
    events: mpsc::Sender<Event>,
) -> anyhow::Result<Encounter> {
    let prompts = Arc::new(prompts);

    let http = ResilientClient::new(Arc::new(ReqwestTransport::new()), config.retry_policy())
        .with_events(events.clone());
    let llm: Arc<dyn LLMClient> = Arc::new(GeminiClient::new(
        http,
        config.api_base.clone(),
        config.model.clone(),
    ));

    let disease_source: Arc<dyn DiseaseSource> = match &config.disease_list {
        Some(location) => {
            info!(%location, "Using configured disease list");
            Arc::from(source_for(location, config.disease_delimiter))
        }
        None => Arc::new(BuiltinDiseaseSource),
    };

    let store = Arc::new(JsonFileStore::new(config.session_path.clone()));
    if fresh {
        store
            .clear()
            .context("Failed to discard the saved session")?;
        info!("Saved session discarded.");
    }

    let services = EncounterServices {
        case_generator: Arc::new(LLMCaseGenerator::new(llm.clone(), prompts.clone())),
        evaluator: Arc::new(LLMEvaluator::new(llm.clone(), prompts.clone())),
        llm,
        disease_source,
        store,
        prompts,
    };
    Ok(Encounter::new(services).with_events(events))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let config = Config::from_env()
        .context("Failed to load configuration")?
        .with_args(&args);

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        model = %config.model,
        session_path = %config.session_path.display(),
        max_attempts = config.max_attempts,
        "Configuration loaded."
    );

    // --- 3. Initialize Services ---
    let prompts = match &config.prompts_path {
        Some(dir) => PromptSet::from_dir(dir)
            .with_context(|| format!("Failed to load prompts from {}", dir.display()))?,
        None => PromptSet::default(),
    };
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut encounter = build_encounter(&config, prompts, args.fresh, events_tx)?;

    // --- 4. Run ---
    let mut repl = Repl::new(spawn_stdin_reader(), events_rx, std::io::stdout());
    tokio::select! {
        result = repl.run(&mut encounter, config.api_key().ok()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C. The session is saved."),
    }

    // The stdin thread is detached, so returning here ends the process even
    // while a read is pending.
    info!("Shift ended.");
    Ok(())
}
