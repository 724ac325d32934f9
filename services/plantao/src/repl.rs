//! Interactive terminal loop.
//!
//! Reads the player's input, calls into the [`Encounter`] and prints the
//! events it emits. Events are printed while an operation runs and drained
//! before the next prompt, so output always follows the input that caused it.

use crate::render::render;
use plantao_core::{Event, encounter::Encounter, error::EncounterError};
use secrecy::SecretString;
use std::io::{BufRead, Write};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELP: &str = "Comandos: :dx (diagnóstico final), :log (rever o prontuário), :sair. \
Qualquer outro texto é uma ação clínica.";

const INPUT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Action(String),
    Submit,
    ShowLog,
    Help,
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    match line.trim() {
        "" => Command::Empty,
        ":dx" | ":diagnostico" | ":diagnóstico" => Command::Submit,
        ":log" => Command::ShowLog,
        ":ajuda" | ":help" | "?" => Command::Help,
        ":sair" | ":q" | ":quit" => Command::Quit,
        other => Command::Action(other.to_string()),
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(
        answer.trim().to_lowercase().as_str(),
        "" | "s" | "sim" | "y" | "yes"
    )
}

/// Reads stdin line by line on a detached thread. A read still pending at
/// shutdown does not hold the process open.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read from stdin");
                    break;
                }
            }
        }
        debug!("Stdin reader finished");
    });
    rx
}

pub struct Repl<W> {
    input: mpsc::Receiver<String>,
    events: mpsc::Receiver<Event>,
    out: W,
}

impl<W: Write> Repl<W> {
    pub fn new(input: mpsc::Receiver<String>, events: mpsc::Receiver<Event>, out: W) -> Self {
        Self { input, events, out }
    }

    fn say(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.out, "{}", text)
    }

    /// Prints every event already queued.
    fn drain(&mut self) -> std::io::Result<()> {
        while let Ok(event) = self.events.try_recv() {
            writeln!(self.out, "{}", render(&event))?;
        }
        Ok(())
    }

    /// Runs `operation`, printing its events as they arrive.
    async fn drive<F: Future>(&mut self, operation: F) -> anyhow::Result<F::Output> {
        tokio::pin!(operation);
        let output = loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => writeln!(self.out, "{}", render(&event))?,
                output = &mut operation => break output,
            }
        };
        self.drain()?;
        Ok(output)
    }

    /// Prints `label` and reads one line. `None` on end of input.
    async fn ask(&mut self, label: &str) -> anyhow::Result<Option<String>> {
        self.drain()?;
        write!(self.out, "{} ", label)?;
        self.out.flush()?;
        Ok(self.input.recv().await)
    }

    /// Prints validation messages; every other failure was already emitted.
    fn report<T>(&mut self, result: Result<T, EncounterError>) -> std::io::Result<()> {
        if let Err(EncounterError::Validation(message)) = result {
            self.say(&message)?;
        }
        Ok(())
    }

    /// Runs the shift until the player quits or input ends.
    ///
    /// A configured `api_key` takes precedence over the one in the snapshot.
    pub async fn run(
        &mut self,
        encounter: &mut Encounter,
        api_key: Option<SecretString>,
    ) -> anyhow::Result<()> {
        if self.drive(encounter.resume()).await? {
            info!("Resumed the saved encounter");
            if let Some(key) = api_key {
                encounter.set_credential(key)?;
                info!("Using the configured API key");
            }
        } else if !self.admit_first_patient(encounter, api_key).await? {
            return Ok(());
        }
        self.say(HELP)?;

        loop {
            let Some(line) = self.ask("AÇÃO>").await? else {
                break;
            };
            match parse_command(&line) {
                Command::Empty => continue,
                Command::Help => self.say(HELP)?,
                Command::Quit => break,
                Command::ShowLog => {
                    for event in encounter.replay_log() {
                        self.say(&render(&event))?;
                    }
                }
                Command::Action(action) => {
                    let Some(justification) = self.ask("JUSTIFICATIVA>").await? else {
                        break;
                    };
                    let result = self
                        .drive(encounter.perform_action(&action, &justification))
                        .await?;
                    self.report(result)?;
                }
                Command::Submit => {
                    if !self.submit(encounter).await? {
                        break;
                    }
                }
            }
        }
        debug!("Leaving the interactive loop");
        Ok(())
    }

    /// Starts the shift with the configured key, or asks for one, then
    /// admits the first patient. Returns `false` if the player gave up.
    async fn admit_first_patient(
        &mut self,
        encounter: &mut Encounter,
        mut api_key: Option<SecretString>,
    ) -> anyhow::Result<bool> {
        if api_key.is_some() || !encounter.has_credential() {
            loop {
                let key = match api_key.take() {
                    Some(key) => key,
                    None => match self.ask("Chave API Gemini:").await? {
                        Some(line) => SecretString::from(line),
                        None => return Ok(false),
                    },
                };
                match self.drive(encounter.start_shift(key)).await? {
                    Ok(()) => return Ok(true),
                    Err(EncounterError::Validation(message)) => self.say(&message)?,
                    Err(EncounterError::CaseGenerationFailed(_)) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            if !self.confirm_retry().await? {
                return Ok(false);
            }
        }
        self.admit_with_retry(encounter).await
    }

    /// Generates a new case, offering a retry after each failure.
    async fn admit_with_retry(&mut self, encounter: &mut Encounter) -> anyhow::Result<bool> {
        loop {
            match self.drive(encounter.new_case()).await? {
                Ok(()) => return Ok(true),
                Err(EncounterError::CaseGenerationFailed(_)) => {
                    if !self.confirm_retry().await? {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn confirm_retry(&mut self) -> anyhow::Result<bool> {
        Ok(self
            .ask("Tentar gerar novamente? [S/n]")
            .await?
            .is_some_and(|answer| is_yes(&answer)))
    }

    /// Collects the final chart and grades it. Returns `false` if the player
    /// ends the shift afterwards.
    async fn submit(&mut self, encounter: &mut Encounter) -> anyhow::Result<bool> {
        let Some(diagnosis) = self.ask("Hipótese diagnóstica:").await? else {
            return Ok(false);
        };
        let Some(justification) = self.ask("Justificativa:").await? else {
            return Ok(false);
        };
        let Some(plan) = self.ask("Conduta:").await? else {
            return Ok(false);
        };

        match self
            .drive(encounter.submit(&diagnosis, &justification, &plan))
            .await?
        {
            Ok(_) => {}
            Err(EncounterError::Validation(message)) => {
                self.say(&message)?;
                return Ok(true);
            }
            // Already reported through the event stream; the case continues.
            Err(_) => return Ok(true),
        }

        let next = self
            .ask("Próximo paciente? [S/n]")
            .await?
            .is_some_and(|answer| is_yes(&answer));
        if !next {
            return Ok(false);
        }
        self.admit_with_retry(encounter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plantao_core::{
        case::Case,
        case_generator::{CaseGenerator, MockCaseGenerator},
        conversation::Message,
        disease_pool::BuiltinDiseaseSource,
        encounter::EncounterServices,
        error::ApiError,
        evaluation::{Evaluator, Submission},
        llm_client::{LLMClient, ResponseMode},
        prompts::PromptSet,
        session::{MemoryStore, Session, SessionStore},
    };
    use secrecy::ExposeSecret;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TalkativePatient;

    #[async_trait]
    impl LLMClient for TalkativePatient {
        async fn generate_text(
            &self,
            _credential: &SecretString,
            _prompt: &str,
            _mode: ResponseMode,
        ) -> Result<String, ApiError> {
            Ok(String::new())
        }

        async fn converse(
            &self,
            _credential: &SecretString,
            _history: &[Message],
        ) -> Result<String, ApiError> {
            Ok("Dói aqui, doutor.".to_string())
        }
    }

    struct FixedReport;

    #[async_trait]
    impl Evaluator for FixedReport {
        async fn evaluate(
            &self,
            _credential: &SecretString,
            _case: &Case,
            _submission: &Submission,
            _history: &[Message],
        ) -> Result<String, ApiError> {
            Ok("<p>NOTA: 9</p>".to_string())
        }
    }

    /// Fails the first `failures` generations, then behaves like the mock.
    struct FlakyGenerator {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyGenerator {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CaseGenerator for FlakyGenerator {
        async fn generate(&self, credential: &SecretString, disease: &str) -> Result<Case, ApiError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ApiError::MalformedResponse("invalid case JSON".into()));
            }
            MockCaseGenerator.generate(credential, disease).await
        }
    }

    fn encounter(
        generator: Arc<dyn CaseGenerator>,
        store: Arc<MemoryStore>,
    ) -> (Encounter, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let services = EncounterServices {
            llm: Arc::new(TalkativePatient),
            case_generator: generator,
            evaluator: Arc::new(FixedReport),
            disease_source: Arc::new(BuiltinDiseaseSource),
            store,
            prompts: Arc::new(PromptSet::default()),
        };
        (Encounter::new(services).with_events(tx), rx)
    }

    /// Input ends after `lines`.
    fn repl(lines: &[&str], events: mpsc::Receiver<Event>) -> Repl<Vec<u8>> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line.to_string()).unwrap();
        }
        Repl::new(rx, events, Vec::new())
    }

    fn output(repl: &Repl<Vec<u8>>) -> String {
        String::from_utf8(repl.out.clone()).unwrap()
    }

    fn position(text: &str, needle: &str) -> usize {
        text.find(needle)
            .unwrap_or_else(|| panic!("{:?} not found in:\n{}", needle, text))
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  :dx "), Command::Submit);
        assert_eq!(parse_command(":log"), Command::ShowLog);
        assert_eq!(parse_command(":sair"), Command::Quit);
        assert_eq!(parse_command("?"), Command::Help);
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(
            parse_command(" Palpar abdome "),
            Command::Action("Palpar abdome".to_string())
        );
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes(""));
        assert!(is_yes("S"));
        assert!(is_yes(" sim "));
        assert!(!is_yes("n"));
        assert!(!is_yes("não"));
    }

    #[tokio::test]
    async fn test_output_follows_the_input_that_caused_it() {
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), Arc::new(MemoryStore::new()));
        let mut repl = repl(&["key", "Palpar abdome", "Dor em HCD", ":sair"], events);

        repl.run(&mut enc, None).await.unwrap();

        let text = output(&repl);
        let key_prompt = position(&text, "Chave API Gemini:");
        let card = position(&text, "===== CASO #001 =====");
        let first_action = position(&text, "AÇÃO>");
        let justification = position(&text, "JUSTIFICATIVA>");
        let reply = position(&text, "PACIENTE: \"Dói aqui, doutor.\"");
        let last_action = text.rfind("AÇÃO>").unwrap();

        assert!(key_prompt < card);
        assert!(card < first_action);
        assert!(justification < reply);
        assert!(reply < last_action);
        assert_eq!(enc.session().history.len(), 4);
    }

    #[tokio::test]
    async fn test_generation_failure_offers_retry() {
        let (mut enc, events) = encounter(
            Arc::new(FlakyGenerator::new(1)),
            Arc::new(MemoryStore::new()),
        );
        let mut repl = repl(&["s", ":sair"], events);

        repl.run(&mut enc, Some(SecretString::from("key")))
            .await
            .unwrap();

        let text = output(&repl);
        let error = position(&text, "!! Erro crítico ao gerar caso");
        let retry = position(&text, "Tentar gerar novamente? [S/n]");
        let card = position(&text, "===== CASO #001 =====");
        assert!(error < retry);
        assert!(retry < card);
        assert!(enc.has_active_case());
    }

    #[tokio::test]
    async fn test_declining_retry_ends_the_shift() {
        let (mut enc, events) = encounter(
            Arc::new(FlakyGenerator::new(usize::MAX)),
            Arc::new(MemoryStore::new()),
        );
        let mut repl = repl(&["key", "n"], events);

        repl.run(&mut enc, None).await.unwrap();

        let text = output(&repl);
        assert!(text.contains("Tentar gerar novamente? [S/n]"));
        assert!(!text.contains("AÇÃO>"));
        assert!(!enc.has_active_case());
    }

    #[tokio::test]
    async fn test_submit_then_admit_next_patient() {
        let store = Arc::new(MemoryStore::new());
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), store.clone());
        let mut repl = repl(
            &[":dx", "Dengue", "Febre e mialgia", "Hidratação", "s", ":sair"],
            events,
        );

        repl.run(&mut enc, Some(SecretString::from("key")))
            .await
            .unwrap();

        let text = output(&repl);
        let report = position(&text, "===== RELATÓRIO =====\nNOTA: 9");
        let next = position(&text, "Próximo paciente? [S/n]");
        let second_card = position(&text, "===== CASO #002 =====");
        assert!(report < next);
        assert!(next < second_card);
        assert_eq!(enc.session().case_count, 2);
        assert!(store.read_snapshot().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incomplete_chart_keeps_the_case_open() {
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), Arc::new(MemoryStore::new()));
        let mut repl = repl(&[":dx", "", "Febre", "Hidratação", ":sair"], events);

        repl.run(&mut enc, Some(SecretString::from("key")))
            .await
            .unwrap();

        let text = output(&repl);
        assert!(text.contains("Por favor, preencha todos os campos do prontuário final."));
        assert!(!text.contains("RELATÓRIO"));
        assert!(enc.has_active_case());
    }

    #[tokio::test]
    async fn test_end_of_input_mid_chart_keeps_the_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), store.clone());
        let mut repl = repl(&[":dx", "Dengue"], events);

        repl.run(&mut enc, Some(SecretString::from("key")))
            .await
            .unwrap();

        assert!(enc.has_active_case());
        assert!(store.read_snapshot().unwrap().is_some());
        assert!(!output(&repl).contains("Próximo paciente?"));
    }

    #[tokio::test]
    async fn test_configured_key_replaces_saved_one() {
        let store = Arc::new(MemoryStore::new());
        let case = MockCaseGenerator
            .generate(&SecretString::from("old"), "Dengue")
            .await
            .unwrap();
        store
            .save(&Session {
                credential: Some(SecretString::from("old")),
                case: Some(case),
                case_count: 1,
                ..Session::default()
            })
            .unwrap();
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), store.clone());
        let mut repl = repl(&[":sair"], events);

        repl.run(&mut enc, Some(SecretString::from("new")))
            .await
            .unwrap();

        let saved = store.load().unwrap().unwrap();
        assert_eq!(
            saved.credential.as_ref().map(|c| c.expose_secret().to_string()),
            Some("new".to_string())
        );
        let text = output(&repl);
        assert!(position(&text, "===== CASO #001 =====") < position(&text, "AÇÃO>"));
    }

    #[tokio::test]
    async fn test_waiting_for_input_can_be_cancelled() {
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), Arc::new(MemoryStore::new()));
        let (_input_tx, input_rx) = mpsc::channel(1);
        let mut repl = Repl::new(input_rx, events, Vec::new());

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            repl.run(&mut enc, None),
        )
        .await;

        assert!(waited.is_err());
        assert!(output(&repl).ends_with("Chave API Gemini: "));
    }

    #[tokio::test]
    async fn test_saved_credential_without_case_is_reused() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(&Session {
                credential: Some(SecretString::from("saved")),
                ..Session::default()
            })
            .unwrap();
        let (mut enc, events) = encounter(Arc::new(MockCaseGenerator), store);
        let mut repl = repl(&[":sair"], events);

        repl.run(&mut enc, None).await.unwrap();

        assert!(!output(&repl).contains("Chave API Gemini:"));
        assert!(enc.has_active_case());
    }
}
