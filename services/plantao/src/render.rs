//! Terminal rendering of domain events.
//!
//! Pure formatting; the [`crate::repl::Repl`] decides when lines are written.

use plantao_core::{Event, LogCategory, case::PatientCard};
use regex::Regex;
use std::sync::LazyLock;

static BLOCK_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|h[1-6]|ul|ol)>").expect("valid block pattern")
});
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<li[^>]*>").expect("valid list item pattern"));
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid blank line pattern"));

pub fn render(event: &Event) -> String {
    match event {
        Event::CaseReady { case_number, card } => render_card(*case_number, card),
        Event::Log { text, category } => match category {
            LogCategory::User => format!("> {}", text),
            LogCategory::System => format!("  {}", text),
            LogCategory::Error => format!("!! {}", text),
            LogCategory::RetryNotice => format!("   {}", text),
        },
        Event::ExchangeCompleted { patient_line, .. } => format!("PACIENTE: {}", patient_line),
        Event::ReportReady { markup } => {
            format!("===== RELATÓRIO =====\n{}\n=====================", html_to_text(markup))
        }
        Event::Error { message } => format!("!! {}", message),
    }
}

fn render_card(case_number: u32, card: &PatientCard) -> String {
    format!(
        "===== CASO #{:03} =====\n\
         Paciente: {} ({} anos, {})\n\
         Profissão: {}\n\
         Aspecto: {}\n\
         Queixa: \"{}\"\n\
         Sinais vitais: {}",
        case_number,
        card.name,
        card.age,
        card.gender,
        card.job,
        card.visual_appearance,
        card.chief_complaint,
        card.vitals
    )
}

/// Flattens the report's HTML into plain text for the terminal.
pub fn html_to_text(markup: &str) -> String {
    let text = BLOCK_END.replace_all(markup, "\n");
    let text = LIST_ITEM.replace_all(&text, "\n  • ");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    BLANK_LINES.replace_all(text.trim(), "\n").into_owned()
}
