//! Shared state handed to every handler, and the startup wiring that builds it.
//!
//! Integration problems found here (no spreadsheet URL, unreadable key file,
//! missing API key, unknown persona) are logged and the affected part runs in
//! its disabled or default state. Nothing in this module aborts startup.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditLogger, SheetsStatus};
use crate::cli::Args;
use crate::completion::{CompletionParams, CompletionProvider, HttpCompletionClient, ProviderStatus};
use crate::conversation::InMemoryConversationStore;
use crate::orchestrator::ChatOrchestrator;
use crate::persona::{Persona, PersonaSet, DEFAULT_PERSONA};
use crate::sheets::SheetsClient;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            static_dir: static_dir.into(),
        }
    }

    pub async fn from_args(args: &Args) -> Self {
        let persona = select_persona(args);
        let sheets = connect_sheets(args).await;

        let params = CompletionParams::new(args.resolved_model()).with_timeout(args.llm_timeout());
        let client = HttpCompletionClient::new(args.provider, args.api_key(), params);
        match client.status() {
            ProviderStatus::Ready => {
                info!(provider = %args.provider, model = %client.params().model, "completion provider ready")
            }
            ProviderStatus::Disabled(reason) => {
                warn!(provider = %args.provider, %reason, "completion provider disabled, every reply will be the apology")
            }
        }

        let audit = Arc::new(AuditLogger::new(sheets, &args.fallback_log, &persona));
        let orchestrator = ChatOrchestrator::new(
            persona,
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(client),
            audit,
            args.llm_timeout(),
        );
        Self::new(Arc::new(orchestrator), &args.static_dir)
    }
}

fn select_persona(args: &Args) -> Persona {
    let mut personas = PersonaSet::builtin();
    if let Some(path) = &args.personas_file {
        match personas.merge_file(path) {
            Ok(n) => info!(path = %path.display(), count = n, "loaded personas"),
            Err(e) => warn!(error = %e, "persona file ignored"),
        }
    }
    match personas.select(&args.persona) {
        Ok(persona) => persona,
        Err(e) => {
            let known: Vec<&str> = personas.names().collect();
            warn!(error = %e, ?known, fallback = DEFAULT_PERSONA, "using default persona");
            Persona::crt_context_gated()
        }
    }
}

async fn connect_sheets(args: &Args) -> SheetsStatus {
    let client = match SheetsClient::from_config(
        &args.google_creds_file,
        args.sheet_url.as_deref(),
        &args.worksheet,
    ) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "spreadsheet logging disabled");
            return SheetsStatus::Disabled(e.to_string());
        }
    };

    if !args.skip_sheet_check {
        if let Err(e) = client.verify().await {
            warn!(error = %e, worksheet = %client.worksheet(), "spreadsheet check failed, logging disabled");
            return SheetsStatus::Disabled(e.to_string());
        }
    }
    info!(
        spreadsheet = %client.spreadsheet_id(),
        worksheet = %client.worksheet(),
        "spreadsheet logging enabled"
    );
    SheetsStatus::Enabled(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "study-chat-server",
            "--google-creds-file",
            "/nonexistent/creds.json",
            "--sheet-url",
            "https://docs.google.com/spreadsheets/d/abc/edit",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_unknown_persona_falls_back_to_default() {
        let persona = select_persona(&args(&["--persona", "no-such-arm"]));
        assert_eq!(persona.name, DEFAULT_PERSONA);
    }

    #[test]
    fn test_named_persona_selected() {
        let persona = select_persona(&args(&["--persona", "crt-intuitive"]));
        assert!(!persona.retain_history);
    }

    #[tokio::test]
    async fn test_missing_credentials_disable_sheets() {
        let status = connect_sheets(&args(&[])).await;
        assert!(matches!(status, SheetsStatus::Disabled(ref r) if r.contains("/nonexistent/creds.json")));
    }

    #[tokio::test]
    async fn test_from_args_degrades_instead_of_failing() {
        let state = AppState::from_args(&args(&["--static-dir", "/nonexistent/static"])).await;
        assert!(!state.orchestrator.audit().is_enabled());
        assert_eq!(state.static_dir, PathBuf::from("/nonexistent/static"));
    }
}
