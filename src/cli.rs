use crate::audit::FALLBACK_LOG_FILE;
use crate::persona::DEFAULT_PERSONA;
use crate::providers::{resolve_model, Provider};
use crate::sheets::DEFAULT_WORKSHEET;
use crate::web::DEFAULT_ORIGIN_REGEX;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Every option can also come from the environment (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(name = "study-chat-server")]
#[command(version)]
#[command(about = "Chat backend for LLM persona studies with spreadsheet turn logging")]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Service-account key used for the spreadsheet
    #[arg(long, env = "GOOGLE_CREDS_FILE", default_value = "service_account.json")]
    pub google_creds_file: PathBuf,

    /// Spreadsheet URL; logging is disabled without it
    #[arg(long, env = "SHEET_URL")]
    pub sheet_url: Option<String>,

    /// Worksheet (tab) that receives the rows
    #[arg(long, env = "SHEET_WORKSHEET", default_value = DEFAULT_WORKSHEET)]
    pub worksheet: String,

    /// Skip the spreadsheet reachability check at startup
    #[arg(long)]
    pub skip_sheet_check: bool,

    /// One extra exact origin allowed by CORS (e.g. a tunnel URL)
    #[arg(long, env = "ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// Regex for additional allowed origins
    #[arg(long, env = "ALLOW_ORIGIN_REGEX", default_value = DEFAULT_ORIGIN_REGEX)]
    pub allow_origin_regex: String,

    /// LLM provider: openai or anthropic
    #[arg(long, env = "LLM_PROVIDER", value_enum, default_value = "openai")]
    pub provider: Provider,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Model name; defaults per provider
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    /// Upper bound for one completion call, in seconds
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value = "30")]
    pub llm_timeout_secs: u64,

    /// Study condition to run
    #[arg(long, env = "PERSONA", default_value = DEFAULT_PERSONA)]
    pub persona: String,

    /// TOML file with extra `[[persona]]` entries
    #[arg(long, env = "PERSONAS_FILE")]
    pub personas_file: Option<PathBuf>,

    /// Directory served under /static (and /index.html for /)
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// File that receives log lines when the spreadsheet append fails
    #[arg(long, env = "FALLBACK_LOG", default_value = FALLBACK_LOG_FILE)]
    pub fallback_log: PathBuf,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key for the selected provider.
    pub fn api_key(&self) -> Option<String> {
        match self.provider {
            Provider::Openai => self.openai_api_key.clone(),
            Provider::Anthropic => self.anthropic_api_key.clone(),
        }
    }

    pub fn resolved_model(&self) -> String {
        resolve_model(&self.provider, self.model.as_deref())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs.max(1))
    }
}
