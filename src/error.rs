//! Crate-level error enums.
//!
//! None of these ever reach an HTTP caller as a 5xx: provider and spreadsheet
//! errors are recovered inside the orchestrator and the audit logger, and
//! startup errors put the affected integration into its disabled state.

use thiserror::Error;

/// Problems found while building the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("credentials file not found: {0}")]
    CredentialsMissing(String),
    #[error("credentials file {path} is not a service-account key: {detail}")]
    CredentialsInvalid { path: String, detail: String },
    #[error("SHEET_URL not set")]
    SheetUrlMissing,
    #[error("could not find a spreadsheet id in {0}")]
    SheetUrlInvalid(String),
    #[error("invalid origin regex {pattern}: {detail}")]
    OriginRegex { pattern: String, detail: String },
    #[error("could not read persona file {path}: {detail}")]
    PersonaFile { path: String, detail: String },
    #[error("unknown persona '{0}'")]
    UnknownPersona(String),
}

/// Failures of the completion provider. All of them end in the apology reply.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion provider disabled: {0}")]
    Disabled(String),
    #[error("request to {provider} failed: {detail}")]
    Transport { provider: String, detail: String },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} response could not be parsed: {detail}")]
    Decode { provider: String, detail: String },
    #[error("{0} returned an empty completion")]
    Empty(String),
    #[error("completion timed out after {0}s")]
    Timeout(u64),
}

/// Failures of the spreadsheet append path.
#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("spreadsheet logging disabled")]
    Disabled,
    #[error("could not sign token assertion: {0}")]
    Signing(String),
    #[error("token exchange failed: {0}")]
    Token(String),
    #[error("append request failed: {0}")]
    Transport(String),
    #[error("Sheets API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Request validation failures for a chat turn. These map to HTTP 400.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("missing required field 'message' in request body")]
    MissingMessage,
    #[error("missing required field 'bot' in request body")]
    MissingBot,
}
