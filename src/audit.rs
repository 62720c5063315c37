//! Turn logging: spreadsheet first, local file when that fails.
//!
//! [`AuditLogger::record`] never returns an error. What happened to the record
//! is reported as an [`AuditOutcome`] so callers like the log-test probe can
//! tell a healthy spreadsheet from a fallback write.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::persona::{Persona, RowSchema};
use crate::sheets::RowSink;

pub const FALLBACK_LOG_FILE: &str = "chat_log_fallback.txt";

/// Local time, second precision, e.g. `2026-10-17T14:03:59`.
pub fn now_local() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// `\\`, `\n` and `\r` become two-character escapes so a field never spans lines.
fn escape_line_breaks(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// One logged event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub participant_id: String,
    pub bot_id: String,
    pub arm_label: String,
    pub role: String,
    pub content: String,
}

impl LogRecord {
    pub fn new(
        participant_id: impl Into<String>,
        bot_id: impl Into<String>,
        arm_label: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_local(),
            participant_id: participant_id.into(),
            bot_id: bot_id.into(),
            arm_label: arm_label.into(),
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn to_row(&self, schema: RowSchema) -> Vec<String> {
        let mut row = vec![self.timestamp.clone(), self.participant_id.clone()];
        if schema == RowSchema::Full {
            row.push(self.bot_id.clone());
        }
        row.extend([
            self.arm_label.clone(),
            self.role.clone(),
            self.content.clone(),
        ]);
        row
    }

    /// The fallback file always uses the six-field order, one record per line.
    pub fn to_fallback_line(&self) -> String {
        self.to_row(RowSchema::Full)
            .iter()
            .map(String::as_str)
            .map(escape_line_breaks)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Whether the spreadsheet integration is available.
#[derive(Clone)]
pub enum SheetsStatus {
    Enabled(Arc<dyn RowSink>),
    Disabled(String),
}

impl std::fmt::Debug for SheetsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetsStatus::Enabled(_) => f.write_str("Enabled"),
            SheetsStatus::Disabled(reason) => write!(f, "Disabled({reason})"),
        }
    }
}

/// Where a record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Remote,
    Fallback { reason: String },
    /// Both the spreadsheet and the fallback file failed.
    Dropped { reason: String },
    Disabled,
}

impl AuditOutcome {
    pub fn is_remote(&self) -> bool {
        matches!(self, AuditOutcome::Remote)
    }
}

pub struct AuditLogger {
    sheets: SheetsStatus,
    fallback_path: PathBuf,
    arm_label: String,
    schema: RowSchema,
}

impl AuditLogger {
    pub fn new(sheets: SheetsStatus, fallback_path: impl Into<PathBuf>, persona: &Persona) -> Self {
        Self {
            sheets,
            fallback_path: fallback_path.into(),
            arm_label: persona.arm_label.clone(),
            schema: persona.row_schema,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.sheets, SheetsStatus::Enabled(_))
    }

    /// Log one event under this logger's arm label.
    pub async fn record(&self, participant_id: &str, bot_id: &str, role: &str, content: &str) -> AuditOutcome {
        let record = LogRecord::new(participant_id, bot_id, self.arm_label.as_str(), role, content);
        self.record_entry(&record).await
    }

    pub async fn record_entry(&self, record: &LogRecord) -> AuditOutcome {
        let sink = match &self.sheets {
            SheetsStatus::Enabled(sink) => sink,
            SheetsStatus::Disabled(reason) => {
                debug!(%reason, role = %record.role, "spreadsheet disabled, skipping log record");
                return AuditOutcome::Disabled;
            }
        };

        let err = match sink.append_row(record.to_row(self.schema)).await {
            Ok(()) => return AuditOutcome::Remote,
            Err(e) => e,
        };
        warn!(error = %err, path = %self.fallback_path.display(), "spreadsheet append failed, writing fallback line");

        match self.write_fallback(record).await {
            Ok(()) => AuditOutcome::Fallback {
                reason: err.to_string(),
            },
            Err(io_err) => {
                error!(
                    error = %io_err,
                    sheets_error = %err,
                    path = %self.fallback_path.display(),
                    "fallback log write failed, record dropped"
                );
                AuditOutcome::Dropped {
                    reason: format!("{err}; fallback: {io_err}"),
                }
            }
        }
    }

    async fn write_fallback(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_path)
            .await?;
        let mut line = record.to_fallback_line();
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
