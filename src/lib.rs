//! Chat backend for LLM persona studies.
//!
//! Participants talk to a bot persona through a small JSON API. Each turn goes
//! to an OpenAI or Anthropic model with the persona's system prompt and a short
//! per-(participant, bot) history, and both sides of the turn are appended to a
//! Google Sheets worksheet, with a local file taking over when the append fails.

pub mod audit;
pub mod cli;
pub mod completion;
pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod persona;
pub mod providers;
pub mod sheets;
pub mod state;
pub mod web;

pub use audit::{AuditLogger, AuditOutcome, LogRecord, SheetsStatus};
pub use completion::{CompletionProvider, HttpCompletionClient, ProviderStatus, APOLOGY_REPLY};
pub use conversation::{ConversationStore, InMemoryConversationStore, Message, Role};
pub use orchestrator::{ChatOrchestrator, ChatReply, ChatTurn, SessionInfo};
pub use persona::{Persona, PersonaSet, RowSchema};
pub use state::AppState;
