//! One chat turn, end to end: validate, resolve the bot, update history, call
//! the provider, log both sides.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::completion::{CompletionProvider, APOLOGY_REPLY};
use crate::conversation::{ConversationKey, ConversationStore, Message};
use crate::error::{ChatError, CompletionError};
use crate::persona::{BotResolution, Persona};

/// Participant id used when the request carries none.
pub const NO_PID: &str = "NO_PID";
/// Bot id used by `/api/session` when no selector is given.
pub const UNKNOWN_BOT: &str = "UnknownBot";

/// Raw turn fields as extracted from the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatTurn {
    pub participant_id: Option<String>,
    pub bot: Option<String>,
    pub message: Option<String>,
}

/// A turn that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTurn {
    pub participant_id: String,
    pub bot_selector: String,
    pub message: String,
}

impl ChatTurn {
    pub fn validate(self) -> Result<ValidatedTurn, ChatError> {
        let message = self
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or(ChatError::MissingMessage)?;
        let bot_selector = self
            .bot
            .filter(|b| !b.trim().is_empty())
            .ok_or(ChatError::MissingBot)?;
        let participant_id = self
            .participant_id
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| NO_PID.to_string());
        Ok(ValidatedTurn {
            participant_id,
            bot_selector,
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub reply: String,
    /// `participant:bot:unix-seconds`; unrelated to `/api/session` ids.
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub prolific_pid: String,
    pub bot_id: String,
}

/// Random opaque id: the first 16 decimal digits of a v4 UUID.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4()
        .as_u128()
        .to_string()
        .chars()
        .take(16)
        .collect()
}

pub fn session_label(participant_id: &str, bot_id: &str) -> String {
    format!("{participant_id}:{bot_id}:{}", chrono::Utc::now().timestamp())
}

pub struct ChatOrchestrator {
    persona: Persona,
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn CompletionProvider>,
    audit: Arc<AuditLogger>,
    timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        persona: Persona,
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn CompletionProvider>,
        audit: Arc<AuditLogger>,
        timeout: Duration,
    ) -> Self {
        Self {
            persona,
            store,
            provider,
            audit,
            timeout,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Map a selector through the persona's bot table, warning on misses.
    pub fn resolve_bot(&self, selector: &str) -> BotResolution {
        let resolution = self.persona.resolve_bot(selector);
        if let BotResolution::PassedThrough(id) = &resolution {
            warn!(selector = %id, persona = %self.persona.name, "bot selector not in table, using it verbatim");
        }
        resolution
    }

    /// Issue a session id and log its creation.
    pub async fn open_session(&self, participant_id: Option<&str>, bot: Option<&str>) -> SessionInfo {
        let participant_id = participant_id
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(NO_PID)
            .to_string();
        let bot_id = match bot.map(str::trim).filter(|b| !b.is_empty()) {
            Some(selector) => self.resolve_bot(selector).into_bot_id(),
            None => UNKNOWN_BOT.to_string(),
        };
        let session_id = generate_session_id();

        self.audit
            .record(&participant_id, &bot_id, "session", &format!("session_created:{session_id}"))
            .await;
        info!(%session_id, participant = %participant_id, bot = %bot_id, "session created");

        SessionInfo {
            session_id,
            prolific_pid: participant_id,
            bot_id,
        }
    }

    /// Run one turn. Only validation failures are returned as errors.
    pub async fn chat(&self, turn: ChatTurn) -> Result<ChatReply, ChatError> {
        let turn = turn.validate()?;
        let bot_id = self.resolve_bot(&turn.bot_selector).into_bot_id();

        let reply = if self.persona.retain_history {
            let key = ConversationKey::new(turn.participant_id.as_str(), bot_id.as_str());
            // Held until the reply is stored, so turns for one key never interleave.
            let mut history = self.store.checkout(&key).await;
            history.push(Message::user(turn.message.as_str()));
            self.audit
                .record(&turn.participant_id, &bot_id, "user", &turn.message)
                .await;

            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(Message::system(self.persona.system_prompt.as_str()));
            messages.extend(history.iter().cloned());

            let reply = self.generate(&messages).await;
            history.push(Message::assistant(reply.as_str()));
            reply
        } else {
            self.audit
                .record(&turn.participant_id, &bot_id, "user", &turn.message)
                .await;
            let messages = [
                Message::system(self.persona.system_prompt.as_str()),
                Message::user(turn.message.as_str()),
            ];
            self.generate(&messages).await
        };

        self.audit
            .record(&turn.participant_id, &bot_id, "assistant", &reply)
            .await;

        Ok(ChatReply {
            session_id: session_label(&turn.participant_id, &bot_id),
            reply,
        })
    }

    /// Provider reply, or the apology string on any failure or timeout.
    async fn generate(&self, messages: &[Message]) -> String {
        let result = match tokio::time::timeout(self.timeout, self.provider.complete(messages)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(self.timeout.as_secs())),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "completion failed, sending apology reply");
                APOLOGY_REPLY.to_string()
            }
        }
    }
}
