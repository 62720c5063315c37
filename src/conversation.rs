//! Short-term conversation history keyed by (participant, bot).
//!
//! ## Design
//! - `InMemoryConversationStore`: `Mutex<HashMap<ConversationKey, Slot>>`, where
//!   each slot is an `Arc<tokio::sync::Mutex<ConversationHistory>>`
//! - The outer lock is only held to find or insert a slot; the per-key lock is
//!   held by a chat turn from the user append until the reply append, so two
//!   turns for the same key run one after the other
//! - Each history keeps at most `HISTORY_LIMIT` messages, oldest dropped first
//!
//! ## Lifecycle
//! Entries are created on first use and live until the process exits. There is
//! no per-key removal, so the number of keys grows with the number of distinct
//! participants.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Maximum number of messages retained per conversation.
pub const HISTORY_LIMIT: usize = 10;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Identifies one ongoing exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub participant_id: String,
    pub bot_id: String,
}

impl ConversationKey {
    pub fn new(participant_id: impl Into<String>, bot_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            bot_id: bot_id.into(),
        }
    }
}

/// Ordered messages, oldest first, never longer than [`HISTORY_LIMIT`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    messages: VecDeque<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`, then drop from the front until the bound holds.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > HISTORY_LIMIT {
            self.messages.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }
}

/// Exclusive access to one key's history. Dropping it releases the key.
pub type ConversationGuard = OwnedMutexGuard<ConversationHistory>;

/// Storage for conversation histories.
///
/// Implementations must give [`checkout`](Self::checkout) callers exclusive
/// access per key while letting different keys proceed independently.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Lock the history for `key`, creating an empty one if absent.
    async fn checkout(&self, key: &ConversationKey) -> ConversationGuard;

    /// Number of keys currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the history for `key`, creating an empty entry if absent.
    async fn get_or_create(&self, key: &ConversationKey) -> ConversationHistory {
        self.checkout(key).await.clone()
    }

    /// Append one message under the key's lock.
    async fn append(&self, key: &ConversationKey, message: Message) {
        self.checkout(key).await.push(message);
    }
}

type Slot = Arc<AsyncMutex<ConversationHistory>>;

/// Process-local store. Share it behind an `Arc`.
#[derive(Default)]
pub struct InMemoryConversationStore {
    slots: Mutex<HashMap<ConversationKey, Slot>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ConversationKey) -> Slot {
        // A panic while holding the map lock cannot leave a slot half-built,
        // so a poisoned map is still usable.
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn checkout(&self, key: &ConversationKey) -> ConversationGuard {
        self.slot(key).lock_owned().await
    }

    fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or_else(|p| p.into_inner().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn key(p: &str, b: &str) -> ConversationKey {
        ConversationKey::new(p, b)
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).expect("serialize");
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_history_push_under_limit_keeps_all() {
        let mut h = ConversationHistory::new();
        for i in 0..HISTORY_LIMIT {
            h.push(Message::user(format!("m{i}")));
        }
        assert_eq!(h.len(), HISTORY_LIMIT);
        assert_eq!(h.iter().next().map(|m| m.content.as_str()), Some("m0"));
    }

    #[test]
    fn test_history_push_over_limit_drops_oldest() {
        let mut h = ConversationHistory::new();
        for i in 0..13 {
            h.push(Message::user(format!("m{i}")));
        }
        let contents: Vec<String> = h.iter().map(|m| m.content.clone()).collect();
        let expected: Vec<String> = (3..13).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
        assert_eq!(h.last().map(|m| m.content.as_str()), Some("m12"));
    }

    #[tokio::test]
    async fn test_get_or_create_creates_empty_entry() {
        let store = InMemoryConversationStore::new();
        assert!(store.is_empty());
        let h = store.get_or_create(&key("P1", "LongBot1")).await;
        assert!(h.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_append_is_scoped_to_key() {
        let store = InMemoryConversationStore::new();
        store.append(&key("P1", "LongBot1"), Message::user("a")).await;
        store.append(&key("P1", "LongBot2"), Message::user("b")).await;
        store.append(&key("P2", "LongBot1"), Message::user("c")).await;

        let h = store.get_or_create(&key("P1", "LongBot1")).await;
        assert_eq!(h.to_vec(), vec![Message::user("a")]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_append_enforces_limit() {
        let store = InMemoryConversationStore::new();
        let k = key("P1", "LongBot3");
        for i in 0..25 {
            store.append(&k, Message::user(i.to_string())).await;
        }
        let h = store.get_or_create(&k).await;
        assert_eq!(h.len(), HISTORY_LIMIT);
        assert_eq!(h.iter().next().map(|m| m.content.as_str()), Some("15"));
    }

    #[tokio::test]
    async fn test_checkout_serializes_same_key() {
        let store = Arc::new(InMemoryConversationStore::new());
        let k = key("P1", "LongBot1");
        let guard = store.checkout(&k).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.checkout(&k)).await;
        assert!(blocked.is_err(), "second checkout of the same key must wait");

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            store.checkout(&key("P2", "LongBot1")),
        )
        .await;
        assert!(other.is_ok(), "other keys must not be blocked");

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(50), store.checkout(&k)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_turns_do_not_lose_updates() {
        let store = Arc::new(InMemoryConversationStore::new());
        let k = key("P1", "LongBot1");
        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = store.checkout(&k).await;
                guard.push(Message::user(format!("q{i}")));
                tokio::task::yield_now().await;
                guard.push(Message::assistant(format!("a{i}")));
            }));
        }
        for h in handles {
            h.await.expect("task panicked");
        }
        let h = store.get_or_create(&k).await;
        assert_eq!(h.len(), 8);
        // Every question is immediately followed by its own answer.
        let msgs = h.to_vec();
        for pair in msgs.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].content[1..], pair[0].content[1..]);
        }
    }

    proptest! {
        #[test]
        fn prop_history_keeps_most_recent_in_order(n in 0usize..60) {
            let mut h = ConversationHistory::new();
            for i in 0..n {
                h.push(Message::user(i.to_string()));
            }
            prop_assert_eq!(h.len(), n.min(HISTORY_LIMIT));
            let kept: Vec<usize> = h.iter().map(|m| m.content.parse().unwrap()).collect();
            let expected: Vec<usize> = (n.saturating_sub(HISTORY_LIMIT)..n).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
