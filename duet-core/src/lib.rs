use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_MESSAGE_BYTES: usize = 4 * 1024;
pub const MAX_NICKNAME_LEN: usize = 64;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

/// Message returned by the gateway when a 401 tears the session down.
pub const SESSION_EXPIRED_MESSAGE: &str = "session expired";
/// Message returned by the gateway when the transport itself failed.
pub const NETWORK_ERROR_MESSAGE: &str = "network error";

pub type UserId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub phone: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub binding_code: Option<String>,
    #[serde(default)]
    pub partner_id: Option<UserId>,
    #[serde(default)]
    pub has_partner: bool,
}

impl UserProfile {
    /// Display name used when sending lounge messages.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(self.phone.as_str())
    }
}

/// Authenticated session snapshot. Token present means authenticated; the
/// profile may lag behind transiently (e.g. right after login, before the
/// first profile refresh).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// The uniform response envelope every backend endpoint returns.
///
/// `token` and `user` only appear at the top level for the auth endpoints;
/// everything else carries its payload in `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    // No `default` attribute here: it would force a `T: Default` bound on
    // the derived impl, and a missing optional field decodes to None anyway.
    pub data: Option<T>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub token: Option<String>,
}

impl<T> Envelope<T> {
    /// Synthetic failure outcome the gateway hands back in place of a thrown
    /// error. Callers never observe a transport-level Result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            user: None,
            token: None,
        }
    }

    #[must_use]
    pub fn message_or(&self, fallback: &str) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| fallback.to_owned())
    }
}

/// Server-assigned vs client-local message identity.
///
/// Provisional ids exist only for optimistic display of a just-sent coach
/// message; they are never sent to the backend and never enter cursor
/// arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Provisional(u64),
    Confirmed(u64),
}

impl MessageId {
    #[must_use]
    pub fn confirmed(self) -> Option<u64> {
        match self {
            MessageId::Confirmed(id) => Some(id),
            MessageId::Provisional(_) => None,
        }
    }

    /// Ordering key: confirmed entries sort by server id, provisional ones
    /// always sort after every confirmed entry.
    fn sort_key(self) -> (u64, u64) {
        match self {
            MessageId::Confirmed(id) => (0, id),
            MessageId::Provisional(local) => (1, local),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageId::Confirmed(id) | MessageId::Provisional(id) => {
                serializer.serialize_u64(*id)
            }
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Anything that arrives over the wire was assigned by the server.
        Ok(MessageId::Confirmed(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoungeMessage {
    pub id: u64,
    pub user_id: UserId,
    pub nickname: String,
    pub message: String,
    pub created_at: String,
    #[serde(default)]
    pub is_ai: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoachMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// `data` payload of `/api/coach/chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoachReply {
    pub reply: String,
}

/// `data` payload of `/api/coach/history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoachHistory {
    pub messages: Vec<CoachMessage>,
}

/// `data` payload of `/api/lounge/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoungeBatch {
    pub messages: Vec<LoungeMessage>,
}

/// `data` payload of `/api/bindcode/generate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingCode {
    pub binding_code: String,
}

/// Anything that lives in a [`ConversationLog`].
pub trait Sequenced {
    fn id(&self) -> MessageId;
}

impl Sequenced for LoungeMessage {
    fn id(&self) -> MessageId {
        MessageId::Confirmed(self.id)
    }
}

impl Sequenced for CoachMessage {
    fn id(&self) -> MessageId {
        self.id
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    MessageTooLarge,
    #[error("nickname exceeds {MAX_NICKNAME_LEN} characters")]
    NicknameTooLong,
}

/// Validates outgoing chat text before any request is issued.
///
/// Returns the trimmed text; validation failures never reach the gateway.
pub fn validate_outgoing_message(text: &str) -> Result<&str, CoreError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CoreError::EmptyMessage);
    }
    if trimmed.len() > MAX_MESSAGE_BYTES {
        return Err(CoreError::MessageTooLarge);
    }
    Ok(trimmed)
}

/// Validates the display name attached to lounge messages.
pub fn validate_nickname(name: &str) -> Result<&str, CoreError> {
    let trimmed = name.trim();
    if trimmed.chars().count() > MAX_NICKNAME_LEN {
        return Err(CoreError::NicknameTooLong);
    }
    Ok(trimmed)
}

/// Ordered, deduplicated message log for one conversation context.
///
/// The log is append-only from the client's perspective: confirmed entries
/// are kept in ascending server-id order with each id present exactly once,
/// and the cursor tracks the highest confirmed id observed. Provisional
/// entries sit at the tail and never move the cursor.
#[derive(Debug, Clone)]
pub struct ConversationLog<T: Sequenced> {
    entries: Vec<T>,
    cursor: Option<u64>,
}

impl<T: Sequenced> Default for ConversationLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sequenced> ConversationLog<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: None,
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Highest confirmed id observed; the `last_id` lower bound for the next
    /// incremental fetch.
    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }

    /// Wholesale replacement from a full fetch. The cursor is set to the
    /// maximum id in the batch; an empty batch leaves it unchanged.
    pub fn replace_all(&mut self, batch: Vec<T>) {
        self.entries.clear();
        let mut max_id = None;
        for entry in batch {
            if let Some(id) = entry.id().confirmed() {
                if self.contains_confirmed(id) {
                    continue;
                }
                max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
            }
            let key = entry.id().sort_key();
            let pos = self.entries.partition_point(|e| e.id().sort_key() <= key);
            self.entries.insert(pos, entry);
        }
        if max_id.is_some() {
            self.cursor = max_id;
        }
    }

    /// Merges an incremental fetch batch. Confirmed ids already present are
    /// dropped, which makes the merge idempotent under at-least-once delivery
    /// and order-independent across interleavings. Returns the number of
    /// entries actually appended.
    pub fn merge(&mut self, batch: Vec<T>) -> usize {
        let mut appended = 0;
        for entry in batch {
            let Some(id) = entry.id().confirmed() else {
                continue;
            };
            if self.contains_confirmed(id) {
                continue;
            }
            let key = entry.id().sort_key();
            let pos = self.entries.partition_point(|e| e.id().sort_key() <= key);
            self.entries.insert(pos, entry);
            self.cursor = Some(self.cursor.map_or(id, |c| c.max(id)));
            appended += 1;
        }
        appended
    }

    /// Appends an optimistic local entry. Provisional entries are display
    /// padding only: they never affect the cursor and a later full reload
    /// replaces them with whatever the server persisted.
    pub fn push_provisional(&mut self, entry: T) {
        debug_assert!(entry.id().confirmed().is_none());
        self.entries.push(entry);
    }

    fn contains_confirmed(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id().confirmed() == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lounge(id: u64) -> LoungeMessage {
        LoungeMessage {
            id,
            user_id: 1,
            nickname: "mei".to_owned(),
            message: format!("message {id}"),
            created_at: "2025-06-01T10:00:00Z".to_owned(),
            is_ai: false,
        }
    }

    fn coach_provisional(local: u64, content: &str) -> CoachMessage {
        CoachMessage {
            id: MessageId::Provisional(local),
            role: Role::User,
            content: content.to_owned(),
            created_at: "2025-06-01T10:00:00Z".to_owned(),
        }
    }

    fn ids(log: &ConversationLog<LoungeMessage>) -> Vec<u64> {
        log.entries().iter().map(|m| m.id).collect()
    }

    #[test]
    fn merge_is_idempotent_and_sorted_across_interleavings() {
        let batches = [
            vec![lounge(3), lounge(5)],
            vec![lounge(1), lounge(3)],
            vec![lounge(5), lounge(2)],
        ];

        // Any interleaving of possibly-overlapping batches must yield each
        // distinct id exactly once, in ascending order.
        let orderings: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![2, 1, 0],
            vec![1, 0, 2],
            vec![0, 0, 1, 2, 2],
        ];
        for order in orderings {
            let mut log = ConversationLog::new();
            for index in order {
                log.merge(batches[index].clone());
            }
            assert_eq!(ids(&log), vec![1, 2, 3, 5]);
            assert_eq!(log.cursor(), Some(5));
        }
    }

    #[test]
    fn cursor_is_monotonic_and_tracks_max_id() {
        let mut log = ConversationLog::new();
        log.merge(vec![lounge(4)]);
        assert_eq!(log.cursor(), Some(4));

        // A stale batch never moves the cursor backwards.
        log.merge(vec![lounge(2)]);
        assert_eq!(log.cursor(), Some(4));

        log.merge(vec![lounge(9)]);
        assert_eq!(log.cursor(), Some(9));
        assert_eq!(ids(&log), vec![2, 4, 9]);
    }

    #[test]
    fn duplicate_in_poll_batch_is_dropped() {
        let mut log = ConversationLog::new();
        log.merge(vec![lounge(6)]);

        let appended = log.merge(vec![lounge(6), lounge(7)]);
        assert_eq!(appended, 1);
        assert_eq!(ids(&log), vec![6, 7]);
        assert_eq!(log.cursor(), Some(7));
    }

    #[test]
    fn replace_all_resets_log_and_sets_cursor() {
        let mut log = ConversationLog::new();
        log.merge(vec![lounge(1), lounge(2)]);

        log.replace_all(vec![lounge(10), lounge(8)]);
        assert_eq!(ids(&log), vec![8, 10]);
        assert_eq!(log.cursor(), Some(10));
    }

    #[test]
    fn replace_all_with_empty_batch_keeps_cursor() {
        let mut log = ConversationLog::new();
        log.merge(vec![lounge(5)]);

        log.replace_all(Vec::new());
        assert!(log.is_empty());
        assert_eq!(log.cursor(), Some(5));
    }

    #[test]
    fn provisional_entries_sort_after_confirmed_and_skip_cursor() {
        let mut log: ConversationLog<CoachMessage> = ConversationLog::new();
        log.merge(vec![CoachMessage {
            id: MessageId::Confirmed(12),
            role: Role::Assistant,
            content: "hello".to_owned(),
            created_at: "2025-06-01T10:00:00Z".to_owned(),
        }]);
        log.push_provisional(coach_provisional(1, "just sent"));

        assert_eq!(log.cursor(), Some(12));
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].id, MessageId::Provisional(1));
    }

    #[test]
    fn wire_message_id_deserializes_as_confirmed() {
        let msg: CoachMessage = serde_json::from_str(
            r#"{"id": 7, "role": "assistant", "content": "hi", "created_at": "2025-06-01T10:00:00Z"}"#,
        )
        .expect("decode coach message");
        assert_eq!(msg.id, MessageId::Confirmed(7));
    }

    #[test]
    fn envelope_decodes_with_sparse_fields() {
        let env: Envelope<LoungeBatch> =
            serde_json::from_str(r#"{"success": true}"#).expect("decode envelope");
        assert!(env.success);
        assert!(env.data.is_none());
        assert_eq!(env.message_or("fallback"), "fallback");
    }

    #[test]
    fn validate_rejects_empty_and_oversized_messages() {
        assert!(matches!(
            validate_outgoing_message("   "),
            Err(CoreError::EmptyMessage)
        ));
        let big = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert!(matches!(
            validate_outgoing_message(&big),
            Err(CoreError::MessageTooLarge)
        ));
        assert_eq!(validate_outgoing_message("  hi  ").unwrap(), "hi");
    }

    #[test]
    fn validate_nickname_bounds_length_in_characters() {
        let long = "名".repeat(MAX_NICKNAME_LEN + 1);
        assert!(matches!(
            validate_nickname(&long),
            Err(CoreError::NicknameTooLong)
        ));
        assert_eq!(validate_nickname(" mei ").unwrap(), "mei");
    }
}
