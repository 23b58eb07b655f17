use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use duet_core::{
    CoachHistory, CoachMessage, CoachReply, ConversationLog, Envelope, LoungeBatch,
    LoungeMessage, MessageId, Role, validate_nickname, validate_outgoing_message,
};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::gateway::RequestGateway;

const LOUNGE_MESSAGES_PATH: &str = "/api/lounge/messages";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Invalid(#[from] duet_core::CoreError),
    #[error("{0}")]
    Request(String),
}

/// Lifecycle of one conversation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading,
    Synced,
    Polling,
    Stopped,
}

/// Shared-room sync engine: initial full fetch, periodic incremental
/// fetches keyed by the log cursor, dedup merge, and an owned poll task.
///
/// The log lives behind an `Arc<Mutex<…>>` shared with the poll task;
/// `send` may overlap an in-flight tick and the merge-by-id rule makes the
/// outcome order-independent.
pub struct LoungeSync {
    gateway: Arc<RequestGateway>,
    log: Arc<Mutex<ConversationLog<LoungeMessage>>>,
    polling: Arc<AtomicBool>,
    poll_task: Option<JoinHandle<()>>,
    state: SyncState,
}

impl LoungeSync {
    #[must_use]
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self {
            gateway,
            log: Arc::new(Mutex::new(ConversationLog::new())),
            polling: Arc::new(AtomicBool::new(false)),
            poll_task: None,
            state: SyncState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Snapshot of the current log, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<LoungeMessage> {
        self.log
            .lock()
            .map(|log| log.entries().to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.log.lock().ok().and_then(|log| log.cursor())
    }

    /// Initial (or forced) full fetch; replaces the log wholesale. On
    /// failure the prior state is restored and the gateway's message is
    /// returned once to the caller.
    pub async fn load(&mut self) -> Result<(), SyncError> {
        let prior = self.state;
        self.state = SyncState::Loading;

        let envelope: Envelope<LoungeBatch> = self.gateway.get(LOUNGE_MESSAGES_PATH, &[]).await;
        if !envelope.success {
            self.state = prior;
            return Err(SyncError::Request(envelope.message_or("load failed")));
        }

        let batch = envelope.data.map(|d| d.messages).unwrap_or_default();
        if let Ok(mut log) = self.log.lock() {
            log.replace_all(batch);
        }
        self.state = if prior == SyncState::Polling {
            SyncState::Polling
        } else {
            SyncState::Synced
        };
        Ok(())
    }

    /// Arms the poll timer. Only valid once a log has been loaded; at most
    /// one timer exists per context, so calling this while already polling
    /// (or before a successful [`load`](Self::load)) is a no-op.
    pub fn start_polling(&mut self, interval: Duration) {
        if self.poll_task.is_some() || self.state != SyncState::Synced {
            return;
        }
        self.polling.store(true, Ordering::SeqCst);

        let gateway = Arc::clone(&self.gateway);
        let log = Arc::clone(&self.log);
        let polling = Arc::clone(&self.polling);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // interval fires immediately; skip that tick
            while polling.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !polling.load(Ordering::SeqCst) {
                    break;
                }
                fetch_after_cursor(&gateway, &log, Some(&polling), true).await;
            }
            debug!("lounge poll task exiting");
        });

        self.poll_task = Some(handle);
        self.state = SyncState::Polling;
        info!(interval_ms = interval.as_millis() as u64, "lounge polling started");
    }

    /// Disarms the timer. An already in-flight tick fetch is not cancelled;
    /// its result is discarded by the still-polling guard before any merge.
    pub fn stop_polling(&mut self) {
        self.polling.store(false, Ordering::SeqCst);
        if self.poll_task.take().is_some() {
            self.state = SyncState::Stopped;
            info!("lounge polling stopped");
        }
    }

    /// Posts a message, then performs one forced incremental fetch so the
    /// sender sees their own message (and any partner/assistant reply)
    /// without waiting out the poll interval.
    pub async fn send(&mut self, text: &str, nickname: &str) -> Result<(), SyncError> {
        let trimmed = validate_outgoing_message(text)?;
        let nickname = validate_nickname(nickname)?;

        let envelope: Envelope<serde_json::Value> = self
            .gateway
            .post(
                "/api/lounge/send",
                &json!({ "message": trimmed, "nickname": nickname }),
            )
            .await;
        if !envelope.success {
            return Err(SyncError::Request(envelope.message_or("send failed")));
        }

        fetch_after_cursor(&self.gateway, &self.log, None, true).await;
        Ok(())
    }
}

impl Drop for LoungeSync {
    fn drop(&mut self) {
        // Belt-and-braces: the owning view must call stop_polling() on
        // teardown, but a leaked timer fetching forever is worse than a
        // redundant store.
        self.polling.store(false, Ordering::SeqCst);
    }
}

/// One incremental fetch: `GET /api/lounge/messages?last_id=<cursor>`,
/// merged into the log. With a guard supplied (tick path) the merge is
/// skipped when polling stopped while the fetch was in flight.
async fn fetch_after_cursor(
    gateway: &RequestGateway,
    log: &Mutex<ConversationLog<LoungeMessage>>,
    guard: Option<&AtomicBool>,
    silent_errors: bool,
) {
    let last_id = log.lock().ok().and_then(|l| l.cursor());
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(last_id) = last_id {
        query.push(("last_id", last_id.to_string()));
    }

    let envelope: Envelope<LoungeBatch> = if silent_errors {
        gateway.get_silent(LOUNGE_MESSAGES_PATH, &query).await
    } else {
        gateway.get(LOUNGE_MESSAGES_PATH, &query).await
    };

    // Tick errors leave log and cursor untouched; the next tick self-corrects.
    if !envelope.success {
        return;
    }
    let batch = envelope.data.map(|d| d.messages).unwrap_or_default();
    if batch.is_empty() {
        return;
    }

    if let Some(guard) = guard
        && !guard.load(Ordering::SeqCst)
    {
        debug!("discarding fetch that resolved after stop");
        return;
    }

    if let Ok(mut log) = log.lock() {
        let appended = log.merge(batch);
        if appended > 0 {
            debug!(appended, "merged new lounge messages");
        }
    }
}

/// Coach-chat engine: single-user history, no polling. The assistant reply
/// arrives synchronously as the response to `send`, so there is nothing to
/// poll for.
pub struct CoachChat {
    gateway: Arc<RequestGateway>,
    log: ConversationLog<CoachMessage>,
    next_local_id: u64,
}

impl CoachChat {
    #[must_use]
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self {
            gateway,
            log: ConversationLog::new(),
            next_local_id: 0,
        }
    }

    #[must_use]
    pub fn messages(&self) -> &[CoachMessage] {
        self.log.entries()
    }

    /// Replaces the log wholesale with server history. Provisional entries
    /// from earlier optimistic sends are dropped here; the server history
    /// contains the persisted copies under their real ids.
    pub async fn load(&mut self) -> Result<(), SyncError> {
        let envelope: Envelope<CoachHistory> = self.gateway.get("/api/coach/history", &[]).await;
        if !envelope.success {
            return Err(SyncError::Request(envelope.message_or("load failed")));
        }
        self.log
            .replace_all(envelope.data.map(|d| d.messages).unwrap_or_default());
        Ok(())
    }

    /// Appends the user line optimistically under a provisional id, posts,
    /// and on success appends the assistant reply. The provisional entry
    /// stays on failure so the user can see what they tried to send.
    pub async fn send(&mut self, text: &str) -> Result<String, SyncError> {
        let trimmed = validate_outgoing_message(text)?.to_owned();

        self.push_local(Role::User, trimmed.clone());

        let envelope: Envelope<CoachReply> = self
            .gateway
            .post("/api/coach/chat", &json!({ "message": trimmed }))
            .await;
        if !envelope.success {
            return Err(SyncError::Request(envelope.message_or("send failed")));
        }

        let reply = envelope.data.map(|d| d.reply).unwrap_or_default();
        self.push_local(Role::Assistant, reply.clone());
        Ok(reply)
    }

    pub async fn clear(&mut self) -> Result<(), SyncError> {
        let envelope: Envelope<serde_json::Value> =
            self.gateway.post("/api/coach/clear", &json!({})).await;
        if !envelope.success {
            return Err(SyncError::Request(envelope.message_or("clear failed")));
        }
        self.log.clear();
        Ok(())
    }

    fn push_local(&mut self, role: Role, content: String) {
        self.next_local_id += 1;
        // Local wall-clock stamp; the server's formatted timestamp takes
        // over on the next history reload.
        self.log.push_provisional(CoachMessage {
            id: MessageId::Provisional(self.next_local_id),
            role,
            content,
            created_at: now_unix_ms().to_string(),
        });
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
