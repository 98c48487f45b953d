use std::time::Duration;

use chrono::{DateTime, Utc};
use deepresearch_schema::CoreError;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

const PROMPT_DEADLINE: Duration = Duration::from_secs(120);
const SESSION_IDLE_LIMIT_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Command,
    Chat,
    Research,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now() }
    }
}

struct PendingPrompt {
    id: Uuid,
    is_password: bool,
    sender: oneshot::Sender<String>,
}

/// A snapshot of the pending prompt, safe to hand to a transport layer for
/// rendering a wire `prompt` frame.
#[derive(Debug, Clone, Copy)]
pub struct PromptInfo {
    pub id: Uuid,
    pub is_password: bool,
    pub deadline_ms: u64,
}

/// A connected operator's server-side session state: mode, chat history,
/// the active research run (if any), and the prompt state machine. The
/// session exclusively owns its `PromptState`; callers request input via
/// `request_prompt` and await the returned future.
pub struct Session {
    pub id: Uuid,
    pub user: Option<String>,
    mode: Mutex<SessionMode>,
    chat_history: Mutex<Vec<ChatMessage>>,
    active_run: Mutex<Option<Uuid>>,
    prompt: Mutex<Option<PendingPrompt>>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Session {
    pub fn new(user: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            mode: Mutex::new(SessionMode::Command),
            chat_history: Mutex::new(Vec::new()),
            active_run: Mutex::new(None),
            prompt: Mutex::new(None),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    pub async fn mode(&self) -> SessionMode {
        *self.mode.lock().await
    }

    pub async fn set_mode(&self, mode: SessionMode) {
        *self.mode.lock().await = mode;
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Utc::now();
    }

    pub async fn is_idle_expired(&self) -> bool {
        let last = *self.last_activity.lock().await;
        (Utc::now() - last).num_seconds() >= SESSION_IDLE_LIMIT_SECS
    }

    pub async fn push_chat(&self, message: ChatMessage) {
        self.chat_history.lock().await.push(message);
    }

    /// Returns the last `n` messages, matching the chat loop's truncation rule.
    pub async fn recent_chat(&self, n: usize) -> Vec<ChatMessage> {
        let history = self.chat_history.lock().await;
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    pub async fn set_active_run(&self, run_id: Option<Uuid>) {
        *self.active_run.lock().await = run_id;
    }

    pub async fn active_run(&self) -> Option<Uuid> {
        *self.active_run.lock().await
    }

    pub async fn has_pending_prompt(&self) -> bool {
        self.prompt.lock().await.is_some()
    }

    /// Transitions `idle → awaiting_reply`, waits up to 120s for a matching
    /// `resolve_input` call, then returns to `idle` regardless of outcome.
    /// A second call while a prompt is already pending is a fatal protocol
    /// error — the caller must close the session.
    pub async fn request_prompt(
        &self,
        is_password: bool,
    ) -> Result<(PromptInfo, oneshot::Receiver<String>), CoreError> {
        let mut guard = self.prompt.lock().await;
        if guard.is_some() {
            return Err(CoreError::ProtocolViolation("prompt already pending".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        *guard = Some(PendingPrompt { id, is_password, sender: tx });
        self.set_mode(SessionMode::Prompt).await;
        Ok((PromptInfo { id, is_password, deadline_ms: PROMPT_DEADLINE.as_millis() as u64 }, rx))
    }

    /// Awaits a prompt reply with the standard 120s deadline, clearing the
    /// pending state on any outcome (resolved, timed out, or aborted).
    pub async fn await_prompt_reply(&self, receiver: oneshot::Receiver<String>) -> Result<String, CoreError> {
        let outcome = tokio::time::timeout(PROMPT_DEADLINE, receiver).await;
        self.prompt.lock().await.take();
        self.set_mode(SessionMode::Command).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CoreError::PromptAborted),
            Err(_) => Err(CoreError::PromptTimeout),
        }
    }

    /// Resolves the pending prompt with a client-supplied `input` value.
    /// Returns to `idle`.
    pub async fn resolve_input(&self, value: String) -> Result<(), CoreError> {
        let pending = self.prompt.lock().await.take();
        match pending {
            Some(state) => {
                let _ = state.sender.send(value);
                Ok(())
            }
            None => Err(CoreError::ProtocolViolation("no prompt pending".to_string())),
        }
    }

    /// Rejects any in-flight prompt with `PromptAborted`, for session close.
    pub async fn abort_pending_prompt(&self) {
        self.prompt.lock().await.take();
    }

    pub async fn pending_prompt_id(&self) -> Option<Uuid> {
        self.prompt.lock().await.as_ref().map(|p| p.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_then_resolve_round_trips_value() {
        let session = Session::new(Some("alice".to_string()));
        let (info, rx) = session.request_prompt(false).await.unwrap();
        assert!(!info.is_password);

        session.resolve_input("secret".to_string()).await.unwrap();
        let value = session.await_prompt_reply(rx).await.unwrap();
        assert_eq!(value, "secret");
        assert!(!session.has_pending_prompt().await);
        assert_eq!(session.mode().await, SessionMode::Command);
    }

    #[tokio::test]
    async fn second_prompt_while_pending_is_protocol_violation() {
        let session = Session::new(None);
        let (_info, _rx) = session.request_prompt(false).await.unwrap();
        let err = session.request_prompt(true).await.unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn resolve_input_without_pending_prompt_errors() {
        let session = Session::new(None);
        let err = session.resolve_input("x".to_string()).await.unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn abort_pending_prompt_rejects_waiter() {
        let session = Session::new(None);
        let (_info, rx) = session.request_prompt(false).await.unwrap();
        session.abort_pending_prompt().await;
        let err = session.await_prompt_reply(rx).await.unwrap_err();
        assert!(matches!(err, CoreError::PromptAborted));
    }

    #[tokio::test]
    async fn recent_chat_truncates_to_last_n() {
        let session = Session::new(None);
        for i in 0..15 {
            session.push_chat(ChatMessage::new(ChatRole::User, format!("msg {i}"))).await;
        }
        let recent = session.recent_chat(10).await;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "msg 5");
        assert_eq!(recent[9].content, "msg 14");
    }
}
