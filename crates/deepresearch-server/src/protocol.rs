use std::sync::Arc;

use deepresearch_core::{ChatLoop, LoggingTelemetry, Session};
use deepresearch_schema::wire::{ClientMessage, ServerMessage};
use deepresearch_schema::CoreError;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::queue::OutgoingQueue;

/// Drives one connected session's wire protocol: enforces the
/// idle/awaiting-reply state machine, routes `command` and `chat_message`
/// frames, and pushes replies onto the session's outgoing queue. Transport
/// agnostic — callers own the actual socket framing.
pub struct ConnectionDriver {
    session: Arc<Session>,
    queue: Arc<OutgoingQueue>,
    dispatcher: Dispatcher,
}

impl ConnectionDriver {
    pub fn new(session: Arc<Session>, queue: Arc<OutgoingQueue>, dispatcher: Dispatcher) -> Self {
        Self { session, queue, dispatcher }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Processes one inbound client frame. Returns `false` when the
    /// connection must be closed (idle expiry or a fatal protocol violation).
    pub async fn handle(&self, message: ClientMessage) -> bool {
        self.session.touch().await;
        if self.session.is_idle_expired().await {
            self.queue.push(ServerMessage::SessionExpired).await;
            return false;
        }

        if self.session.has_pending_prompt().await {
            return self.handle_while_awaiting_reply(message).await;
        }

        match message {
            ClientMessage::Input { value } => match self.session.resolve_input(value).await {
                Ok(()) => true,
                Err(e) => self.close_on_protocol_violation(e).await,
            },
            ClientMessage::Command { name, args } => self.handle_command(&name, &args).await,
            ClientMessage::ChatMessage { content } => self.handle_chat(&content).await,
        }
    }

    async fn handle_while_awaiting_reply(&self, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Input { value } => match self.session.resolve_input(value).await {
                Ok(()) => {
                    if !self.session.has_pending_prompt().await {
                        self.queue.push(ServerMessage::EnableInput).await;
                    }
                    true
                }
                Err(e) => self.close_on_protocol_violation(e).await,
            },
            _ => {
                self.queue
                    .push(ServerMessage::Error { code: 3, message: "prompt pending".to_string() })
                    .await;
                true
            }
        }
    }

    async fn handle_command(&self, name: &str, args: &[String]) -> bool {
        self.queue.push(ServerMessage::DisableInput).await;
        let outcome = self.dispatcher.dispatch(&self.session, &self.queue, name, args).await;

        if !outcome.handled {
            self.queue
                .push(ServerMessage::Error { code: 3, message: format!("unknown command: {name}") })
                .await;
        }
        if !outcome.keep_disabled && !self.session.has_pending_prompt().await {
            self.queue.push(ServerMessage::EnableInput).await;
        }
        true
    }

    async fn handle_chat(&self, content: &str) -> bool {
        self.queue.push(ServerMessage::DisableInput).await;
        let persona = self.dispatcher.persona_store.get_default().await;
        let chat_loop = ChatLoop::new(
            Arc::clone(&self.dispatcher.llm),
            Arc::clone(&self.dispatcher.memory),
            self.dispatcher.user.clone(),
            persona,
            self.dispatcher.remote_sync,
        );
        let telemetry = LoggingTelemetry;

        match chat_loop.turn(&self.session, content, &telemetry).await {
            Ok(outcome) => {
                if let Some(thought) = outcome.thought {
                    self.queue.push(ServerMessage::Thought { content: thought }).await;
                }
                self.queue.push(ServerMessage::ChatResponse { content: outcome.reply }).await;
            }
            Err(e) => {
                warn!(error = %e, "chat turn failed");
                self.queue
                    .push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() })
                    .await;
            }
        }
        self.queue.push(ServerMessage::EnableInput).await;
        true
    }

    async fn close_on_protocol_violation(&self, error: CoreError) -> bool {
        self.queue
            .push(ServerMessage::Error { code: error.exit_code() as u16, message: error.to_string() })
            .await;
        if matches!(error, CoreError::ProtocolViolation(_)) {
            self.session.abort_pending_prompt().await;
            self.queue.push(ServerMessage::SessionExpired).await;
            false
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepresearch_core::{Orchestrator, PersonaStore, PreferencesStore};
    use deepresearch_memory::ManagerCache;
    use deepresearch_provider::{LlmClient, SearchClient};
    use deepresearch_schema::persona::TerminalPreferences;

    fn driver(dir: &std::path::Path) -> ConnectionDriver {
        let llm = Arc::new(LlmClient::new("http://localhost:1", None, "model", Default::default()));
        let orchestrator = Arc::new(Orchestrator::new(
            SearchClient::new("http://localhost:1", None),
            LlmClient::new("http://localhost:1", None, "model", Default::default()),
        ));
        let dispatcher = Dispatcher {
            orchestrator,
            llm: Arc::clone(&llm),
            memory: Arc::new(ManagerCache::new(dir.to_string_lossy().to_string(), None)),
            persona_store: Arc::new(PersonaStore::new(dir)),
            preferences_store: Arc::new(PreferencesStore::new(dir, TerminalPreferences::default())),
            chat_history: Arc::new(deepresearch_core::ChatHistoryStore::new(dir)),
            user: "alice".to_string(),
            remote_sync: false,
        };
        ConnectionDriver::new(
            Arc::new(Session::new(Some("alice".to_string()))),
            Arc::new(OutgoingQueue::new(crate::queue::MIN_QUEUE_CAPACITY)),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn input_without_pending_prompt_is_protocol_violation_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let keep_open = driver.handle(ClientMessage::Input { value: "x".to_string() }).await;
        assert!(!keep_open);
    }

    #[tokio::test]
    async fn other_messages_rejected_while_prompt_pending() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let (_info, _rx) = driver.session.request_prompt(false).await.unwrap();

        let keep_open = driver
            .handle(ClientMessage::Command { name: "status".to_string(), args: vec![] })
            .await;
        assert!(keep_open);
    }

    #[tokio::test]
    async fn unknown_command_reports_error_but_stays_open() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let keep_open = driver
            .handle(ClientMessage::Command { name: "bogus".to_string(), args: vec![] })
            .await;
        assert!(keep_open);
    }
}
