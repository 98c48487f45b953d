use std::sync::Arc;

use deepresearch_core::{
    ChatHistoryStore, ChatLoop, ChatRole, Orchestrator, PersonaStore, PreferencesStore, Session, StartOptions,
};
use deepresearch_memory::{ManagerCache, RecallRequest, StoreRequest};
use deepresearch_provider::LlmClient;
use deepresearch_schema::memory::MemoryLayer;
use deepresearch_schema::persona::TerminalPreferences;
use deepresearch_schema::research::{ResearchResult, Visibility};
use deepresearch_schema::wire::ServerMessage;
use deepresearch_schema::CoreError;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::queue::OutgoingQueue;
use crate::queue_telemetry::QueueTelemetry;

/// Outcome of a single command dispatch. When `keep_disabled` is false (the
/// default) and no prompt is in flight, the caller emits `enable_input` once
/// this outcome is returned.
#[derive(Debug, Clone, Copy)]
pub struct CommandOutcome {
    pub success: bool,
    pub keep_disabled: bool,
    pub handled: bool,
}

impl CommandOutcome {
    fn ok() -> Self {
        Self { success: true, keep_disabled: false, handled: true }
    }

    fn ok_async() -> Self {
        Self { success: true, keep_disabled: true, handled: true }
    }

    fn failed() -> Self {
        Self { success: false, keep_disabled: false, handled: true }
    }

    fn unknown() -> Self {
        Self { success: false, keep_disabled: false, handled: false }
    }
}

/// Routes `/research`, `/chat`, `/status`, `/memory`, `/terminal`,
/// `/chat-history`, and `/login` commands against the core subsystems,
/// pushing results onto the session's outgoing queue.
pub struct Dispatcher {
    pub orchestrator: Arc<Orchestrator>,
    pub llm: Arc<LlmClient>,
    pub memory: Arc<ManagerCache>,
    pub persona_store: Arc<PersonaStore>,
    pub preferences_store: Arc<PreferencesStore>,
    pub chat_history: Arc<ChatHistoryStore>,
    pub user: String,
    pub remote_sync: bool,
}

impl Dispatcher {
    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        queue: &Arc<OutgoingQueue>,
        name: &str,
        args: &[String],
    ) -> CommandOutcome {
        match name {
            "research" => self.cmd_research(session, queue, args).await,
            "chat" => self.cmd_chat(session, queue, args).await,
            "status" => self.cmd_status(session, queue).await,
            "memory" => self.cmd_memory(queue, args).await,
            "terminal" => self.cmd_terminal(queue, args).await,
            "chat-history" => self.cmd_chat_history(session, queue, args).await,
            "login" => self.cmd_login(session, queue, args).await,
            _ => CommandOutcome::unknown(),
        }
    }

    async fn cmd_research(&self, session: &Arc<Session>, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        if session.active_run().await.is_some() {
            queue
                .push(ServerMessage::Error { code: 1, message: "a research run is already active".to_string() })
                .await;
            return CommandOutcome::failed();
        }
        if args.is_empty() {
            queue.push(ServerMessage::Error { code: 3, message: "usage: /research <topic>".to_string() }).await;
            return CommandOutcome::failed();
        }

        let mut topic_words = Vec::new();
        let mut options = StartOptions::default();
        for arg in args {
            if let Some(value) = arg.strip_prefix("--depth=") {
                options.depth = value.parse().unwrap_or(options.depth);
            } else if let Some(value) = arg.strip_prefix("--breadth=") {
                options.breadth = value.parse().unwrap_or(options.breadth);
            } else if let Some(value) = arg.strip_prefix("--visibility=") {
                options.visibility = if value == "public" { Visibility::Public } else { Visibility::Private };
            } else {
                topic_words.push(arg.clone());
            }
        }
        let topic = topic_words.join(" ");

        let run_id = Uuid::new_v4();
        session.set_active_run(Some(run_id)).await;
        session.set_mode(deepresearch_core::SessionMode::Research).await;
        queue.push(ServerMessage::Mode { name: "research".to_string() }).await;

        let orchestrator = Arc::clone(&self.orchestrator);
        let queue_bg = Arc::clone(queue);
        let session_bg = Arc::clone(session);
        tokio::spawn(async move {
            let telemetry = Arc::new(QueueTelemetry::new(run_id, Arc::clone(&queue_bg)));
            let result = orchestrator
                .start(&topic, options, telemetry, CancellationToken::new())
                .await;

            match result {
                Ok(result) => {
                    if result.success {
                        offer_post_research_prompt(&session_bg, &queue_bg, &result).await;
                    }
                    queue_bg.push(ServerMessage::Result { run_id, result }).await;
                }
                Err(e) => {
                    warn!(error = %e, "research run failed");
                    queue_bg.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                }
            }
            session_bg.set_active_run(None).await;
            session_bg.set_mode(deepresearch_core::SessionMode::Command).await;
            queue_bg.push(ServerMessage::Mode { name: "command".to_string() }).await;
            queue_bg.push(ServerMessage::EnableInput).await;
        });

        CommandOutcome::ok_async()
    }

    async fn cmd_chat(&self, session: &Arc<Session>, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        match args.first().map(String::as_str) {
            None => {
                session.set_mode(deepresearch_core::SessionMode::Chat).await;
                queue.push(ServerMessage::Mode { name: "chat".to_string() }).await;
                let persona = self.persona_store.get_default().await;
                queue
                    .push(ServerMessage::ChatReady {
                        prompt: format!("chatting as {} — type /exit to leave chat mode", persona.name),
                        persona: persona.slug,
                    })
                    .await;
                CommandOutcome::ok()
            }
            Some("list") => {
                let names = deepresearch_core::persona::catalog()
                    .into_iter()
                    .map(|p| format!("{} — {}", p.slug, p.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                queue.push(ServerMessage::Output { content: names }).await;
                CommandOutcome::ok()
            }
            Some("get") => {
                let current = self.persona_store.get_default().await;
                queue.push(ServerMessage::Output { content: current.slug }).await;
                CommandOutcome::ok()
            }
            Some("set") => {
                let Some(slug) = args.get(1) else {
                    queue.push(ServerMessage::Error { code: 3, message: "usage: /chat set <persona>".to_string() }).await;
                    return CommandOutcome::failed();
                };
                match self.persona_store.set_default(slug).await {
                    Ok(persona) => {
                        queue.push(ServerMessage::Output { content: format!("persona set to {}", persona.slug) }).await;
                        CommandOutcome::ok()
                    }
                    Err(e) => {
                        queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                        CommandOutcome::failed()
                    }
                }
            }
            Some("reset") => {
                let persona = self.persona_store.set_default("default").await.expect("default slug always known");
                queue.push(ServerMessage::Output { content: format!("persona reset to {}", persona.slug) }).await;
                CommandOutcome::ok()
            }
            Some("exit") => {
                let persona = self.persona_store.get_default().await;
                let chat_loop = ChatLoop::new(Arc::clone(&self.llm), Arc::clone(&self.memory), self.user.clone(), persona, self.remote_sync);
                let _ = chat_loop.on_exit(session).await;
                session.set_mode(deepresearch_core::SessionMode::Command).await;
                queue.push(ServerMessage::Mode { name: "command".to_string() }).await;
                CommandOutcome::ok()
            }
            Some(other) => {
                queue.push(ServerMessage::Error { code: 3, message: format!("unknown /chat subcommand: {other}") }).await;
                CommandOutcome::failed()
            }
        }
    }

    async fn cmd_status(&self, session: &Arc<Session>, queue: &Arc<OutgoingQueue>) -> CommandOutcome {
        let mode = session.mode().await;
        let run = session.active_run().await;
        let persona = self.persona_store.get_default().await;
        let lines = format!(
            "mode: {mode:?}\nactive_run: {}\npersona: {}\nremote_sync: {}",
            run.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string()),
            persona.slug,
            self.remote_sync
        );
        queue.push(ServerMessage::Output { content: lines }).await;
        CommandOutcome::ok()
    }

    async fn cmd_memory(&self, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        let Some(sub) = args.first().map(String::as_str) else {
            queue.push(ServerMessage::Error { code: 3, message: "usage: /memory store|recall|stats|summarize".to_string() }).await;
            return CommandOutcome::failed();
        };
        let rest = args[1..].join(" ");

        let result: Result<String, CoreError> = async {
            match sub {
                "store" => {
                    let manager = self.memory.get_or_create(&self.user, MemoryLayer::Working, self.remote_sync).await?;
                    let record = manager.store(StoreRequest { content: rest, ..Default::default() }).await?;
                    Ok(format!("stored memory {}", record.id))
                }
                "recall" => {
                    let manager = self.memory.get_or_create(&self.user, MemoryLayer::Working, self.remote_sync).await?;
                    let records = manager.recall(RecallRequest { query: rest, ..Default::default() }).await?;
                    Ok(records.iter().map(|r| format!("- {}", r.content)).collect::<Vec<_>>().join("\n"))
                }
                "stats" => {
                    let manager = self.memory.get_or_create(&self.user, MemoryLayer::Working, self.remote_sync).await?;
                    let stats = manager.stats().await?;
                    Ok(format!(
                        "working(stored={} retrieved={} validated={}/{}) \
                         episodic(stored={} retrieved={} validated={}/{}) \
                         semantic(stored={} retrieved={} validated={}/{}) \
                         total(stored={} retrieved={} validated={})",
                        stats.working.stored, stats.working.retrieved, stats.working.validated_count, stats.working.stored,
                        stats.episodic.stored, stats.episodic.retrieved, stats.episodic.validated_count, stats.episodic.stored,
                        stats.semantic.stored, stats.semantic.retrieved, stats.semantic.validated_count, stats.semantic.stored,
                        stats.total_stored, stats.total_retrieved, stats.total_validated
                    ))
                }
                "summarize" => {
                    let manager = self.memory.get_or_create(&self.user, MemoryLayer::Episodic, self.remote_sync).await?;
                    let outcome = manager.summarize(&rest, None).await;
                    Ok(format!("summarized: {}", outcome.success))
                }
                other => Err(CoreError::InputInvalid(format!("unknown /memory subcommand: {other}"))),
            }
        }
        .await;

        match result {
            Ok(content) => {
                queue.push(ServerMessage::Output { content }).await;
                CommandOutcome::ok()
            }
            Err(e) => {
                queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                CommandOutcome::failed()
            }
        }
    }

    async fn cmd_terminal(&self, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        if args.first().map(String::as_str) != Some("prefs") {
            queue.push(ServerMessage::Error { code: 3, message: "usage: /terminal prefs [--key=value ...]".to_string() }).await;
            return CommandOutcome::failed();
        }

        let mut patch = TerminalPreferences::default();
        for arg in &args[1..] {
            let Some(rest) = arg.strip_prefix("--") else { continue };
            let Some((key, value)) = rest.split_once('=') else { continue };
            let parsed = matches!(value, "true" | "1" | "on");
            patch.terminal.insert(key.to_string(), parsed);
        }

        if patch.terminal.is_empty() {
            let current = self.preferences_store.read().await;
            let lines = pretty_prefs(&current);
            queue.push(ServerMessage::Output { content: lines }).await;
            return CommandOutcome::ok();
        }

        match self.preferences_store.update(patch).await {
            Ok(updated) => {
                queue.push(ServerMessage::Output { content: pretty_prefs(&updated) }).await;
                CommandOutcome::ok()
            }
            Err(e) => {
                queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                CommandOutcome::failed()
            }
        }
    }

    async fn cmd_chat_history(&self, session: &Arc<Session>, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        let conversation_id = session.id;
        match args.first().map(String::as_str) {
            Some("list") => {
                let ids = self.chat_history.list().await;
                let lines = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join("\n");
                queue.push(ServerMessage::Output { content: lines }).await;
                CommandOutcome::ok()
            }
            Some("show") => {
                let history = session.recent_chat(10).await;
                let lines = history.iter().map(|m| format!("{}: {}", role_label(m.role), m.content)).collect::<Vec<_>>().join("\n");
                queue.push(ServerMessage::Output { content: lines }).await;
                CommandOutcome::ok()
            }
            Some("export") => {
                let history = session.recent_chat(usize::MAX).await;
                if let Err(e) = self.chat_history.save(conversation_id, &history).await {
                    queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                    return CommandOutcome::failed();
                }
                match self.chat_history.export(conversation_id).await {
                    Ok(json) => {
                        queue
                            .push(ServerMessage::DownloadFile {
                                filename: format!("{conversation_id}.json"),
                                content: json,
                                mime_type: "application/json".to_string(),
                            })
                            .await;
                        CommandOutcome::ok()
                    }
                    Err(e) => {
                        queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                        CommandOutcome::failed()
                    }
                }
            }
            Some("clear") => match self.chat_history.clear(conversation_id).await {
                Ok(()) => {
                    queue.push(ServerMessage::Output { content: "chat history cleared".to_string() }).await;
                    CommandOutcome::ok()
                }
                Err(e) => {
                    queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                    CommandOutcome::failed()
                }
            },
            _ => {
                queue.push(ServerMessage::Error { code: 3, message: "usage: /chat-history list|show|export|clear".to_string() }).await;
                CommandOutcome::failed()
            }
        }
    }

    async fn cmd_login(&self, session: &Arc<Session>, queue: &Arc<OutgoingQueue>, args: &[String]) -> CommandOutcome {
        let Some(username) = args.first() else {
            queue.push(ServerMessage::Error { code: 3, message: "usage: /login <username>".to_string() }).await;
            return CommandOutcome::failed();
        };
        let username = username.clone();

        let (info, rx) = match session.request_prompt(true).await {
            Ok(pair) => pair,
            Err(e) => {
                queue.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                return CommandOutcome::failed();
            }
        };
        queue
            .push(ServerMessage::Prompt {
                prompt_id: info.id,
                message: format!("password for {username}"),
                masked: true,
                deadline_ms: info.deadline_ms,
                context: None,
            })
            .await;

        // The reply to this prompt arrives as a separate `input` frame on the
        // same connection's read loop that called us, so waiting on it here
        // inline would deadlock. Await it in the background and let the
        // command return immediately, same as `cmd_research`.
        let session_bg = Arc::clone(session);
        let queue_bg = Arc::clone(queue);
        tokio::spawn(async move {
            match session_bg.await_prompt_reply(rx).await {
                Ok(_password) => {
                    queue_bg.push(ServerMessage::Output { content: format!("logged in as {username}") }).await;
                }
                Err(e) => {
                    queue_bg.push(ServerMessage::Error { code: e.exit_code() as u16, message: e.to_string() }).await;
                }
            }
            queue_bg.push(ServerMessage::EnableInput).await;
        });

        CommandOutcome::ok_async()
    }
}

/// Offers the operator a keep/download/upload/discard choice once a run
/// completes successfully. `upload`'s actual remote destination is outside
/// this crate's concern — both `download` and `upload` surface the same
/// `download_file` frame for the connected client to act on.
async fn offer_post_research_prompt(session: &Arc<Session>, queue: &Arc<OutgoingQueue>, result: &ResearchResult) {
    let (info, rx) = match session.request_prompt(false).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "could not offer post-research prompt");
            return;
        }
    };
    queue
        .push(ServerMessage::Prompt {
            prompt_id: info.id,
            message: "research complete — keep, download, upload, or discard?".to_string(),
            masked: false,
            deadline_ms: info.deadline_ms,
            context: Some("post_research_action".to_string()),
        })
        .await;

    let choice = match session.await_prompt_reply(rx).await {
        Ok(value) => value.trim().to_lowercase(),
        Err(e) => {
            warn!(error = %e, "post-research prompt did not resolve");
            return;
        }
    };
    if matches!(choice.as_str(), "download" | "upload") {
        queue
            .push(ServerMessage::DownloadFile {
                filename: result.suggested_filename.clone(),
                content: result.summary.clone(),
                mime_type: "text/markdown".to_string(),
            })
            .await;
    }
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
    }
}

fn pretty_prefs(prefs: &TerminalPreferences) -> String {
    let mut lines: Vec<String> = prefs.terminal.iter().map(|(k, v)| format!("{k}={v}")).collect();
    lines.extend(prefs.widgets.iter().map(|(k, v)| format!("widgets.{k}={v}")));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepresearch_core::PreferencesStore;
    use deepresearch_memory::ManagerCache;
    use deepresearch_provider::{LlmClient, SearchClient};

    fn test_dispatcher(dir: &std::path::Path) -> Dispatcher {
        let search = SearchClient::new("http://localhost:1", None);
        let llm = Arc::new(LlmClient::new("http://localhost:1", None, "model", Default::default()));
        let orchestrator = Arc::new(Orchestrator::new(search, LlmClient::new("http://localhost:1", None, "model", Default::default())));
        Dispatcher {
            orchestrator,
            llm: Arc::clone(&llm),
            memory: Arc::new(ManagerCache::new(dir.to_string_lossy().to_string(), None)),
            persona_store: Arc::new(PersonaStore::new(dir)),
            preferences_store: Arc::new(PreferencesStore::new(dir, TerminalPreferences::default())),
            chat_history: Arc::new(ChatHistoryStore::new(dir)),
            user: "alice".to_string(),
            remote_sync: false,
        }
    }

    #[tokio::test]
    async fn research_with_no_topic_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let session = Arc::new(Session::new(Some("alice".to_string())));
        let queue = Arc::new(OutgoingQueue::new(crate::queue::MIN_QUEUE_CAPACITY));

        let outcome = dispatcher.dispatch(&session, &queue, "research", &[]).await;
        assert!(!outcome.success);
        assert!(outcome.handled);
    }

    #[tokio::test]
    async fn unknown_command_is_unhandled() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let session = Arc::new(Session::new(None));
        let queue = Arc::new(OutgoingQueue::new(crate::queue::MIN_QUEUE_CAPACITY));

        let outcome = dispatcher.dispatch(&session, &queue, "bogus", &[]).await;
        assert!(!outcome.handled);
    }

    #[tokio::test]
    async fn chat_list_reports_persona_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let session = Arc::new(Session::new(None));
        let queue = Arc::new(OutgoingQueue::new(crate::queue::MIN_QUEUE_CAPACITY));

        let outcome = dispatcher.dispatch(&session, &queue, "chat", &["list".to_string()]).await;
        assert!(outcome.success);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn memory_store_then_recall_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let session = Arc::new(Session::new(None));
        let queue = Arc::new(OutgoingQueue::new(crate::queue::MIN_QUEUE_CAPACITY));

        let outcome = dispatcher
            .dispatch(&session, &queue, "memory", &["store".to_string(), "rust".to_string(), "ownership".to_string()])
            .await;
        assert!(outcome.success);

        let outcome = dispatcher
            .dispatch(&session, &queue, "memory", &["recall".to_string(), "ownership".to_string()])
            .await;
        assert!(outcome.success);
    }
}
