use std::sync::Arc;

use deepresearch_memory::{ManagerCache, RecallRequest, StoreRequest, SummarizeResult};
use deepresearch_provider::{CompletionRequest, LlmClient};
use deepresearch_schema::memory::{MemoryLayer, MemoryRole};
use deepresearch_schema::persona::Persona;
use deepresearch_schema::CoreError;
use tracing::instrument;

use crate::session::{ChatMessage, ChatRole, Session};
use crate::telemetry::Telemetry;

const RECALL_TOP_K: usize = 5;
const HISTORY_WINDOW: usize = 10;
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

pub struct ChatTurnOutcome {
    pub reply: String,
    pub thought: Option<String>,
}

/// Drives conversational exchanges using the LLM and memory subsystems,
/// sharing both with the research orchestrator.
pub struct ChatLoop {
    llm: Arc<LlmClient>,
    memory: Arc<ManagerCache>,
    user: String,
    persona: Persona,
    remote_sync: bool,
}

impl ChatLoop {
    pub fn new(llm: Arc<LlmClient>, memory: Arc<ManagerCache>, user: String, persona: Persona, remote_sync: bool) -> Self {
        Self { llm, memory, user, persona, remote_sync }
    }

    #[instrument(skip(self, session, telemetry))]
    pub async fn turn(
        &self,
        session: &Session,
        message: &str,
        telemetry: &dyn Telemetry,
    ) -> Result<ChatTurnOutcome, CoreError> {
        session.push_chat(ChatMessage::new(ChatRole::User, message)).await;

        let working = self.memory.get_or_create(&self.user, MemoryLayer::Working, self.remote_sync).await?;
        let episodic = self.memory.get_or_create(&self.user, MemoryLayer::Episodic, self.remote_sync).await?;

        working
            .store(StoreRequest { content: message.to_string(), ..Default::default() })
            .await?;

        let mut recalled = working
            .recall(RecallRequest { query: message.to_string(), limit: Some(RECALL_TOP_K), ..Default::default() })
            .await?;
        recalled.extend(
            episodic
                .recall(RecallRequest { query: message.to_string(), limit: Some(RECALL_TOP_K), ..Default::default() })
                .await?,
        );
        recalled.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        recalled.truncate(RECALL_TOP_K);

        let memory_context = recalled
            .iter()
            .map(|r| format!("- {}", r.content))
            .collect::<Vec<_>>()
            .join("\n");

        let history = session.recent_chat(HISTORY_WINDOW).await;
        let history_text = history
            .iter()
            .map(|m| format!("{}: {}", role_label(m.role), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "{}\n{}\n\nRelevant memory:\n{memory_context}",
            self.persona.name, self.persona.description
        );

        let resp = self
            .llm
            .complete(CompletionRequest {
                system,
                user: format!("{history_text}\nuser: {message}"),
                character: Some(self.persona.slug.clone()),
                ..Default::default()
            })
            .await?;

        let (visible, thought) = split_thinking(&resp.content);
        if let Some(thought) = &thought {
            telemetry.emit_thought(thought, "chat");
        }

        session.push_chat(ChatMessage::new(ChatRole::Assistant, visible.clone())).await;
        working
            .store(StoreRequest { content: visible.clone(), role: Some(MemoryRole::Assistant), ..Default::default() })
            .await?;

        Ok(ChatTurnOutcome { reply: visible, thought })
    }

    /// Called on `/exit` or disconnect: summarizes the session's chat
    /// history into a new episodic memory.
    pub async fn on_exit(&self, session: &Session) -> Result<SummarizeResult, CoreError> {
        let episodic = self.memory.get_or_create(&self.user, MemoryLayer::Episodic, self.remote_sync).await?;
        let history = session.recent_chat(HISTORY_WINDOW).await;
        let transcript = history
            .iter()
            .map(|m| format!("{}: {}", role_label(m.role), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(episodic.summarize(&transcript, None).await)
    }
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
    }
}

/// Splits a leading `<thinking>...</thinking>` preamble out of a reply.
/// The thinking block is rendered as thought telemetry and never appears
/// in the user-visible text.
fn split_thinking(content: &str) -> (String, Option<String>) {
    let Some(start) = content.find(THINKING_OPEN) else {
        return (content.to_string(), None);
    };
    let Some(end_rel) = content[start..].find(THINKING_CLOSE) else {
        return (content.to_string(), None);
    };
    let end = start + end_rel;
    let thought = content[start + THINKING_OPEN.len()..end].trim().to_string();
    let mut visible = String::new();
    visible.push_str(&content[..start]);
    visible.push_str(&content[end + THINKING_CLOSE.len()..]);
    (visible.trim().to_string(), Some(thought))
}
