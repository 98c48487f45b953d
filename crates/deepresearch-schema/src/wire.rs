use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::research::{Progress, ResearchResult};

/// Messages sent from the terminal client to the server over the session
/// connection. Tagged on `type`, matching the client-visible wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A slash command invocation, e.g. `/research`, `/status`, `/memory`.
    Command { name: String, #[serde(default)] args: Vec<String> },
    /// A reply to an outstanding `Prompt`.
    Input { value: String },
    /// A free-form chat turn outside of an active research run.
    ChatMessage { content: String },
}

/// Messages sent from the server to the terminal client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A line of rendered output to append to the transcript.
    Output { content: String },
    /// A progress snapshot for the active research run.
    Progress { run_id: Uuid, progress: Progress },
    /// An intermediate reasoning fragment, shown in a collapsible panel.
    Thought { content: String },
    /// A short-lived status line, e.g. "searching web for...".
    Status { content: String },
    /// Requests input from the user. `masked` indicates a password-style
    /// prompt that must not be echoed. `context` tags the prompt's purpose
    /// (e.g. `"post_research_action"`) so the client can render a
    /// purpose-specific widget (choice buttons, etc.) instead of a bare
    /// text field.
    Prompt {
        prompt_id: Uuid,
        message: String,
        #[serde(default)]
        masked: bool,
        deadline_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    /// Enables the input box after a command completes or a prompt resolves.
    EnableInput,
    /// Disables the input box while a command or prompt is in flight.
    DisableInput,
    /// Announces a session mode transition, e.g. "research" vs "chat".
    Mode { name: String },
    /// Signals that the chat loop has warmed up and can accept turns.
    ChatReady { prompt: String, persona: String },
    /// A chat completion in response to a `ChatMessage`.
    ChatResponse { content: String },
    /// Offers a completed research result for client-side download.
    DownloadFile {
        filename: String,
        content: String,
        mime_type: String,
    },
    /// A user-facing error. `code` mirrors `CoreError::exit_code` classes
    /// for machine-readable clients; `message` is always safe to display.
    Error { code: u16, message: String },
    /// The session has expired and the connection will be closed.
    SessionExpired,
    /// Connection lifecycle notice, e.g. reconnect acknowledgement.
    Connection { connected: bool },
    /// A terminal research result, sent once a run completes or fails.
    Result { run_id: Uuid, result: ResearchResult },
}
