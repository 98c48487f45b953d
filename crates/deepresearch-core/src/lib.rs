pub mod chat;
pub mod history;
pub mod orchestrator;
pub mod persona;
pub mod session;
pub mod telemetry;

pub use chat::{ChatLoop, ChatTurnOutcome};
pub use history::ChatHistoryStore;
pub use orchestrator::{Orchestrator, StartOptions};
pub use persona::{PersonaStore, PreferencesStore};
pub use session::{ChatMessage, ChatRole, PromptInfo, Session, SessionMode};
pub use telemetry::{LoggingTelemetry, RecordingTelemetry, Telemetry};
