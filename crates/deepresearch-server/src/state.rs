use std::path::PathBuf;
use std::sync::Arc;

use deepresearch_core::{ChatHistoryStore, Orchestrator, PersonaStore, PreferencesStore};
use deepresearch_memory::ManagerCache;
use deepresearch_provider::LlmClient;

/// Shared application state accessible from every route handler.
#[derive(Clone)]
pub struct AppState {
    pub storage_dir: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
    pub llm: Arc<LlmClient>,
    pub memory: Arc<ManagerCache>,
    pub persona_store: Arc<PersonaStore>,
    pub preferences_store: Arc<PreferencesStore>,
    pub chat_history: Arc<ChatHistoryStore>,
    pub remote_sync: bool,
}
