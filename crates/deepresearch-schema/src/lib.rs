pub mod error;
pub mod memory;
pub mod persona;
pub mod research;
pub mod wire;

pub use error::CoreError;
pub use memory::{MemoryLayer, MemoryRecord, MemoryRole, MemoryStats};
pub use persona::{Persona, TerminalPreferences};
pub use research::{Learning, Progress, Query, ResearchResult, ResearchRun, RunStatus, SearchHit, Visibility};
pub use wire::{ClientMessage, ServerMessage};
