pub mod manager;
pub mod migrations;
pub mod store;

pub use manager::{ManagerCache, MemoryManager, RecallRequest, StoreRequest, SummarizeResult};
pub use store::MemoryStore;
