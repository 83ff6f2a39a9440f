pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use memory::MemoryStore;
pub use pool::DbPool;
pub use repository::PgRepository;
pub use store::{ConversationStore, EntityStore};
