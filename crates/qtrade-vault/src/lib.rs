pub mod consolidation;
pub mod error;
pub mod hot_cache;
pub mod sqlite;
pub mod vault;

pub use error::VaultError;
pub use sqlite::SqliteStore;
pub use vault::MemoryVault;
