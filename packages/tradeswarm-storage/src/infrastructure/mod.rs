//! Infrastructure layer - Storage adapters
//!
//! - `memory`: DashMap tables behind a Tokio writer task (tests, dry runs)
//! - `sqlite`: WAL database behind a dedicated writer thread

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryCoordinationStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCoordinationStore, StoreConfig};
