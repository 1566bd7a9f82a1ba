//! Session memory for Cortex.
//!
//! [`SessionStore`] implements the turn/scratch semantics on top of any
//! [`cortex_core::SessionStorage`] medium: in-memory, one file per session,
//! or SQLite (feature `sqlite`, on by default).

pub mod file_backend;
pub mod in_memory;
pub mod record;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileStorage;
pub use in_memory::InMemoryStorage;
pub use store::SessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
