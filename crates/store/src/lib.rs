//! Conversation store implementations for deepsearch.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod conformance;

pub use in_memory::InMemoryConversationStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConversationStore;
