//! Relay Storage - messages, sessions and channel memberships
//!
//! A single [`MessageStore`] contract with SQLite, JSONL and capped in-memory
//! drivers. [`open_store`] picks the best driver that starts and reports any
//! degradation through [`MessageStore::health_check`].

pub mod channels;
pub mod error;
pub mod factory;
mod index;
pub mod jsonl;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod types;

pub use channels::{
    open_channel_store, ChannelBackend, ChannelMembershipRecord, ChannelMembershipStore,
    FileChannelStore, InMemoryChannelStore, SqliteChannelStore,
};
pub use error::*;
pub use factory::{open_store, open_with_fallback, DegradedStore, StorageOptions};
pub use jsonl::JsonlStore;
pub use memory::{InMemoryStore, MEMORY_MESSAGE_CAP};
pub use sqlite::SqliteStore;
pub use store::MessageStore;
pub use types::*;
