//! # palaver-store
//!
//! Domain models and the [`ConversationStore`] interface the messaging
//! service persists through. The relational backend lives outside this
//! workspace; [`MemoryStore`] is the in-process reference implementation
//! used by tests and the composition root.

pub mod memory;
pub mod models;
pub mod store;

mod error;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use store::ConversationStore;
