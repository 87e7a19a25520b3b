//! # Agentry Core
//!
//! Domain types, traits, and error definitions for the Agentry agent
//! execution engine. This crate has **zero framework dependencies**: it
//! defines the domain model that all other crates implement against.
//!
//! ## Design
//!
//! Every seam is a trait here (`Provider`, `Tool`, `ChatStore`,
//! `SubAgentRunner`). Implementations live in their respective crates, so
//! backends can be swapped via configuration and replaced by mocks in tests.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod memory;
pub mod store;
pub mod turn;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{
    ConversationKind, ConversationRecord, ConversationStatus, Message, MessageRecord, MessageState,
    Role,
};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use tool::{SubAgentRunner, Tool, ToolCallRecord, ToolContext, ToolParams, ToolRegistry, ToolState};
pub use memory::{MemoryEntry, MemoryFilter, MemoryKind};
pub use store::ChatStore;
pub use turn::{TurnRequest, TurnResult};
pub use event::{DomainEvent, EventBus};
