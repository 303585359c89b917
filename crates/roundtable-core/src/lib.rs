//! Data model and message bus for the multi-agent turn orchestration runtime.
//!
//! Owns the types every other `roundtable-*` crate builds on: [`Message`],
//! [`Agent`], [`ChatRoom`], the config loader, and the error taxonomy.

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod room;

pub use agent::{Agent, Audience};
pub use config::RoundtableConfig;
pub use error::{Result, RoundtableError};
pub use message::{Message, Role};
pub use room::{AgentHandle, ChatRoom};
