//! Streaming LLM client: dual wire-format parsing, staged connect timeouts,
//! idle/hard-stop watchdogs, and per-chunk abort detection.

pub mod error;
pub mod sse;
pub mod stream;
pub mod transport;
pub mod wire;

pub use error::ProviderError;
pub use sse::{OpenAiSseParser, ProviderNativeParser, StreamParser};
pub use stream::ChunkDelta;
pub use transport::{ChatOpts, ChatTransport, LeaseTouch};
pub use wire::{AssistantMessage, ChatMessage, ChatRequest, ToolCallResult, ToolDefinition};
