//! Per-agent turn engine: the receive path, the multi-hop tool/chat loop,
//! and deterministic context compaction.

pub mod compact;
pub mod engine;
pub mod history;
pub mod hop;

pub use compact::{compact_context, high_watermark, low_watermark, needs_compaction};
pub use engine::{TurnEngine, TurnResult};
pub use hop::{run_hop_loop, HopLoopContext, HopLoopOutcome};
