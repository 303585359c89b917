//! FIFO mutual exclusion primitives guarding the shared LLM backend.
//!
//! [`ChannelLock`] serializes turns within one channel end-to-end; a turn
//! holds it from receive through compaction. [`TransportGate`] sits a layer
//! lower and serializes the actual outbound network call plus a post-call
//! cooldown, independent of which channel initiated it. [`PauseController`]
//! is the process-wide pause/user-interject gate shared by the scheduler
//! and the turn engine.

pub mod channel_lock;
pub mod pause;
pub mod transport_gate;

pub use channel_lock::{ChannelLock, LockGuard};
pub use pause::PauseController;
pub use transport_gate::{GateGuard, TransportGate};
