//! Ticked round-robin turn scheduler, sharing the process-wide
//! pause/user-interject gate with the turn engine (defined in
//! `roundtable-sync` since both layers depend on it).

pub mod manager;

pub use manager::{TickOutcome, TurnManager};
