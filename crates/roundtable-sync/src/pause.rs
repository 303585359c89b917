//! Process-wide pause/user-interject gate, consulted by both the scheduler
//! and the turn engine. Lives alongside [`crate::ChannelLock`] and
//! [`crate::TransportGate`] rather than in either of its consumer crates,
//! since both need the same shared instance and layering forbids the turn
//! engine depending on the scheduler crate.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Tracks whether the room is paused, and the window during which a user's
/// own message should hold agents back so they don't talk over them.
pub struct PauseController {
    paused: AtomicBool,
    user_control_until_ms: AtomicI64,
    user_interrupt_ts_ms: AtomicI64,
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseController {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            user_control_until_ms: AtomicI64::new(i64::MIN / 2),
            user_interrupt_ts_ms: AtomicI64::new(i64::MIN / 2),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// The UI layer calls this when opening the interjection prompt, with a
    /// TTL (e.g. `now + 2000`), and again with `now` to clear it early.
    pub fn set_user_control_until(&self, until_ms: i64) {
        self.user_control_until_ms.store(until_ms, Ordering::SeqCst);
    }

    pub fn user_control_active(&self, now_ms: i64) -> bool {
        now_ms < self.user_control_until_ms.load(Ordering::SeqCst)
    }

    pub fn record_user_interrupt(&self, now_ms: i64) {
        self.user_interrupt_ts_ms.store(now_ms, Ordering::SeqCst);
    }

    /// TurnEngine's additional yield condition: a user interjection landed
    /// within `window_ms` (1500ms by default).
    pub fn recently_interjected(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms - self.user_interrupt_ts_ms.load(Ordering::SeqCst) < window_ms
    }

    /// TurnManager's tick-entry gate: paused, or user control is active.
    pub fn scheduler_should_skip(&self, now_ms: i64) -> bool {
        self.is_paused() || self.user_control_active(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume_toggle() {
        let ctl = PauseController::new();
        assert!(!ctl.is_paused());
        ctl.pause();
        assert!(ctl.is_paused());
        ctl.resume();
        assert!(!ctl.is_paused());
    }

    #[test]
    fn user_control_expires() {
        let ctl = PauseController::new();
        ctl.set_user_control_until(1_000);
        assert!(ctl.user_control_active(500));
        assert!(!ctl.user_control_active(1_000));
    }

    #[test]
    fn interjection_window_expires() {
        let ctl = PauseController::new();
        ctl.record_user_interrupt(1_000);
        assert!(ctl.recently_interjected(1_400, 1500));
        assert!(!ctl.recently_interjected(3_000, 1500));
    }

    #[test]
    fn scheduler_skip_reflects_either_condition() {
        let ctl = PauseController::new();
        assert!(!ctl.scheduler_should_skip(0));
        ctl.set_user_control_until(500);
        assert!(ctl.scheduler_should_skip(100));
        assert!(!ctl.scheduler_should_skip(600));
    }
}
