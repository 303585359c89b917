use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

struct Inner {
    in_flight: usize,
    cap: usize,
    cool_until: Instant,
}

/// Strict single-flight gate around outbound LLM calls, with a cooldown
/// after every release to defuse request stampedes.
///
/// `acquire` serializes competing callers behind an internal barrier
/// (`serializer`) so only one caller advances through the cap/cooldown
/// check at a time; callers that lose the race wait their turn rather than
/// busy-polling concurrently.
pub struct TransportGate {
    state: Mutex<Inner>,
    serializer: Mutex<()>,
    notify: Notify,
    cooldown: Duration,
}

impl TransportGate {
    pub fn new(cap: usize, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Inner {
                in_flight: 0,
                cap: cap.max(1),
                cool_until: Instant::now(),
            }),
            serializer: Mutex::new(()),
            notify: Notify::new(),
            cooldown,
        })
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    /// True while the gate is within its post-release cooldown window.
    pub async fn cooling(&self) -> bool {
        Instant::now() < self.state.lock().await.cool_until
    }

    /// Acquire a single-flight slot, waiting for capacity and cooldown.
    pub async fn acquire(self: &Arc<Self>, label: impl Into<String>) -> GateGuard {
        let label = label.into();
        // Held for the whole wait loop: only one caller advances at a time.
        let _serial = self.serializer.lock().await;

        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                if now >= st.cool_until && st.in_flight < st.cap {
                    st.in_flight += 1;
                    debug!(label = %label, in_flight = st.in_flight, "transport gate: acquired");
                    None
                } else {
                    Some(st.cool_until.saturating_duration_since(now))
                }
            };

            let Some(wait) = wait else {
                break;
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
            }
        }

        GateGuard {
            gate: self.clone(),
            label,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn release(&self, label: &str) {
        let mut st = self.state.lock().await;
        st.in_flight = st.in_flight.saturating_sub(1);
        st.cool_until = Instant::now() + self.cooldown;
        drop(st);
        debug!(label = %label, "transport gate: released, cooldown started");
        self.notify.notify_waiters();
    }

    /// Safe wrapper: runs `f` under the gate, guaranteeing release on every
    /// exit path (including the future being dropped/cancelled).
    pub async fn run<F, Fut, T>(self: &Arc<Self>, label: impl Into<String>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(label).await;
        let result = f().await;
        guard.release().await;
        result
    }
}

/// RAII guard for one in-flight slot. Released explicitly via
/// [`GateGuard::release`], or on drop (e.g. on panic) as a fallback.
pub struct GateGuard {
    gate: Arc<TransportGate>,
    label: String,
    released: Arc<AtomicBool>,
}

impl GateGuard {
    pub async fn release(self) {
        self.released.store(true, Ordering::SeqCst);
        self.gate.release(&self.label).await;
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let gate = self.gate.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            warn!(label = %label, "transport gate: guard dropped without explicit release");
            gate.release(&label).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn single_flight_invariant() {
        let gate = TransportGate::new(1, Duration::from_millis(10));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                gate.run(format!("job-{i}"), || async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_enforces_minimum_gap() {
        let gate = TransportGate::new(1, Duration::from_millis(30));
        let start = Instant::now();
        gate.run("first", || async {}).await;
        gate.run("second", || async {}).await;
        assert!(start.elapsed() >= Duration::from_millis(28));
    }
}
