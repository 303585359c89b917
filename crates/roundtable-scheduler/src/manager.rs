//! Ticked round-robin scheduler: a single periodic timer picks at most one
//! agent per tick, respecting backpressure, per-agent idle/proactive timing,
//! and the global pause/user-interject gate. A starvation guard pokes every
//! agent with a synthetic `(resume)` message if the whole room goes quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use roundtable_core::RoundtableConfig;
use roundtable_turn::{TurnEngine, TurnResult};

/// Outcome of one [`TurnManager::tick`] call, mostly useful for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// This agent was picked and its turn was spawned.
    Scheduled(String),
    /// No agent was eligible this tick.
    NoneEligible,
    /// The tick itself was skipped (global pause, user control window, or
    /// the transport gate is at capacity and cooling).
    Skipped,
}

struct AgentSched {
    last_probe_ms: i64,
    last_idle_ms: i64,
    running: bool,
}

impl AgentSched {
    fn new() -> Self {
        Self {
            last_probe_ms: 0,
            last_idle_ms: i64::MIN / 2,
            running: false,
        }
    }
}

struct ManagerState {
    agents: HashMap<String, AgentSched>,
    order: Vec<String>,
    last_index: usize,
    last_any_work_ts_ms: i64,
}

/// Round-robin turn scheduler. Cheap to clone — every field is an `Arc`;
/// spawned turn tasks hold their own clone so the tick loop never blocks
/// on a running turn.
#[derive(Clone)]
pub struct TurnManager {
    engine: Arc<TurnEngine>,
    config: Arc<RoundtableConfig>,
    system_prompt: Arc<String>,
    state: Arc<Mutex<ManagerState>>,
}

impl TurnManager {
    pub fn new(
        engine: Arc<TurnEngine>,
        config: Arc<RoundtableConfig>,
        agent_order: Vec<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let agents = agent_order
            .iter()
            .map(|id| (id.clone(), AgentSched::new()))
            .collect();
        // So the first tick's scan starts at index 0: round-robin advances
        // from "the last-scheduled index", and none has run yet.
        let last_index = agent_order.len().saturating_sub(1);
        Self {
            engine,
            config,
            system_prompt: Arc::new(system_prompt.into()),
            state: Arc::new(Mutex::new(ManagerState {
                agents,
                order: agent_order,
                last_index,
                last_any_work_ts_ms: i64::MIN / 2,
            })),
        }
    }

    pub fn pause(&self) {
        self.engine.pause.pause();
    }

    pub fn resume(&self) {
        self.engine.pause.resume();
    }

    /// Run one scheduling tick. Selects at most one eligible agent starting
    /// the scan just after the last-scheduled index, and spawns its turn.
    /// Never blocks on the turn itself.
    pub async fn tick(&self, now_ms: i64) -> TickOutcome {
        if self.engine.pause.scheduler_should_skip(now_ms) {
            return TickOutcome::Skipped;
        }

        // Backpressure: while the gate is cooling down from its last
        // release, don't schedule anyone — queuing a turn here would just
        // immediately block on the gate. `cooling()` alone is the signal:
        // by the time it's true, `release()` has already dropped
        // `in_flight` back down, so an `at_capacity &&` conjunction would
        // never fire at the default `transport_cap == 1`.
        if self.engine.gate.cooling().await {
            return TickOutcome::Skipped;
        }

        let n = {
            let state = self.state.lock().await;
            state.order.len()
        };
        if n == 0 {
            return TickOutcome::NoneEligible;
        }

        let fresh = self.engine.room.has_fresh_user_message(now_ms);
        let start_index = {
            let state = self.state.lock().await;
            (state.last_index + 1) % n
        };

        for offset in 0..n {
            let idx = (start_index + offset) % n;
            let agent_id = {
                let state = self.state.lock().await;
                state.order[idx].clone()
            };

            {
                let state = self.state.lock().await;
                if state.agents.get(&agent_id).map(|s| s.running).unwrap_or(false) {
                    continue;
                }
            }

            let Some(handle) = self.engine.room.agent_handle(&agent_id) else {
                continue;
            };
            let (has_unread, incoming_from) = {
                let agent = handle.lock().await;
                (agent.has_unread(), agent.peek_unread_from())
            };

            let (last_probe_ms, last_idle_ms) = {
                let state = self.state.lock().await;
                let s = state.agents.get(&agent_id).expect("agent registered at construction");
                (s.last_probe_ms, s.last_idle_ms)
            };

            if now_ms - last_idle_ms < self.config.scheduler.idle_backoff_ms as i64 {
                continue;
            }

            let proactive_due = now_ms - last_probe_ms >= self.config.scheduler.proactive_ms as i64;
            if !(has_unread || fresh || proactive_due) {
                continue;
            }

            {
                let mut state = self.state.lock().await;
                state.last_index = idx;
                state.last_any_work_ts_ms = now_ms;
                if let Some(s) = state.agents.get_mut(&agent_id) {
                    s.running = true;
                }
            }

            self.spawn_turn(agent_id.clone(), incoming_from, now_ms);
            return TickOutcome::Scheduled(agent_id);
        }

        TickOutcome::NoneEligible
    }

    fn spawn_turn(&self, agent_id: String, incoming_from: Option<String>, now_ms: i64) {
        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_turn(agent_id, incoming_from, now_ms).await;
        });
    }

    async fn run_turn(&self, agent_id: String, incoming_from: Option<String>, now_ms: i64) {
        let engine = self.engine.clone();
        let system_prompt = self.system_prompt.clone();
        let turn_timeout = Duration::from_millis(self.config.scheduler.turn_timeout_ms);
        let agent_for_task = agent_id.clone();
        let from_for_task = incoming_from.clone();

        let handle = tokio::spawn(async move {
            engine
                .receive(&agent_for_task, &system_prompt, from_for_task.as_deref(), now_ms)
                .await
        });

        let result = tokio::select! {
            res = handle => res.unwrap_or(TurnResult::LockTimeout),
            _ = tokio::time::sleep(turn_timeout) => {
                warn!(agent_id = %agent_id, timeout_ms = turn_timeout.as_millis(), "turn manager: watchdog fired, aborting current turn");
                self.engine.transport.interrupt_chat().await;
                TurnResult::LockTimeout
            }
        };

        let mut state = self.state.lock().await;
        if let Some(s) = state.agents.get_mut(&agent_id) {
            s.running = false;
            match result {
                TurnResult::Ran => s.last_probe_ms = now_ms,
                TurnResult::Enqueued | TurnResult::LockTimeout => s.last_idle_ms = now_ms,
            }
        }
    }

    /// Starvation guard: if nothing has happened room-wide for
    /// `poke_after_ms`, inject a synthetic `(resume)` user broadcast so
    /// every agent wakes up. Exposed standalone so tests can drive it
    /// without running the full tick loop.
    pub async fn poke_if_idle(&self, now_ms: i64) -> bool {
        let poke_after_ms = self.config.scheduler.poke_after_ms as i64;
        let proactive_ms = self.config.scheduler.proactive_ms as i64;

        let (idle_for, should_poke, should_reset_probes) = {
            let mut state = self.state.lock().await;
            let idle_for = now_ms - state.last_any_work_ts_ms;
            let should_poke = idle_for >= poke_after_ms;
            if should_poke {
                state.last_any_work_ts_ms = now_ms;
            }
            let should_reset_probes = idle_for > 5000i64.max(2 * proactive_ms);
            if should_reset_probes {
                for s in state.agents.values_mut() {
                    s.last_probe_ms = 0;
                }
            }
            (idle_for, should_poke, should_reset_probes)
        };

        if should_reset_probes {
            info!(idle_ms = idle_for, "turn manager: resetting proactive probes after extended idle");
        }

        if should_poke {
            warn!(idle_ms = idle_for, "watchdog: idle — poked");
            self.engine.room.broadcast("User", "(resume)", now_ms).await;
        }

        should_poke
    }

    /// Run the tick loop forever at `scheduler.tick_ms` cadence, until
    /// `shutdown` reports `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.scheduler.tick_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let _ = self.tick(now_ms).await;
                    self.poke_if_idle(now_ms).await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("turn manager: shutdown signal received, stopping tick loop");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use roundtable_core::{Agent, ChatRoom};
    use roundtable_sync::{ChannelLock, PauseController, TransportGate};
    use roundtable_text::DetectorRegistry;
    use roundtable_tools::{LocalFileWriter, LocalToolAdapter};
    use roundtable_transport::ChatTransport;

    fn test_engine(agent_ids: &[&str]) -> (Arc<TurnEngine>, Arc<RoundtableConfig>) {
        let config = Arc::new(RoundtableConfig::default());
        let room = Arc::new(ChatRoom::new(config.room.fresh_window_ms));
        for id in agent_ids {
            room.add_model(Agent::new(*id, "model-x", config.turn.soc_cap_chars)).unwrap();
        }
        let lock = ChannelLock::new(StdDuration::from_millis(config.sync.lock_max_ms));
        let gate = TransportGate::new(
            config.sync.transport_cap,
            StdDuration::from_millis(config.sync.transport_cooldown_ms),
        );
        let transport = Arc::new(ChatTransport::new(
            vec!["http://127.0.0.1:0".to_string()],
            vec![StdDuration::from_millis(1)],
        ));
        let engine = Arc::new(TurnEngine {
            room,
            lock,
            gate,
            transport,
            tool_adapter: Arc::new(LocalToolAdapter::default()),
            file_writer: Arc::new(LocalFileWriter::new(std::env::temp_dir())),
            detectors: Arc::new(DetectorRegistry::default_panel()),
            pause: Arc::new(PauseController::new()),
            tools: Arc::new(Vec::new()),
            config: config.clone(),
        });
        (engine, config)
    }

    #[tokio::test]
    async fn pause_blocks_every_tick() {
        let (engine, config) = test_engine(&["alice"]);
        let mgr = TurnManager::new(engine, config, vec!["alice".to_string()], "sys");
        mgr.pause();
        assert_eq!(mgr.tick(1_000).await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn round_robin_advances_past_scheduled_agent() {
        let (engine, config) = test_engine(&["alice", "bob"]);
        engine.room.broadcast("User", "kickoff", 0).await;
        let mgr = TurnManager::new(engine, config, vec!["alice".to_string(), "bob".to_string()], "sys");

        let first = mgr.tick(10).await;
        assert_eq!(first, TickOutcome::Scheduled("alice".to_string()));

        // Give the spawned turn a moment to mark itself not-running again.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let second = mgr.tick(20).await;
        assert_eq!(second, TickOutcome::Scheduled("bob".to_string()));
    }

    #[tokio::test]
    async fn poke_if_idle_broadcasts_resume_after_threshold() {
        let (engine, config) = test_engine(&["alice", "bob"]);
        let room = engine.room.clone();
        let mgr = TurnManager::new(engine, config.clone(), vec!["alice".to_string(), "bob".to_string()], "sys");

        let poked = mgr.poke_if_idle(config.scheduler.poke_after_ms as i64).await;
        assert!(poked);

        let alice = room.agent_handle("alice").unwrap();
        assert!(alice.lock().await.has_unread());
    }

    #[tokio::test]
    async fn no_agents_is_none_eligible() {
        let (engine, config) = test_engine(&[]);
        let mgr = TurnManager::new(engine, config, vec![], "sys");
        assert_eq!(mgr.tick(0).await, TickOutcome::NoneEligible);
    }

    #[tokio::test]
    async fn cooling_gate_defers_scheduling_even_with_fresh_message() {
        let (engine, config) = test_engine(&["alice"]);
        engine.room.broadcast("User", "kickoff", 0).await;
        // Put the gate into its post-release cooldown window without ever
        // touching `in_flight`, so `at_capacity` alone would be false.
        let guard = engine.gate.acquire("priming").await;
        guard.release().await;
        assert_eq!(engine.gate.in_flight().await, 0);
        assert!(engine.gate.cooling().await);

        let mgr = TurnManager::new(engine, config, vec!["alice".to_string()], "sys");
        assert_eq!(mgr.tick(10).await, TickOutcome::Skipped);
    }
}
