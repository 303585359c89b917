use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::agent::Agent;
use crate::error::{Result, RoundtableError};
use crate::message::{Message, Role};

/// Shared handle to one agent's state. Each agent's context/inbox is owned
/// by that agent — the room only ever reaches it through this handle's
/// `receive` hook, never by mutating fields directly.
pub type AgentHandle = Arc<AsyncMutex<Agent>>;

/// Addressed message bus between agents.
///
/// Default-to-group routing: a message with no recipient fans out to every
/// agent except the sender. A message with an unknown recipient is dropped
/// silently — the caller is authoritative for addressing.
pub struct ChatRoom {
    agents: std::sync::Mutex<HashMap<String, AgentHandle>>,
    seq: AtomicU64,
    last_user_ts_ms: AtomicI64,
    fresh_window_ms: i64,
}

impl ChatRoom {
    pub fn new(fresh_window_ms: i64) -> Self {
        Self {
            agents: std::sync::Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            last_user_ts_ms: AtomicI64::new(i64::MIN / 2),
            fresh_window_ms,
        }
    }

    /// Register an agent. Rejects a duplicate id.
    pub fn add_model(&self, agent: Agent) -> Result<AgentHandle> {
        let id = agent.id.clone();
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(&id) {
            return Err(RoundtableError::DuplicateAgent { id });
        }
        let handle = Arc::new(AsyncMutex::new(agent));
        agents.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn agent_handle(&self, id: &str) -> Option<AgentHandle> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All registered agent ids, in insertion-independent (HashMap) order.
    /// Callers that need a stable scheduling order should sort this.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn touch_user_freshness(&self, from: &str, now_ms: i64) {
        if from.eq_ignore_ascii_case("user") || from.eq_ignore_ascii_case("system") {
            self.last_user_ts_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    /// Fan out to every agent except `from`. Delivery is best-effort: a
    /// failing recipient is logged and skipped, never aborting the rest of
    /// the fan-out.
    pub async fn broadcast(&self, from: &str, content: &str, now_ms: i64) {
        self.touch_user_freshness(from, now_ms);
        let targets: Vec<(String, AgentHandle)> = {
            let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
            agents
                .iter()
                .filter(|(id, _)| id.as_str() != from)
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect()
        };

        for (id, handle) in targets {
            let seq = self.next_seq();
            let message = Message {
                seq,
                ts_ms: now_ms,
                from: from.to_string(),
                to: None,
                role: if from.eq_ignore_ascii_case("system") {
                    Role::System
                } else {
                    Role::User
                },
                content: content.to_string(),
                tool_call_id: None,
                tool_name: None,
                reasoning: None,
                read: false,
            };
            let mut agent = handle.lock().await;
            if agent.id != id {
                warn!(target = %id, "room: agent handle id mismatch, skipping delivery");
                continue;
            }
            agent.receive(message);
        }
    }

    /// Deliver to a single recipient. Silently dropped if `to` is unknown or
    /// equals `from` (a room never echoes to the sender).
    pub async fn send_to(&self, from: &str, to: &str, content: &str, now_ms: i64) {
        self.touch_user_freshness(from, now_ms);
        if from == to {
            return;
        }
        let handle = match self.agent_handle(to) {
            Some(h) => h,
            None => {
                warn!(recipient = %to, "room: dropping message to unknown recipient");
                return;
            }
        };
        let seq = self.next_seq();
        let message = Message {
            seq,
            ts_ms: now_ms,
            from: from.to_string(),
            to: Some(to.to_string()),
            role: if from.eq_ignore_ascii_case("system") {
                Role::System
            } else {
                Role::User
            },
            content: content.to_string(),
            tool_call_id: None,
            tool_name: None,
            reasoning: None,
            read: false,
        };
        handle.lock().await.receive(message);
    }

    /// True if a user/system broadcast landed within the freshness window.
    pub fn has_fresh_user_message(&self, now_ms: i64) -> bool {
        now_ms - self.last_user_ts_ms.load(Ordering::SeqCst) < self.fresh_window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> Agent {
        Agent::new(id, "model-x", 1024)
    }

    #[tokio::test]
    async fn broadcast_never_echoes_to_sender() {
        let room = ChatRoom::new(2000);
        room.add_model(agent("alice")).unwrap();
        room.add_model(agent("bob")).unwrap();
        room.add_model(agent("carol")).unwrap();

        room.broadcast("alice", "hello", 0).await;

        let alice = room.agent_handle("alice").unwrap();
        assert!(!alice.lock().await.has_unread());
        let bob = room.agent_handle("bob").unwrap();
        assert!(bob.lock().await.has_unread());
        let carol = room.agent_handle("carol").unwrap();
        assert!(carol.lock().await.has_unread());
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase() {
        let room = ChatRoom::new(2000);
        room.add_model(agent("alice")).unwrap();
        room.add_model(agent("bob")).unwrap();

        room.broadcast("alice", "one", 0).await;
        room.broadcast("alice", "two", 0).await;

        let bob = room.agent_handle("bob").unwrap();
        let drained = bob.lock().await.drain_unread();
        assert!(drained[0].seq < drained[1].seq);
    }

    #[tokio::test]
    async fn unknown_recipient_is_dropped_silently() {
        let room = ChatRoom::new(2000);
        room.add_model(agent("alice")).unwrap();
        room.send_to("alice", "ghost", "hi", 0).await;
        // No panic, no agent created — nothing to assert on but absence of a crash.
        assert_eq!(room.agent_ids().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_agent_id_rejected() {
        let room = ChatRoom::new(2000);
        room.add_model(agent("alice")).unwrap();
        let err = room.add_model(agent("alice")).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_AGENT");
    }

    #[tokio::test]
    async fn freshness_window_expires() {
        let room = ChatRoom::new(100);
        room.add_model(agent("alice")).unwrap();
        room.add_model(agent("bob")).unwrap();
        room.broadcast("User", "kickoff", 1_000).await;
        assert!(room.has_fresh_user_message(1_050));
        assert!(!room.has_fresh_user_message(1_200));
    }
}
