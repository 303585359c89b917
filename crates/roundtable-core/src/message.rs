use serde::{Deserialize, Serialize};

/// A role in the conversation, from the perspective of whichever agent is
/// about to see the message rendered into its own history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An immutable chat room record.
///
/// Exactly one of `to` (direct recipient) or broadcast (no `to`) applies —
/// see [`ChatRoom::broadcast`](crate::room::ChatRoom::broadcast) and
/// [`ChatRoom::send_to`](crate::room::ChatRoom::send_to). `seq` is assigned
/// monotonically by the room that created the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub ts_ms: i64,
    pub from: String,
    pub to: Option<String>,
    pub role: Role,
    pub content: String,
    /// Set when `role == Role::Tool`: the tool call this message answers.
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub reasoning: Option<String>,
    pub read: bool,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}
