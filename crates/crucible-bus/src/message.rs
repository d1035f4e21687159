use chrono::{DateTime, Utc};
use crucible_core::{AgentRole, CorrelationId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who sent a [`Message`]: a specific agent role, the orchestrator itself,
/// or an end user providing feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    /// A specific agent role.
    Agent(AgentRole),
    /// The workflow orchestrator.
    Workflow,
    /// The end user.
    User,
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Participant::Agent(role) => write!(f, "{role}"),
            Participant::Workflow => write!(f, "workflow"),
            Participant::User => write!(f, "user"),
        }
    }
}

/// The closed set of message types that flow across the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    AgentRequest,
    AgentResponse,
    TaskAssigned,
    TaskComplete,
    StageStart,
    StageComplete,
    UserFeedback,
    WorkflowCanceled,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::AgentRequest => "AGENT_REQUEST",
            MessageType::AgentResponse => "AGENT_RESPONSE",
            MessageType::TaskAssigned => "TASK_ASSIGNED",
            MessageType::TaskComplete => "TASK_COMPLETE",
            MessageType::StageStart => "STAGE_START",
            MessageType::StageComplete => "STAGE_COMPLETE",
            MessageType::UserFeedback => "USER_FEEDBACK",
            MessageType::WorkflowCanceled => "WORKFLOW_CANCELED",
        };
        write!(f, "{s}")
    }
}

/// A typed envelope carried on the [`crate::MessageBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// The message's type tag.
    pub message_type: MessageType,
    /// Who sent the message.
    pub sender: Participant,
    /// Who the message is addressed to, or `None` for a broadcast.
    pub receiver: Option<AgentRole>,
    /// Correlates an `AGENT_RESPONSE` with the `AGENT_REQUEST` it answers.
    pub correlation_id: CorrelationId,
    /// Arbitrary structured payload.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds a new message, generating a fresh id and correlation id and
    /// stamping the current time.
    pub fn new(
        message_type: MessageType,
        sender: Participant,
        receiver: Option<AgentRole>,
    ) -> Self {
        Self {
            id: crucible_core::new_id(),
            message_type,
            sender,
            receiver,
            correlation_id: crucible_core::new_id(),
            payload: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the correlation id, e.g. to match an `AGENT_RESPONSE` to the
    /// `AGENT_REQUEST` that triggered it.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attaches a payload entry, replacing the builder in place.
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// The set of topic selectors this message matches: the receiver-keyed
    /// selector (if addressed), the type-keyed selector, and the wildcard.
    pub(crate) fn matching_selectors(&self) -> Vec<Selector> {
        let mut selectors = vec![Selector::Type(self.message_type), Selector::Wildcard];
        if let Some(role) = self.receiver {
            selectors.push(Selector::Receiver(role));
        }
        selectors
    }
}

/// A subscription key: by receiver role, by message type, or the wildcard
/// matching every message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selector {
    /// `"receiver:<role>"` — messages addressed to this role.
    Receiver(AgentRole),
    /// `"type:<message-type>"` — messages of this type, regardless of receiver.
    Type(MessageType),
    /// `"type:*"` — every message.
    Wildcard,
}
