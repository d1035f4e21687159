use uuid::Uuid;

/// Identifies one end-to-end workflow execution.
pub type WorkflowId = Uuid;
/// Identifies a task within a workflow's task list.
pub type TaskId = Uuid;
/// Identifies a message on the bus.
pub type MessageId = Uuid;
/// Identifies an active bus subscription, returned by `subscribe` and
/// consumed by `unsubscribe`.
pub type SubscriptionId = Uuid;
/// Correlates an `AGENT_REQUEST` with its `AGENT_RESPONSE`.
pub type CorrelationId = Uuid;

/// Generates a fresh random identifier. Thin wrapper kept so call sites read
/// `crucible_core::new_id()` rather than reaching for `uuid` directly.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
