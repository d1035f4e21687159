//! In-process topic-based publish/subscribe message bus.
//!
//! Subscriptions are keyed by [`Selector`] (receiver role, message type, or
//! wildcard). Delivery is per-subscriber FIFO and best-effort: a panicking
//! or error-returning subscriber is logged and does not affect delivery to
//! anyone else, and messages are not durable across a process restart (see
//! `crucible-checkpoint` for workflow state recovery).

mod bus;
mod message;

pub use bus::{FnSubscriber, MessageBus, Subscriber};
pub use message::{Message, MessageType, Participant, Selector};
