//! Role-tagged participants that consume `ProjectState` and the
//! `Generator` capability to produce stage artifacts.
//!
//! One `Agent` struct, parameterized by `AgentRole` and a `&'static
//! RoleProfile`, plays all seven built-in roles: the profile supplies the
//! system prompt, capability list, responsible stages, and output
//! artifact/bucket keys, so behavior is data-driven rather than duplicated
//! across seven near-identical types.

mod agent;
mod context;
mod profiles;

pub use agent::{Agent, AgentOutputPayload};
pub use context::AgentContext;
pub use profiles::{profile_for, profiles, Capability, RoleProfile};
