//! Writing agents
//!
//! Thin prompt builders over the completion port. Each agent returns its
//! typed output plus the structured events it emitted.

pub mod characters;
pub mod outline;
pub mod writer;

pub use characters::{CharacterAgent, CharacterSheet};
pub use outline::OutlineAgent;
pub use writer::WriterAgent;

use crate::storage::AgentLog;

/// An agent's output together with its event-log entries
#[derive(Debug, Clone)]
pub struct AgentResult<T> {
    pub data: T,
    pub logs: Vec<AgentLog>,
}
