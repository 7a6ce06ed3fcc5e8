//! Sandboxed evaluation of operator-supplied gating logic scripts.
//!
//! Scripts decide whether a matched `Trigger` actually fires. They see a
//! curated read-only view of the ledger and the cluster roster — never a
//! filesystem, network socket, environment variable, or subprocess handle.

mod context;
mod sandbox;

pub use context::{AgentSummary, LogicContext};
pub use sandbox::LogicSandbox;
