//! Agent lifecycle and scheduling.
//!
//! [`controller::AgentController`] drives one agent's CLI process through
//! start, pause, resume, injection and stop. [`manager::AgentManager`] owns
//! every controller, keyed by agent name, and runs the periodic
//! orchestration cycle defined in [`cycle`] that matches idle agents to work.

pub mod controller;
pub mod cycle;
pub mod manager;
pub mod process;
pub mod types;
