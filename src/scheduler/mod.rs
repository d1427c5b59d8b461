//! Process scheduling: bounded-concurrency queue plus the subprocess
//! executor that wires each agent run to a fresh parser + watchdog pair.

pub mod executor;
pub mod queue;

pub use executor::{AgentExecutor, ExecutionHooks, ExecutionRequest, ExecutionResult};
pub use queue::ExecutionQueue;
