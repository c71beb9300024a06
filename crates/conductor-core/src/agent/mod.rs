//! Agent lifecycle management
//!
//! This module handles:
//! - Agent records and status bookkeeping (registry)
//! - Building the CLI invocation for an agent (command)
//! - Spawning, feeding and terminating agent processes (process, supervisor)
//! - Turning free-form output into status hints (classifier)

pub mod classifier;
mod command;
mod process;
mod registry;
mod supervisor;

pub use classifier::{
    AwaitingInputRule, BlankChunkRule, Classification, ClassifierRule, ResumedOutputRule,
    RuleClassifier, StatusClassifier, ToolInvocationRule, Verdict,
};
pub use command::LaunchSpec;
pub use registry::AgentRegistry;
pub use supervisor::ProcessSupervisor;
