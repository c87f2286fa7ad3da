// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve readability
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable
#![allow(clippy::redundant_closure)] // |x| f(x) can be clearer than f

// Module declarations
pub mod agent;
pub mod autoloop;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod ralph;
pub mod roadmap;
pub mod session;
pub mod settings;
pub mod shutdown;
pub mod storage;
pub mod tracker;
mod utils;

pub use error::{ForemanError, Result};
pub use models::*;

pub use agent::{AgentEvent, AgentLaunchSpec, ProcessAgent};
pub use autoloop::{LoopEvent, LoopOrchestrator, MilestoneExecutor, MilestoneRun};
pub use manager::{
    AgentExitInfo, AgentManager, ManagerEvent, ManagerMilestoneExecutor, StartAgentOptions,
    StartOutcome,
};
pub use queue::AgentQueue;
pub use ralph::RalphLoopService;
pub use session::SessionManager;
pub use settings::Settings;
pub use tracker::ProcessTracker;
