//! Role-specialized agents and their workflow graphs.
//!
//! Each role (team leader, business analyst, developer, tester) builds a
//! graph over `sy-graph` and exposes the common [`handler::AgentHandler`]
//! seam. The LLM boundary is [`provider::CompletionClient`]; tests run the
//! graphs against scripted clients and runners.

pub mod business_analyst;
pub mod developer;
pub mod handler;
pub mod personas;
pub mod provider;
pub mod team_leader;
pub mod tester;

mod util;

pub use business_analyst::BusinessAnalystAgent;
pub use developer::{DeveloperAgent, DeveloperConfig, RunReport, ScriptedRunner, TestRunner};
pub use handler::{AgentHandler, NoopProgress, ProgressSink};
pub use provider::{Completion, CompletionClient, CompletionRequest, ScriptedClient};
pub use team_leader::TeamLeaderAgent;
pub use tester::TesterAgent;
