pub mod agent;
pub mod command;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod risk_gate;
pub mod synthesis;
pub mod tier;
pub mod trend;

pub mod test_support;

pub use agent::{Agent, AgentContext, Capabilities};
pub use command::{CommandAgent, CommandConfig};
pub use error::{AgentError, OrchestratorError, TierError};
pub use orchestrator::{Orchestrator, RunPhase, RunReport};
pub use registry::AgentRegistry;
pub use risk_gate::RiskGateAgent;
pub use synthesis::synthesize;
pub use tier::TierExecutor;
pub use trend::TrendAgent;
