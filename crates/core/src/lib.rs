// Core of the Toolgate tool-calling gateway: upstream streaming, action
// extraction, tool registry and the orchestration loop

pub mod config;
pub mod error;
pub mod extractor;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod sandbox;
pub mod types;
pub mod upstream;

pub use config::{
    CircuitBreakerConfig, GenerationOverrides, OrchestratorConfig, RetryPolicy, UpstreamConfig,
};
pub use error::{GatewayError, GatewayResult};
pub use extractor::ActionExtractor;
pub use orchestrator::{tool_preamble, LoopOutcome, Orchestrator};
pub use registry::{Tool, ToolRegistry};
pub use resilience::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use sandbox::Sandbox;
pub use types::*;
pub use upstream::{ChatBackend, NormalizedStream, OpenAiBackend};
