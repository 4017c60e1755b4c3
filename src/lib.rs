//! Provider-agnostic agent loop for tool-calling LLMs.
//!
//! Surface:
//! - `Agent` with a bounded tool-calling loop (`run`) and an event stream variant (`run_stream`)
//! - concurrent tool dispatch with history committed in call order
//! - `Agent::as_tool` to delegate to sub-agents
//! - OpenAI Responses (`OpenAiProvider`) and Gemini (`GoogleProvider`) adapters

pub mod agent;
pub mod error;
pub mod llm;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, RunResult};
pub use error::{AgentError, ProviderError, SchemaError, ToolError};
pub use llm::{
    EventStream, GoogleProvider, GoogleProviderConfig, OpenAiProvider, OpenAiProviderConfig,
    Provider, ProviderInput, StreamEvent, StreamProvider, ToolCall,
};
pub use tools::Tool;
