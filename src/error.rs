use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("failed to create response: {0}")]
    CreateResponse(#[source] ProviderError),
    #[error("failed to extract tool calls: {0}")]
    ExtractToolCalls(#[source] ProviderError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("tool {tool} failed: {source}")]
    ToolFailed {
        tool: String,
        #[source]
        source: ToolError,
    },
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("provider does not support streaming")]
    StreamingUnsupported,
    #[error("agent configuration error: {0}")]
    Config(String),
}
