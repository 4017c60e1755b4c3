pub mod google;
pub mod openai;
mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::{AgentError, ProviderError};
use crate::tools::Tool;

pub use google::{GoogleProvider, GoogleProviderConfig};
pub use openai::{OpenAiProvider, OpenAiProviderConfig};

/// A model-issued request to invoke a tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    /// Raw JSON arguments, passed to the tool handler untouched.
    pub arguments: String,
    /// Provider-assigned correlation id, echoed back with the tool output.
    pub call_id: String,
}

impl ToolCall {
    pub fn new(
        name: impl Into<String>,
        arguments: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
            call_id: call_id.into(),
        }
    }
}

/// Incremental output of a streaming round.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    TextDone(String),
    ToolCall(ToolCall),
    Error(AgentError),
    Done,
}

pub type EventStream = BoxStream<'static, StreamEvent>;

/// What a single round sends to the model.
#[derive(Clone, Copy, Debug)]
pub enum ProviderInput<'a, H> {
    /// First turn of a conversation: just the prompt.
    Prompt(&'a str),
    /// Every later turn: the full history, prompt included.
    History(&'a [H]),
}

/// Adapter over one vendor's request/response protocol.
///
/// The agent never looks inside requests, responses or history items; it only threads
/// them between these operations.
#[async_trait]
pub trait Provider: Send + Sync {
    type Request: Send + 'static;
    type Response: Send;
    type ToolSchema: Clone + Send + Sync;
    type HistoryItem: Clone + Send + Sync + 'static;

    fn convert_tool(&self, tool: &Tool) -> Self::ToolSchema;

    fn build_request(
        &self,
        input: ProviderInput<'_, Self::HistoryItem>,
        instructions: Option<&str>,
        tools: &[Self::ToolSchema],
    ) -> Self::Request;

    async fn create_response(&self, request: Self::Request)
    -> Result<Self::Response, ProviderError>;

    fn extract_tool_calls(&self, response: &Self::Response) -> Result<Vec<ToolCall>, ProviderError>;

    fn extract_text(&self, response: &Self::Response) -> String;

    fn create_user_message(&self, text: &str) -> Self::HistoryItem;

    fn create_assistant_message(&self, text: &str) -> Self::HistoryItem;

    fn create_function_call_input(&self, call: &ToolCall) -> Self::HistoryItem;

    fn create_function_call_output(&self, call_id: &str, output: &str) -> Self::HistoryItem;

    /// Streaming capability, if this provider has one.
    fn streaming(&self) -> Option<&dyn StreamProvider<Self::Request>> {
        None
    }
}

#[async_trait]
pub trait StreamProvider<R: Send + 'static>: Send + Sync {
    /// Opens one streaming round. Failures after the stream is open arrive as
    /// [`StreamEvent::Error`].
    async fn create_response_stream(&self, request: R) -> Result<EventStream, ProviderError>;
}
