use std::collections::HashMap;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::sse::data_payloads;
use crate::llm::{
    EventStream, Provider, ProviderInput, StreamEvent, StreamProvider, ToolCall,
};
use crate::tools::Tool;

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1";

#[derive(Debug, Clone)]
/// Runtime configuration for [`OpenAiProvider`].
pub struct OpenAiProviderConfig {
    /// OpenAI API key, sent as a bearer token.
    pub api_key: String,
    /// Model id (for example `gpt-4.1`).
    pub model: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional cap on generated tokens per response.
    pub max_output_tokens: Option<u32>,
    /// Whether the model may request several tool calls in one response.
    pub parallel_tool_calls: Option<bool>,
}

impl OpenAiProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_base_url: None,
            temperature: None,
            max_output_tokens: None,
            parallel_tool_calls: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn with_parallel_tool_calls(mut self, parallel_tool_calls: bool) -> Self {
        self.parallel_tool_calls = Some(parallel_tool_calls);
        self
    }
}

#[derive(Debug, Clone)]
/// OpenAI Responses API adapter implementing [`Provider`] and [`StreamProvider`].
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Creates a provider using `OPENAI_API_KEY` from the environment.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Request("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(OpenAiProviderConfig::new(api_key))
    }

    pub fn config(&self) -> &OpenAiProviderConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/responses")
    }

    async fn post(&self, request: &ResponsesRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(model = %request.model, endpoint = %self.endpoint(), stream = request.stream.unwrap_or(false), "sending responses request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        Ok(response)
    }
}

/// A conversation entry in Responses API `input` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: String,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseInput {
    Text(String),
    Items(Vec<InputItem>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: ResponseInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<FunctionTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<ResponseErrorBody>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Option<ResponseUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiApiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiApiError {
    #[serde(rename = "type")]
    type_: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    delta: String,
    #[serde(default)]
    text: String,
    item_id: Option<String>,
    item: Option<StreamItem>,
    name: Option<String>,
    arguments: Option<String>,
    code: Option<String>,
    message: Option<String>,
    response: Option<ResponsesResponse>,
}

#[derive(Debug, Deserialize)]
struct StreamItem {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    id: String,
    call_id: Option<String>,
    name: Option<String>,
}

#[async_trait]
impl Provider for OpenAiProvider {
    type Request = ResponsesRequest;
    type Response = ResponsesResponse;
    type ToolSchema = FunctionTool;
    type HistoryItem = InputItem;

    fn convert_tool(&self, tool: &Tool) -> FunctionTool {
        FunctionTool {
            type_: "function".to_string(),
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters().clone(),
            strict: true,
        }
    }

    fn build_request(
        &self,
        input: ProviderInput<'_, InputItem>,
        instructions: Option<&str>,
        tools: &[FunctionTool],
    ) -> ResponsesRequest {
        let input = match input {
            ProviderInput::Prompt(prompt) => ResponseInput::Text(prompt.to_string()),
            ProviderInput::History(items) => ResponseInput::Items(items.to_vec()),
        };

        ResponsesRequest {
            model: self.config.model.clone(),
            input,
            instructions: instructions
                .filter(|text| !text.is_empty())
                .map(str::to_string),
            tools: tools.to_vec(),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
            parallel_tool_calls: self.config.parallel_tool_calls,
            stream: None,
        }
    }

    async fn create_response(
        &self,
        request: ResponsesRequest,
    ) -> Result<ResponsesResponse, ProviderError> {
        self.post(&request)
            .await?
            .json::<ResponsesResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))
    }

    fn extract_tool_calls(
        &self,
        response: &ResponsesResponse,
    ) -> Result<Vec<ToolCall>, ProviderError> {
        if response.status.as_deref() == Some("failed") {
            let message = response
                .error
                .as_ref()
                .map(|error| error.message.clone())
                .unwrap_or_else(|| "response failed".to_string());
            return Err(ProviderError::Response(format!(
                "response {} failed: {message}",
                response.id
            )));
        }

        Ok(response
            .output
            .iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some(ToolCall::new(name, arguments, call_id)),
                _ => None,
            })
            .collect())
    }

    fn extract_text(&self, response: &ResponsesResponse) -> String {
        response
            .output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Message { content } => Some(content),
                _ => None,
            })
            .flatten()
            .filter_map(|content| match content {
                OutputContent::OutputText { text } => Some(text.as_str()),
                OutputContent::Other => None,
            })
            .collect()
    }

    fn create_user_message(&self, text: &str) -> InputItem {
        InputItem::Message {
            role: "user".to_string(),
            content: text.to_string(),
        }
    }

    fn create_assistant_message(&self, text: &str) -> InputItem {
        InputItem::Message {
            role: "assistant".to_string(),
            content: text.to_string(),
        }
    }

    fn create_function_call_input(&self, call: &ToolCall) -> InputItem {
        InputItem::FunctionCall {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }

    fn create_function_call_output(&self, call_id: &str, output: &str) -> InputItem {
        InputItem::FunctionCallOutput {
            call_id: call_id.to_string(),
            output: output.to_string(),
        }
    }

    fn streaming(&self) -> Option<&dyn StreamProvider<ResponsesRequest>> {
        Some(self)
    }
}

#[async_trait]
impl StreamProvider<ResponsesRequest> for OpenAiProvider {
    async fn create_response_stream(
        &self,
        mut request: ResponsesRequest,
    ) -> Result<EventStream, ProviderError> {
        request.stream = Some(true);
        let response = self.post(&request).await?;
        Ok(Box::pin(stream_events(data_payloads(response.bytes_stream()))))
    }
}

fn stream_events<S>(payloads: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<String, ProviderError>>,
{
    stream! {
        let mut payloads = Box::pin(payloads);
        let mut pending: HashMap<String, ToolCall> = HashMap::new();

        while let Some(payload) = payloads.next().await {
            let payload = match payload {
                Ok(payload) => payload,
                Err(err) => {
                    yield StreamEvent::Error(err.into());
                    return;
                }
            };

            let Ok(event) = serde_json::from_str::<StreamPayload>(&payload) else {
                continue;
            };

            match event.type_.as_str() {
                "response.output_text.delta" => {
                    yield StreamEvent::TextDelta(event.delta);
                }
                "response.output_text.done" => {
                    yield StreamEvent::TextDone(event.text);
                }
                "response.output_item.added" => {
                    if let Some(item) = event.item {
                        if item.type_ == "function_call" {
                            pending.insert(
                                item.id,
                                ToolCall::new(
                                    item.name.unwrap_or_default(),
                                    String::new(),
                                    item.call_id.unwrap_or_default(),
                                ),
                            );
                        }
                    }
                }
                "response.function_call_arguments.done" => {
                    let call = event.item_id.and_then(|item_id| pending.remove(&item_id));
                    if let Some(mut call) = call {
                        call.arguments = event.arguments.unwrap_or_default();
                        if let Some(name) = event.name.filter(|name| !name.is_empty()) {
                            call.name = name;
                        }
                        yield StreamEvent::ToolCall(call);
                    }
                }
                "response.completed" => {
                    yield StreamEvent::Done;
                    return;
                }
                "response.incomplete" => {
                    let reason = event
                        .response
                        .and_then(|response| response.incomplete_details)
                        .and_then(|details| details.reason)
                        .unwrap_or_else(|| "unknown".to_string());
                    let message = format!("response incomplete: {reason}");
                    yield StreamEvent::Error(ProviderError::Stream(message).into());
                    return;
                }
                "response.failed" => {
                    let message = event
                        .response
                        .and_then(|response| response.error)
                        .map(|error| error.message)
                        .unwrap_or_else(|| "response failed".to_string());
                    yield StreamEvent::Error(ProviderError::Stream(message).into());
                    return;
                }
                "error" => {
                    let message = format!(
                        "{}: {}",
                        event.code.unwrap_or_default(),
                        event.message.unwrap_or_default()
                    );
                    yield StreamEvent::Error(ProviderError::Stream(message).into());
                    return;
                }
                _ => {}
            }
        }

        yield StreamEvent::Error(
            ProviderError::Stream("stream ended before response.completed".to_string()).into(),
        );
    }
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<OpenAiErrorEnvelope>(&body) {
        let type_name = parsed
            .error
            .type_
            .unwrap_or_else(|| "api_error".to_string());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown openai api error".to_string());
        return format!("openai api error {} {type_name}: {message}", status.as_u16());
    }

    if body.is_empty() {
        format!("openai api request failed ({status})")
    } else {
        format!("openai api request failed ({status}): {body}")
    }
}
