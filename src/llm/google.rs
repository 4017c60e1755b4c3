use std::collections::HashMap;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::sse::data_payloads;
use crate::llm::{EventStream, Provider, ProviderInput, StreamEvent, StreamProvider, ToolCall};
use crate::tools::Tool;

const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct GoogleProviderConfig {
    pub api_key: String,
    pub model: String,
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GoogleProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
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

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| {
                ProviderError::Request("GOOGLE_API_KEY (or GEMINI_API_KEY) is not set".to_string())
            })?;

        Self::new(GoogleProviderConfig::new(api_key))
    }

    pub fn config(&self) -> &GoogleProviderConfig {
        &self.config
    }

    fn endpoint(&self, method: &str) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/models/{}:{method}", self.config.model)
    }

    async fn post(
        &self,
        url: String,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        debug!(model = %self.config.model, endpoint = %url, "sending gemini request");

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
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

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GoogleTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// One conversation turn; also the history item type of [`GoogleProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part {
                text: Some(text.to_string()),
                ..Part::default()
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: Option<String>,
    pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleErrorEnvelope {
    error: GoogleApiError,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleApiError {
    code: Option<u16>,
    status: Option<String>,
    message: Option<String>,
}

impl GoogleApiError {
    fn describe(self, fallback_code: Option<u16>, fallback_status: &str) -> String {
        let code = self
            .code
            .or(fallback_code)
            .map(|code| format!("{code} "))
            .unwrap_or_default();
        let status = self.status.unwrap_or_else(|| fallback_status.to_string());
        let message = self
            .message
            .unwrap_or_else(|| "unknown google api error".to_string());
        format!("google api error {code}{status}: {message}")
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    type Request = GenerateContentRequest;
    type Response = GenerateContentResponse;
    type ToolSchema = FunctionDeclaration;
    type HistoryItem = Content;

    fn convert_tool(&self, tool: &Tool) -> FunctionDeclaration {
        FunctionDeclaration {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: clean_gemini_schema(tool.parameters().clone()),
        }
    }

    fn build_request(
        &self,
        input: ProviderInput<'_, Content>,
        instructions: Option<&str>,
        tools: &[FunctionDeclaration],
    ) -> GenerateContentRequest {
        let contents = match input {
            ProviderInput::Prompt(prompt) => vec![Content::text("user", prompt)],
            ProviderInput::History(items) => {
                let mut contents = items.to_vec();
                resolve_function_response_names(&mut contents);
                contents
            }
        };

        let tools = if tools.is_empty() {
            None
        } else {
            Some(vec![GoogleTool {
                function_declarations: tools.to_vec(),
            }])
        };

        GenerateContentRequest {
            contents,
            system_instruction: instructions.filter(|text| !text.is_empty()).map(|text| {
                SystemInstruction {
                    parts: vec![Part {
                        text: Some(text.to_string()),
                        ..Part::default()
                    }],
                }
            }),
            tools,
            generation_config: Some(GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                max_output_tokens: self.config.max_output_tokens,
            }),
        }
    }

    async fn create_response(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        self.post(self.endpoint("generateContent"), &request)
            .await?
            .json::<GenerateContentResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))
    }

    fn extract_tool_calls(
        &self,
        response: &GenerateContentResponse,
    ) -> Result<Vec<ToolCall>, ProviderError> {
        let Some(candidate) = response.candidates.first() else {
            return Err(ProviderError::Response(
                "google response missing candidates".to_string(),
            ));
        };

        let mut tool_calls = Vec::new();
        for part in candidate.content.iter().flat_map(|content| &content.parts) {
            if let Some(function_call) = &part.function_call {
                tool_calls.push(to_tool_call(function_call, tool_calls.len())?);
            }
        }

        Ok(tool_calls)
    }

    fn extract_text(&self, response: &GenerateContentResponse) -> String {
        response
            .candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|part| !part.thought.unwrap_or(false))
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    fn create_user_message(&self, text: &str) -> Content {
        Content::text("user", text)
    }

    fn create_assistant_message(&self, text: &str) -> Content {
        Content::text("model", text)
    }

    fn create_function_call_input(&self, call: &ToolCall) -> Content {
        let args = serde_json::from_str::<Value>(&call.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));

        Content {
            role: "model".to_string(),
            parts: vec![Part {
                function_call: Some(FunctionCall {
                    id: Some(call.call_id.clone()),
                    name: Some(call.name.clone()),
                    args: Some(args),
                }),
                ..Part::default()
            }],
        }
    }

    /// The response is named after the call id until the request is built, where the
    /// matching `functionCall` supplies the real function name.
    fn create_function_call_output(&self, call_id: &str, output: &str) -> Content {
        Content {
            role: "user".to_string(),
            parts: vec![Part {
                function_response: Some(FunctionResponse {
                    id: Some(call_id.to_string()),
                    name: call_id.to_string(),
                    response: tool_result_payload(output),
                }),
                ..Part::default()
            }],
        }
    }

    fn streaming(&self) -> Option<&dyn StreamProvider<GenerateContentRequest>> {
        Some(self)
    }
}

#[async_trait]
impl StreamProvider<GenerateContentRequest> for GoogleProvider {
    async fn create_response_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<EventStream, ProviderError> {
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(url, &request).await?;
        Ok(Box::pin(stream_events(data_payloads(response.bytes_stream()))))
    }
}

fn to_tool_call(function_call: &FunctionCall, position: usize) -> Result<ToolCall, ProviderError> {
    let Some(name) = function_call.name.clone() else {
        return Err(ProviderError::Response(
            "google functionCall missing name".to_string(),
        ));
    };

    let arguments = function_call
        .args
        .clone()
        .unwrap_or_else(|| json!({}))
        .to_string();
    let call_id = function_call
        .id
        .clone()
        .unwrap_or_else(|| format!("call_{}", position + 1));

    Ok(ToolCall::new(name, arguments, call_id))
}

/// Maps Gemini stream chunks to events. A round is only `Done` once a candidate reports
/// `STOP`; any other finish reason, an error payload or a body that just ends is an error.
fn stream_events<S>(payloads: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<String, ProviderError>>,
{
    stream! {
        let mut payloads = Box::pin(payloads);
        let mut full_text = String::new();
        let mut call_count = 0usize;
        let mut finish_reason: Option<String> = None;

        'read: while let Some(payload) = payloads.next().await {
            let payload = match payload {
                Ok(payload) => payload,
                Err(err) => {
                    yield StreamEvent::Error(err.into());
                    return;
                }
            };

            if let Ok(envelope) = serde_json::from_str::<GoogleErrorEnvelope>(&payload) {
                let message = envelope.error.describe(None, "UNKNOWN");
                yield StreamEvent::Error(ProviderError::Stream(message).into());
                return;
            }

            let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(&payload) else {
                continue;
            };

            for candidate in chunk.candidates {
                for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                    if let Some(text) = part.text {
                        if !part.thought.unwrap_or(false) && !text.is_empty() {
                            full_text.push_str(&text);
                            yield StreamEvent::TextDelta(text);
                        }
                    }

                    if let Some(function_call) = part.function_call {
                        match to_tool_call(&function_call, call_count) {
                            Ok(call) => {
                                call_count += 1;
                                yield StreamEvent::ToolCall(call);
                            }
                            Err(err) => {
                                yield StreamEvent::Error(err.into());
                                return;
                            }
                        }
                    }
                }

                if let Some(reason) = candidate.finish_reason {
                    finish_reason = Some(reason);
                    break 'read;
                }
            }
        }

        match finish_reason.as_deref() {
            Some("STOP") => {
                if !full_text.is_empty() {
                    yield StreamEvent::TextDone(full_text);
                }
                yield StreamEvent::Done;
            }
            Some(reason) => {
                let message = format!("gemini response finished early: {reason}");
                yield StreamEvent::Error(ProviderError::Stream(message).into());
            }
            None => {
                let message = "gemini stream ended without a finish reason".to_string();
                yield StreamEvent::Error(ProviderError::Stream(message).into());
            }
        }
    }
}

fn resolve_function_response_names(contents: &mut [Content]) {
    let mut names: HashMap<String, String> = HashMap::new();

    for part in contents.iter_mut().flat_map(|content| content.parts.iter_mut()) {
        if let Some(FunctionCall {
            id: Some(id),
            name: Some(name),
            ..
        }) = &part.function_call
        {
            names.insert(id.clone(), name.clone());
        }

        if let Some(response) = &mut part.function_response {
            if let Some(name) = response.id.as_ref().and_then(|id| names.get(id)) {
                response.name = name.clone();
            }
        }
    }
}

fn tool_result_payload(output: &str) -> Value {
    match serde_json::from_str::<Value>(output) {
        Ok(parsed) if parsed.is_object() => parsed,
        _ => json!({"result": output}),
    }
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<GoogleErrorEnvelope>(&body) {
        let fallback_status = status.to_string().to_uppercase();
        return parsed.error.describe(Some(status.as_u16()), &fallback_status);
    }

    if body.is_empty() {
        format!("google api request failed ({status})")
    } else {
        format!("google api request failed ({status}): {body}")
    }
}

const MAX_SCHEMA_DEPTH: usize = 32;

/// Rewrites a tool schema into the subset Gemini accepts: references inlined, no
/// `additionalProperties`/`default`/metadata `title`, and no object with empty `properties`.
fn clean_gemini_schema(mut schema: Value) -> Value {
    let defs = schema
        .as_object_mut()
        .and_then(|root| root.remove("$defs"))
        .and_then(|defs| match defs {
            Value::Object(defs) => Some(defs),
            _ => None,
        })
        .unwrap_or_default();

    clean_schema_node(&mut schema, &defs, None, 0);
    schema
}

fn clean_schema_node(node: &mut Value, defs: &Map<String, Value>, key: Option<&str>, depth: usize) {
    match node {
        Value::Object(map) => {
            // Entries of a `properties` map are property names, not schema keywords.
            if key != Some("properties") {
                if depth < MAX_SCHEMA_DEPTH {
                    for _ in 0..MAX_SCHEMA_DEPTH {
                        if !inline_ref(map, defs) {
                            break;
                        }
                    }
                }
                map.remove("$ref");
                map.remove("additionalProperties");
                map.remove("default");
                map.remove("title");
            }

            for (child_key, child) in map.iter_mut() {
                clean_schema_node(child, defs, Some(child_key.as_str()), depth + 1);
            }

            let is_object = map
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|kind| kind.eq_ignore_ascii_case("object"));
            let empty_properties = map
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(Map::is_empty);
            if is_object && empty_properties {
                map.insert(
                    "properties".to_string(),
                    json!({"_placeholder": {"type": "string"}}),
                );
            }
        }
        Value::Array(items) => {
            for item in items {
                clean_schema_node(item, defs, key, depth + 1);
            }
        }
        _ => {}
    }
}

/// Merges the referenced definition into `map`; keys already on `map` win.
fn inline_ref(map: &mut Map<String, Value>, defs: &Map<String, Value>) -> bool {
    let Some(Value::String(reference)) = map.remove("$ref") else {
        return false;
    };

    let name = reference.rsplit('/').next().unwrap_or_default();
    if let Some(Value::Object(definition)) = defs.get(name) {
        for (key, value) in definition {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    true
}
