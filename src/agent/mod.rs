use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{AgentError, ToolError};
use crate::llm::{Provider, ProviderInput, StreamEvent, ToolCall};
use crate::tools::Tool;

const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on model rounds per run.
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
        }
    }
}

/// Outcome of a blocking run: the final text and the conversation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult<H> {
    pub text: String,
    pub history: Vec<H>,
}

pub struct AgentBuilder<P: Provider> {
    provider: P,
    tools: Vec<Tool>,
    config: AgentConfig,
    history: Vec<P::HistoryItem>,
}

impl<P: Provider> AgentBuilder<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            tools: Vec::new(),
            config: AgentConfig::default(),
            history: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Seed conversation every run starts from unless it is given its own history.
    pub fn history(mut self, history: Vec<P::HistoryItem>) -> Self {
        self.history = history;
        self
    }

    pub fn build(self) -> Result<Agent<P>, AgentError> {
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let mut tool_map = HashMap::new();
        for tool in &self.tools {
            if tool_map
                .insert(tool.name().to_string(), tool.clone())
                .is_some()
            {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        Ok(Agent {
            provider: Arc::new(self.provider),
            tools: self.tools,
            tool_map,
            config: self.config,
            seed_history: self.history,
        })
    }
}

/// Runs the prompt, tool calls, tool results loop against a [`Provider`].
///
/// An agent never mutates itself while running: each run works on its own copy of the
/// history, so one agent can serve concurrent runs.
pub struct Agent<P: Provider> {
    provider: Arc<P>,
    tools: Vec<Tool>,
    tool_map: HashMap<String, Tool>,
    config: AgentConfig,
    seed_history: Vec<P::HistoryItem>,
}

impl<P: Provider> Clone for Agent<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            tools: self.tools.clone(),
            tool_map: self.tool_map.clone(),
            config: self.config.clone(),
            seed_history: self.seed_history.clone(),
        }
    }
}

#[derive(Deserialize)]
struct DelegatedTask {
    task: String,
}

impl<P: Provider + 'static> Agent<P> {
    pub fn builder(provider: P) -> AgentBuilder<P> {
        AgentBuilder::new(provider)
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn seed_history(&self) -> &[P::HistoryItem] {
        &self.seed_history
    }

    pub async fn run(
        &self,
        prompt: impl Into<String>,
    ) -> Result<RunResult<P::HistoryItem>, AgentError> {
        self.run_inner(prompt.into(), None).await
    }

    /// Like [`Agent::run`], but starts from `history` instead of the seed history when it
    /// is non-empty.
    pub async fn run_with_history(
        &self,
        prompt: impl Into<String>,
        history: &[P::HistoryItem],
    ) -> Result<RunResult<P::HistoryItem>, AgentError> {
        self.run_inner(prompt.into(), Some(history)).await
    }

    /// Streams one event sequence across all rounds of a run.
    ///
    /// Fails up front with [`AgentError::StreamingUnsupported`] when the provider has no
    /// streaming capability. Every other failure arrives as a final
    /// [`StreamEvent::Error`].
    pub fn run_stream<'a>(
        &'a self,
        prompt: impl Into<String>,
    ) -> Result<BoxStream<'a, StreamEvent>, AgentError> {
        self.run_stream_inner(prompt.into(), None)
    }

    pub fn run_stream_with_history<'a>(
        &'a self,
        prompt: impl Into<String>,
        history: &[P::HistoryItem],
    ) -> Result<BoxStream<'a, StreamEvent>, AgentError> {
        self.run_stream_inner(prompt.into(), Some(history))
    }

    /// Wraps this agent as a tool taking `{"task": string}`, so another agent can
    /// delegate to it. Each invocation is an independent run.
    pub fn as_tool(&self, name: impl Into<String>, description: impl Into<String>) -> Tool {
        let agent = Arc::new(self.clone());

        Tool::new(name, description)
            .with_trusted_schema(json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "The task to delegate to this agent"
                    }
                },
                "required": ["task"],
                "additionalProperties": false
            }))
            .with_typed_handler(move |params: DelegatedTask| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .run(params.task)
                        .await
                        .map(|result| result.text)
                        .map_err(|err| ToolError::Execution(err.to_string()))
                }
            })
    }

    async fn run_inner(
        &self,
        prompt: String,
        history: Option<&[P::HistoryItem]>,
    ) -> Result<RunResult<P::HistoryItem>, AgentError> {
        let tool_schemas = self.tool_schemas();
        let mut history = self.working_history(&prompt, history);
        let max_iterations = self.config.max_iterations;

        for iteration in 1..=max_iterations {
            debug!(iteration, history_len = history.len(), "starting agent round");

            let request = self.provider.build_request(
                provider_input(&prompt, &history),
                self.instructions(),
                &tool_schemas,
            );
            let response = self
                .provider
                .create_response(request)
                .await
                .map_err(AgentError::CreateResponse)?;
            let tool_calls = self
                .provider
                .extract_tool_calls(&response)
                .map_err(AgentError::ExtractToolCalls)?;
            debug!(iteration, tool_calls = tool_calls.len(), "model round completed");

            if tool_calls.is_empty() {
                let text = self.provider.extract_text(&response);
                history.push(self.provider.create_assistant_message(&text));
                return Ok(RunResult { text, history });
            }

            if let Some(unknown) = tool_calls
                .iter()
                .find(|call| !self.tool_map.contains_key(&call.name))
            {
                warn!(tool = %unknown.name, "model requested an unregistered tool");
                return Err(ToolError::NotFound(unknown.name.clone()).into());
            }

            let outputs = self.dispatch(&tool_calls).await?;
            self.append_tool_results(&mut history, &tool_calls, &outputs);
        }

        warn!(max_iterations, "agent run exhausted its iteration budget");
        Err(AgentError::MaxIterationsReached { max_iterations })
    }

    fn run_stream_inner<'a>(
        &'a self,
        prompt: String,
        history: Option<&[P::HistoryItem]>,
    ) -> Result<BoxStream<'a, StreamEvent>, AgentError> {
        let Some(streaming) = self.provider.streaming() else {
            return Err(AgentError::StreamingUnsupported);
        };

        let tool_schemas = self.tool_schemas();
        let mut history = self.working_history(&prompt, history);
        let max_iterations = self.config.max_iterations;

        Ok(Box::pin(stream! {
            for iteration in 1..=max_iterations {
                debug!(iteration, history_len = history.len(), "starting streaming round");

                let request = self.provider.build_request(
                    provider_input(&prompt, &history),
                    self.instructions(),
                    &tool_schemas,
                );
                let mut events = match streaming.create_response_stream(request).await {
                    Ok(events) => events,
                    Err(err) => {
                        warn!(error = %err, "failed to open response stream");
                        yield StreamEvent::Error(AgentError::CreateResponse(err));
                        return;
                    }
                };

                let mut tool_calls = Vec::new();
                let mut text = String::new();

                while let Some(event) = events.next().await {
                    match event {
                        StreamEvent::TextDelta(delta) => {
                            yield StreamEvent::TextDelta(delta);
                        }
                        StreamEvent::TextDone(full_text) => {
                            text.clone_from(&full_text);
                            yield StreamEvent::TextDone(full_text);
                        }
                        StreamEvent::ToolCall(call) => {
                            tool_calls.push(call.clone());
                            yield StreamEvent::ToolCall(call);
                        }
                        StreamEvent::Error(err) => {
                            yield StreamEvent::Error(err);
                            return;
                        }
                        StreamEvent::Done => break,
                    }
                }

                debug!(iteration, tool_calls = tool_calls.len(), "streaming round completed");
                if tool_calls.is_empty() {
                    yield StreamEvent::Done;
                    return;
                }

                let outputs = match self.dispatch(&tool_calls).await {
                    Ok(outputs) => outputs,
                    Err(err) => {
                        yield StreamEvent::Error(err);
                        return;
                    }
                };

                if !text.is_empty() {
                    history.push(self.provider.create_assistant_message(&text));
                }
                self.append_tool_results(&mut history, &tool_calls, &outputs);
            }

            warn!(max_iterations, "streaming run exhausted its iteration budget");
            yield StreamEvent::Error(AgentError::MaxIterationsReached { max_iterations });
        }))
    }

    /// Runs every call of one round concurrently and returns the outputs in call order.
    ///
    /// The first failure to complete wins. Tasks still in flight are drained, not
    /// cancelled, before it is returned.
    async fn dispatch(&self, calls: &[ToolCall]) -> Result<Vec<String>, AgentError> {
        let mut tasks = JoinSet::new();

        for (index, call) in calls.iter().enumerate() {
            let tool = self.tool_map.get(&call.name).cloned();
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            debug!(tool = %name, call_id = %call.call_id, "dispatching tool call");

            tasks.spawn(async move {
                let result = match tool {
                    Some(tool) => tool
                        .call(arguments)
                        .await
                        .map_err(|source| AgentError::ToolFailed { tool: name, source }),
                    None => Err(ToolError::NotFound(name).into()),
                };
                (index, result)
            });
        }

        let mut outputs = vec![String::new(); calls.len()];
        let mut first_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(output))) => outputs[index] = output,
                Ok((_, Err(err))) => {
                    warn!(error = %err, "tool call failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    warn!(error = %err, "tool task did not complete");
                    first_error.get_or_insert(AgentError::Tool(ToolError::Execution(format!(
                        "tool task failed: {err}"
                    ))));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    fn tool_schemas(&self) -> Vec<P::ToolSchema> {
        self.tools
            .iter()
            .map(|tool| self.provider.convert_tool(tool))
            .collect()
    }

    /// Copies the starting history and appends the user prompt.
    fn working_history(
        &self,
        prompt: &str,
        history: Option<&[P::HistoryItem]>,
    ) -> Vec<P::HistoryItem> {
        let base = match history {
            Some(history) if !history.is_empty() => history,
            _ => self.seed_history.as_slice(),
        };

        let mut working = Vec::with_capacity(base.len() + 1);
        working.extend_from_slice(base);
        working.push(self.provider.create_user_message(prompt));
        working
    }

    fn append_tool_results(
        &self,
        history: &mut Vec<P::HistoryItem>,
        calls: &[ToolCall],
        outputs: &[String],
    ) {
        for (call, output) in calls.iter().zip(outputs) {
            history.push(self.provider.create_function_call_input(call));
            history.push(
                self.provider
                    .create_function_call_output(&call.call_id, output),
            );
        }
    }

    fn instructions(&self) -> Option<&str> {
        self.config.system_prompt.as_deref()
    }
}

/// The bare prompt on the first turn, the whole history afterwards.
fn provider_input<'h, H>(prompt: &'h str, history: &'h [H]) -> ProviderInput<'h, H> {
    if history.len() <= 1 {
        ProviderInput::Prompt(prompt)
    } else {
        ProviderInput::History(history)
    }
}

#[cfg(test)]
mod tests;
