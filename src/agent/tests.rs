use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde_json::json;

use super::*;
use crate::error::ProviderError;
use crate::llm::{EventStream, StreamProvider};

#[derive(Clone, Debug, PartialEq)]
enum MockItem {
    User(String),
    Assistant(String),
    Call(ToolCall),
    Output { call_id: String, output: String },
}

#[derive(Clone, Debug, PartialEq)]
enum MockInput {
    Prompt(String),
    History(Vec<MockItem>),
}

#[derive(Clone, Debug)]
struct MockRequest {
    input: MockInput,
    instructions: Option<String>,
    tool_names: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct MockResponse {
    text: String,
    tool_calls: Vec<ToolCall>,
    malformed: bool,
}

fn text_response(text: &str) -> MockResponse {
    MockResponse {
        text: text.to_string(),
        ..MockResponse::default()
    }
}

fn calls_response(tool_calls: Vec<ToolCall>) -> MockResponse {
    MockResponse {
        tool_calls,
        ..MockResponse::default()
    }
}

type Recorder = Arc<Mutex<Vec<MockRequest>>>;

#[derive(Default)]
struct MockProvider {
    responses: Mutex<VecDeque<Result<MockResponse, ProviderError>>>,
    repeat: Option<MockResponse>,
    rounds: Option<Mutex<VecDeque<Result<Vec<StreamEvent>, ProviderError>>>>,
    requests: Recorder,
}

impl MockProvider {
    fn with_responses(responses: Vec<Result<MockResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            ..Self::default()
        }
    }

    fn repeating(response: MockResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::default()
        }
    }

    fn with_rounds(rounds: Vec<Result<Vec<StreamEvent>, ProviderError>>) -> Self {
        Self {
            rounds: Some(Mutex::new(VecDeque::from(rounds))),
            ..Self::default()
        }
    }

    fn recorder(&self) -> Recorder {
        Arc::clone(&self.requests)
    }

    fn record(&self, request: MockRequest) {
        self.requests.lock().expect("lock poisoned").push(request);
    }
}

fn recorded(recorder: &Recorder) -> Vec<MockRequest> {
    recorder.lock().expect("lock poisoned").clone()
}

#[async_trait]
impl Provider for MockProvider {
    type Request = MockRequest;
    type Response = MockResponse;
    type ToolSchema = String;
    type HistoryItem = MockItem;

    fn convert_tool(&self, tool: &Tool) -> String {
        tool.name().to_string()
    }

    fn build_request(
        &self,
        input: ProviderInput<'_, MockItem>,
        instructions: Option<&str>,
        tools: &[String],
    ) -> MockRequest {
        let input = match input {
            ProviderInput::Prompt(prompt) => MockInput::Prompt(prompt.to_string()),
            ProviderInput::History(history) => MockInput::History(history.to_vec()),
        };

        MockRequest {
            input,
            instructions: instructions.map(str::to_string),
            tool_names: tools.to_vec(),
        }
    }

    async fn create_response(&self, request: MockRequest) -> Result<MockResponse, ProviderError> {
        self.record(request);
        let next = self.responses.lock().expect("lock poisoned").pop_front();
        match (next, &self.repeat) {
            (Some(response), _) => response,
            (None, Some(repeat)) => Ok(repeat.clone()),
            (None, None) => Err(ProviderError::Response(
                "no more mock responses".to_string(),
            )),
        }
    }

    fn extract_tool_calls(&self, response: &MockResponse) -> Result<Vec<ToolCall>, ProviderError> {
        if response.malformed {
            return Err(ProviderError::Response("malformed output".to_string()));
        }
        Ok(response.tool_calls.clone())
    }

    fn extract_text(&self, response: &MockResponse) -> String {
        response.text.clone()
    }

    fn create_user_message(&self, text: &str) -> MockItem {
        MockItem::User(text.to_string())
    }

    fn create_assistant_message(&self, text: &str) -> MockItem {
        MockItem::Assistant(text.to_string())
    }

    fn create_function_call_input(&self, call: &ToolCall) -> MockItem {
        MockItem::Call(call.clone())
    }

    fn create_function_call_output(&self, call_id: &str, output: &str) -> MockItem {
        MockItem::Output {
            call_id: call_id.to_string(),
            output: output.to_string(),
        }
    }

    fn streaming(&self) -> Option<&dyn StreamProvider<MockRequest>> {
        self.rounds
            .as_ref()
            .map(|_| self as &dyn StreamProvider<MockRequest>)
    }
}

#[async_trait]
impl StreamProvider<MockRequest> for MockProvider {
    async fn create_response_stream(
        &self,
        request: MockRequest,
    ) -> Result<EventStream, ProviderError> {
        self.record(request);
        let round = self
            .rounds
            .as_ref()
            .and_then(|rounds| rounds.lock().expect("lock poisoned").pop_front());
        let events = round.unwrap_or_else(|| {
            Err(ProviderError::Response("no more mock rounds".to_string()))
        })?;
        Ok(Box::pin(stream::iter(events)))
    }
}

fn greet_tool() -> Tool {
    #[derive(Deserialize)]
    struct GreetParams {
        name: String,
    }

    Tool::new("greet", "greet a person")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"}
            },
            "required": ["name"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_typed_handler(|params: GreetParams| async move {
            Ok(format!("Hello, {}", params.name))
        })
}

fn fail_tool() -> Tool {
    Tool::new("fail", "always fail")
        .with_handler(|_args| async move { Err(ToolError::Execution("boom".to_string())) })
}

fn sleepy_tool(name: &str, millis: u64, finished: Arc<AtomicBool>) -> Tool {
    let output = format!("{name}-done");
    Tool::new(name, "sleeps before answering").with_handler(move |_args| {
        let finished = Arc::clone(&finished);
        let output = output.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            finished.store(true, Ordering::SeqCst);
            Ok(output)
        }
    })
}

fn call(name: &str, arguments: &str, call_id: &str) -> ToolCall {
    ToolCall::new(name, arguments, call_id)
}

fn user(text: &str) -> MockItem {
    MockItem::User(text.to_string())
}

fn assistant(text: &str) -> MockItem {
    MockItem::Assistant(text.to_string())
}

fn output(call_id: &str, output: &str) -> MockItem {
    MockItem::Output {
        call_id: call_id.to_string(),
        output: output.to_string(),
    }
}

#[tokio::test]
async fn first_turn_sends_bare_prompt_and_instructions() {
    let provider = MockProvider::with_responses(vec![Ok(text_response("hello"))]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .system_prompt("be brief")
        .tool(greet_tool())
        .build()
        .expect("agent builds");
    let result = agent.run("hi").await.expect("run succeeds");

    assert_eq!(result.text, "hello");
    assert_eq!(result.history, vec![user("hi"), assistant("hello")]);

    let requests = recorded(&requests);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].input, MockInput::Prompt("hi".to_string()));
    assert_eq!(requests[0].instructions.as_deref(), Some("be brief"));
    assert_eq!(requests[0].tool_names, vec!["greet".to_string()]);
}

#[tokio::test]
async fn run_without_tool_calls_takes_one_round_and_keeps_seed_untouched() {
    let provider = MockProvider::with_responses(vec![Ok(text_response("hello"))]);
    let requests = provider.recorder();
    let seed = vec![user("earlier"), assistant("noted")];

    let agent = Agent::builder(provider)
        .history(seed.clone())
        .build()
        .expect("agent builds");
    let result = agent.run("hi").await.expect("run succeeds");

    assert_eq!(
        result.history,
        vec![user("earlier"), assistant("noted"), user("hi"), assistant("hello")]
    );
    assert_eq!(agent.seed_history(), seed.as_slice());

    let requests = recorded(&requests);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].input,
        MockInput::History(vec![user("earlier"), assistant("noted"), user("hi")])
    );
}

#[tokio::test]
async fn tool_results_follow_call_order_not_completion_order() {
    let completions = Arc::new(Mutex::new(Vec::new()));
    let tool = |name: &'static str, millis: u64| {
        let completions = Arc::clone(&completions);
        Tool::new(name, "records when it finishes").with_handler(move |_args| {
            let completions = Arc::clone(&completions);
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                completions.lock().expect("lock poisoned").push(name);
                Ok(format!("{name}-done"))
            }
        })
    };

    let provider = MockProvider::with_responses(vec![
        Ok(calls_response(vec![
            call("slow", "{}", "call_1"),
            call("fast", "{}", "call_2"),
        ])),
        Ok(text_response("done")),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(tool("slow", 50))
        .tool(tool("fast", 0))
        .build()
        .expect("agent builds");
    let result = agent.run("go").await.expect("run succeeds");

    assert_eq!(
        *completions.lock().expect("lock poisoned"),
        vec!["fast", "slow"]
    );

    let expected_round_two = vec![
        user("go"),
        MockItem::Call(call("slow", "{}", "call_1")),
        output("call_1", "slow-done"),
        MockItem::Call(call("fast", "{}", "call_2")),
        output("call_2", "fast-done"),
    ];
    let requests = recorded(&requests);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].input, MockInput::History(expected_round_two.clone()));

    let mut expected_history = expected_round_two;
    expected_history.push(assistant("done"));
    assert_eq!(result.text, "done");
    assert_eq!(result.history, expected_history);
}

#[tokio::test]
async fn runs_do_not_leak_history_into_each_other() {
    let provider = MockProvider::with_responses(vec![
        Ok(text_response("first")),
        Ok(text_response("second")),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .history(vec![user("seed")])
        .build()
        .expect("agent builds");
    agent.run("a").await.expect("first run succeeds");
    agent.run("b").await.expect("second run succeeds");

    let requests = recorded(&requests);
    assert_eq!(
        requests[1].input,
        MockInput::History(vec![user("seed"), user("b")])
    );
    assert_eq!(agent.seed_history(), [user("seed")].as_slice());
}

#[tokio::test]
async fn explicit_history_takes_precedence_over_seed() {
    let provider = MockProvider::with_responses(vec![
        Ok(text_response("one")),
        Ok(text_response("two")),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .history(vec![user("seed")])
        .build()
        .expect("agent builds");

    let explicit = vec![user("other"), assistant("context")];
    agent
        .run_with_history("next", &explicit)
        .await
        .expect("run succeeds");
    agent
        .run_with_history("fallback", &[])
        .await
        .expect("run succeeds");

    let requests = recorded(&requests);
    assert_eq!(
        requests[0].input,
        MockInput::History(vec![user("other"), assistant("context"), user("next")])
    );
    assert_eq!(
        requests[1].input,
        MockInput::History(vec![user("seed"), user("fallback")])
    );
    assert_eq!(explicit.len(), 2);
}

#[tokio::test]
async fn endless_tool_calls_stop_at_max_iterations() {
    let provider =
        MockProvider::repeating(calls_response(vec![call("greet", r#"{"name":"Ada"}"#, "call_1")]));
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(greet_tool())
        .build()
        .expect("agent builds");
    let err = agent.run("loop").await.expect_err("must fail");

    assert_eq!(err, AgentError::MaxIterationsReached { max_iterations: 10 });
    assert_eq!(recorded(&requests).len(), 10);
}

#[tokio::test]
async fn unknown_tool_fails_before_any_tool_runs() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = {
        let invocations = Arc::clone(&invocations);
        Tool::new("counter", "counts invocations").with_handler(move |_args| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("counted".to_string())
            }
        })
    };

    let provider = MockProvider::with_responses(vec![Ok(calls_response(vec![
        call("counter", "{}", "call_1"),
        call("missing", "{}", "call_2"),
    ]))]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(counter)
        .build()
        .expect("agent builds");
    let err = agent.run("go").await.expect_err("must fail");

    assert_eq!(err, AgentError::Tool(ToolError::NotFound("missing".to_string())));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(recorded(&requests).len(), 1);
}

#[tokio::test]
async fn tool_failure_aborts_the_run() {
    let provider = MockProvider::with_responses(vec![
        Ok(calls_response(vec![call("fail", "{}", "call_1")])),
        Ok(text_response("never reached")),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(fail_tool())
        .build()
        .expect("agent builds");
    let err = agent.run("try").await.expect_err("must fail");

    assert_eq!(
        err,
        AgentError::ToolFailed {
            tool: "fail".to_string(),
            source: ToolError::Execution("boom".to_string()),
        }
    );
    assert_eq!(err.to_string(), "tool fail failed: tool execution failed: boom");
    assert_eq!(recorded(&requests).len(), 1);
}

#[tokio::test]
async fn tool_failure_waits_for_sibling_calls_to_finish() {
    let finished = Arc::new(AtomicBool::new(false));
    let provider = MockProvider::with_responses(vec![Ok(calls_response(vec![
        call("fail", "{}", "call_1"),
        call("slow", "{}", "call_2"),
    ]))]);

    let agent = Agent::builder(provider)
        .tool(fail_tool())
        .tool(sleepy_tool("slow", 30, Arc::clone(&finished)))
        .build()
        .expect("agent builds");
    let err = agent.run("try").await.expect_err("must fail");

    assert!(matches!(err, AgentError::ToolFailed { ref tool, .. } if tool == "fail"));
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn provider_failures_are_wrapped() {
    let provider = MockProvider::with_responses(vec![Err(ProviderError::Request(
        "connection refused".to_string(),
    ))]);
    let agent = Agent::builder(provider).build().expect("agent builds");

    let err = agent.run("hi").await.expect_err("must fail");
    assert_eq!(
        err,
        AgentError::CreateResponse(ProviderError::Request("connection refused".to_string()))
    );
    assert!(err.to_string().starts_with("failed to create response"));

    let provider = MockProvider::with_responses(vec![Ok(MockResponse {
        malformed: true,
        ..MockResponse::default()
    })]);
    let agent = Agent::builder(provider).build().expect("agent builds");

    let err = agent.run("hi").await.expect_err("must fail");
    assert!(matches!(err, AgentError::ExtractToolCalls(_)));
}

#[test]
fn build_rejects_duplicate_tools_and_zero_iterations() {
    let err = Agent::builder(MockProvider::default())
        .tool(greet_tool())
        .tool(greet_tool())
        .build()
        .err()
        .expect("duplicate must fail");
    assert_eq!(
        err,
        AgentError::Config("duplicate tool registered: greet".to_string())
    );

    let err = Agent::builder(MockProvider::default())
        .max_iterations(0)
        .build()
        .err()
        .expect("zero iterations must fail");
    assert!(matches!(err, AgentError::Config(_)));
}

#[tokio::test]
async fn dropping_a_run_cancels_in_flight_tools() {
    let finished = Arc::new(AtomicBool::new(false));
    let provider = MockProvider::with_responses(vec![Ok(calls_response(vec![call(
        "slow", "{}", "call_1",
    )]))]);

    let agent = Agent::builder(provider)
        .tool(sleepy_tool("slow", 200, Arc::clone(&finished)))
        .build()
        .expect("agent builds");

    let outcome = tokio::time::timeout(Duration::from_millis(20), agent.run("go")).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn run_stream_requires_streaming_capability() {
    let provider = MockProvider::with_responses(vec![Ok(text_response("unused"))]);
    let requests = provider.recorder();
    let agent = Agent::builder(provider).build().expect("agent builds");

    let Err(err) = agent.run_stream("hi") else {
        panic!("stream should not start");
    };
    assert_eq!(err, AgentError::StreamingUnsupported);
    assert!(recorded(&requests).is_empty());
}

#[tokio::test]
async fn streams_text_events_in_order() {
    let provider = MockProvider::with_rounds(vec![Ok(vec![
        StreamEvent::TextDelta("Hello".to_string()),
        StreamEvent::TextDelta(" World".to_string()),
        StreamEvent::TextDone("Hello World".to_string()),
        StreamEvent::Done,
    ])]);
    let agent = Agent::builder(provider).build().expect("agent builds");

    let events = agent
        .run_stream("hi")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Hello".to_string()),
            StreamEvent::TextDelta(" World".to_string()),
            StreamEvent::TextDone("Hello World".to_string()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn streams_across_tool_rounds() {
    let greet_call = call("greet", r#"{"name":"John"}"#, "call_1");
    let provider = MockProvider::with_rounds(vec![
        Ok(vec![
            StreamEvent::TextDelta("Let me".to_string()),
            StreamEvent::TextDone("Let me".to_string()),
            StreamEvent::ToolCall(greet_call.clone()),
            StreamEvent::Done,
        ]),
        Ok(vec![
            StreamEvent::TextDelta("Done".to_string()),
            StreamEvent::TextDone("Done".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(greet_tool())
        .build()
        .expect("agent builds");
    let events = agent
        .run_stream("greet John")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Let me".to_string()),
            StreamEvent::TextDone("Let me".to_string()),
            StreamEvent::ToolCall(greet_call.clone()),
            StreamEvent::TextDelta("Done".to_string()),
            StreamEvent::TextDone("Done".to_string()),
            StreamEvent::Done,
        ]
    );

    let requests = recorded(&requests);
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].input,
        MockInput::History(vec![
            user("greet John"),
            assistant("Let me"),
            MockItem::Call(greet_call),
            output("call_1", "Hello, John"),
        ])
    );
}

#[tokio::test]
async fn stream_unknown_tool_ends_with_single_error() {
    let provider = MockProvider::with_rounds(vec![
        Ok(vec![
            StreamEvent::ToolCall(call("missing", "{}", "call_1")),
            StreamEvent::Done,
        ]),
        Ok(vec![StreamEvent::Done]),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider).build().expect("agent builds");
    let events = agent
        .run_stream("go")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::ToolCall(call("missing", "{}", "call_1")),
            StreamEvent::Error(AgentError::Tool(ToolError::NotFound("missing".to_string()))),
        ]
    );
    assert_eq!(recorded(&requests).len(), 1);
}

#[tokio::test]
async fn stream_tool_failure_ends_with_error() {
    let provider = MockProvider::with_rounds(vec![Ok(vec![
        StreamEvent::ToolCall(call("fail", "{}", "call_1")),
        StreamEvent::Done,
    ])]);
    let agent = Agent::builder(provider)
        .tool(fail_tool())
        .build()
        .expect("agent builds");

    let events = agent
        .run_stream("go")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        StreamEvent::Error(AgentError::ToolFailed { tool, .. }) if tool == "fail"
    ));
}

#[tokio::test]
async fn stream_forwards_provider_errors_and_stops() {
    let stream_error = AgentError::Provider(ProviderError::Stream("stream error".to_string()));
    let provider = MockProvider::with_rounds(vec![
        Ok(vec![
            StreamEvent::TextDelta("Hel".to_string()),
            StreamEvent::Error(stream_error.clone()),
            StreamEvent::TextDelta("lo".to_string()),
        ]),
        Ok(vec![StreamEvent::Done]),
    ]);
    let requests = provider.recorder();

    let agent = Agent::builder(provider).build().expect("agent builds");
    let events = agent
        .run_stream("hi")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Hel".to_string()),
            StreamEvent::Error(stream_error),
        ]
    );
    assert_eq!(recorded(&requests).len(), 1);
}

#[tokio::test]
async fn stream_open_failure_becomes_error_event() {
    let provider = MockProvider::with_rounds(vec![Err(ProviderError::Request(
        "unauthorized".to_string(),
    ))]);
    let agent = Agent::builder(provider).build().expect("agent builds");

    let events = agent
        .run_stream("hi")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        events,
        vec![StreamEvent::Error(AgentError::CreateResponse(
            ProviderError::Request("unauthorized".to_string())
        ))]
    );
}

#[tokio::test]
async fn stream_stops_at_max_iterations() {
    let round = || {
        Ok(vec![
            StreamEvent::ToolCall(call("greet", r#"{"name":"Ada"}"#, "call_1")),
            StreamEvent::Done,
        ])
    };
    let provider = MockProvider::with_rounds((0..5).map(|_| round()).collect());
    let requests = provider.recorder();

    let agent = Agent::builder(provider)
        .tool(greet_tool())
        .max_iterations(3)
        .build()
        .expect("agent builds");
    let events = agent
        .run_stream("loop")
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(events.len(), 4);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Error(AgentError::MaxIterationsReached {
            max_iterations: 3
        }))
    );
    assert_eq!(recorded(&requests).len(), 3);
}

#[tokio::test]
async fn stream_with_history_starts_from_given_history() {
    let provider = MockProvider::with_rounds(vec![Ok(vec![StreamEvent::Done])]);
    let requests = provider.recorder();
    let agent = Agent::builder(provider).build().expect("agent builds");

    let history = vec![user("before")];
    let events = agent
        .run_stream_with_history("now", &history)
        .expect("streaming supported")
        .collect::<Vec<_>>()
        .await;

    assert_eq!(events, vec![StreamEvent::Done]);
    assert_eq!(
        recorded(&requests)[0].input,
        MockInput::History(vec![user("before"), user("now")])
    );
}

#[tokio::test]
async fn as_tool_runs_the_agent_on_the_task() {
    let provider = MockProvider::repeating(text_response("X"));
    let requests = provider.recorder();
    let sub_agent = Agent::builder(provider).build().expect("agent builds");

    let tool = sub_agent.as_tool("researcher", "researches things");
    assert_eq!(tool.name(), "researcher");
    assert_eq!(tool.parameters()["required"], json!(["task"]));
    assert_eq!(tool.parameters()["properties"]["task"]["type"], "string");

    let output = tool
        .call(r#"{"task":"find facts"}"#)
        .await
        .expect("sub-agent runs");
    assert_eq!(output, "X");
    assert_eq!(
        recorded(&requests)[0].input,
        MockInput::Prompt("find facts".to_string())
    );

    let err = tool.call(r#"{"topic":"x"}"#).await.expect_err("missing task");
    assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "researcher"));
}

#[tokio::test]
async fn as_tool_reports_sub_agent_failures() {
    let sub_agent = Agent::builder(MockProvider::default())
        .build()
        .expect("agent builds");
    let tool = sub_agent.as_tool("researcher", "researches things");

    let err = tool
        .call(r#"{"task":"anything"}"#)
        .await
        .expect_err("sub-agent fails");
    assert_eq!(
        err,
        ToolError::Execution(
            "failed to create response: provider response invalid: no more mock responses"
                .to_string()
        )
    );
}

#[tokio::test]
async fn orchestrator_delegates_to_sub_agent() {
    let sub_agent = Agent::builder(MockProvider::repeating(text_response("X")))
        .build()
        .expect("sub-agent builds");

    let provider = MockProvider::with_responses(vec![
        Ok(calls_response(vec![call(
            "researcher",
            r#"{"task":"look it up"}"#,
            "call_1",
        )])),
        Ok(text_response("summary")),
    ]);
    let orchestrator = Agent::builder(provider)
        .tool(sub_agent.as_tool("researcher", "researches things"))
        .build()
        .expect("orchestrator builds");

    let result = orchestrator.run("plan").await.expect("run succeeds");

    assert_eq!(result.text, "summary");
    assert!(result.history.contains(&output("call_1", "X")));
}
