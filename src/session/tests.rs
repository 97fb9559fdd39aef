use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::*;
use crate::error::{SchemaError, ToolError, TransportError};
use crate::llm::{ProviderMessage, ProviderRequest, ProviderResponse, ResponseFormat};
use crate::tools::{TOOL_USAGE_OPEN, Tool};

#[derive(Clone, Default)]
struct MockTransport {
    responses: Arc<Mutex<VecDeque<Result<ProviderResponse, TransportError>>>>,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl MockTransport {
    fn with_responses(responses: Vec<Result<ProviderResponse, TransportError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            requests: Arc::default(),
        }
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, TransportError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push(request.clone());
        let mut guard = self.responses.lock().expect("lock poisoned");
        guard.pop_front().unwrap_or_else(|| {
            Err(TransportError::Network(
                "no more mock transport responses".to_string(),
            ))
        })
    }
}

fn text_response(text: &str) -> Result<ProviderResponse, TransportError> {
    Ok(serde_json::from_value(json!({
        "choices": [{
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }]
    }))
    .expect("valid response"))
}

fn tool_response(calls: &[(&str, &str, &str)]) -> Result<ProviderResponse, TransportError> {
    let tool_calls = calls
        .iter()
        .map(|(id, name, arguments)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments}
            })
        })
        .collect::<Vec<_>>();

    Ok(serde_json::from_value(json!({
        "choices": [{
            "message": {"role": "assistant", "content": null, "tool_calls": tool_calls},
            "finish_reason": "tool_calls"
        }]
    }))
    .expect("valid response"))
}

fn empty_response(finish_reason: &str) -> Result<ProviderResponse, TransportError> {
    Ok(serde_json::from_value(json!({
        "choices": [{
            "message": {"role": "assistant", "content": "  "},
            "finish_reason": finish_reason
        }]
    }))
    .expect("valid response"))
}

fn rejected(message: &str) -> Result<ProviderResponse, TransportError> {
    Err(TransportError::RejectedRequest(message.to_string()))
}

#[derive(Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

struct Add;

#[async_trait]
impl Tool for Add {
    type Arguments = AddArgs;
    type Output = serde_json::Value;

    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "add two numbers"
    }

    async fn call(&self, arguments: AddArgs) -> Result<serde_json::Value, ToolError> {
        Ok(json!({"sum": arguments.a + arguments.b}))
    }
}

fn add_tool() -> ToolSpec {
    ToolSpec::from_tool(Add).expect("schema infers")
}

fn fail_tool() -> ToolSpec {
    ToolSpec::new("fail", "always fail")
        .with_handler(|_args| async move { Err(ToolError::Execution("boom".to_string())) })
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Person {
    name: String,
    age: i64,
    nickname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Outline {
    title: String,
    sections: Vec<Outline>,
}

fn session(transport: &MockTransport, tools: Vec<ToolSpec>) -> Session {
    Session::builder()
        .transport(transport.clone())
        .tools(tools)
        .build()
        .expect("session builds")
}

fn system_content(request: &ProviderRequest) -> Option<&str> {
    request.messages.iter().find_map(|message| match message {
        ProviderMessage::System { content } => Some(content.as_str()),
        _ => None,
    })
}

fn tool_result_ids(transcript: &Transcript) -> Vec<&str> {
    transcript
        .entries()
        .iter()
        .filter_map(|entry| match entry {
            Entry::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn respond_returns_plain_text() {
    let transport = MockTransport::with_responses(vec![text_response("hello")]);
    let mut session = session(&transport, vec![]);

    let response = session.respond("hi").await.expect("respond succeeds");

    assert_eq!(response, "hello");
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools.is_none());
    assert!(requests[0].response_format.is_none());
    assert_eq!(
        session.transcript().entries(),
        &[
            Entry::Prompt("hi".to_string()),
            Entry::Response(Message::text("hello")),
        ]
    );
}

#[tokio::test]
async fn tool_calls_resolve_in_provider_order() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[
            ("a", "add", r#"{"a":2,"b":3}"#),
            ("b", "add", r#"{"a":10,"b":1}"#),
        ]),
        text_response("5 and 11"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    let response = session.respond("add things").await.expect("respond succeeds");
    assert_eq!(response, "5 and 11");

    let entries = session.transcript().entries();
    assert!(matches!(entries[0], Entry::Instructions(_)));
    assert!(matches!(entries[1], Entry::Prompt(_)));
    assert!(matches!(&entries[2], Entry::Response(message) if message.tool_calls.len() == 2));
    assert_eq!(
        entries[3],
        Entry::ToolResult {
            call_id: "a".to_string(),
            tool_name: "add".to_string(),
            output: r#"{"sum":5}"#.to_string(),
        }
    );
    assert_eq!(
        entries[4],
        Entry::ToolResult {
            call_id: "b".to_string(),
            tool_name: "add".to_string(),
            output: r#"{"sum":11}"#.to_string(),
        }
    );
    assert_eq!(tool_result_ids(session.transcript()), vec!["a", "b"]);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tool_choice.as_deref(), Some("auto"));
    assert_eq!(requests[0].tools.as_ref().map(Vec::len), Some(1));
    assert!(requests[1].tools.is_none());
    assert!(requests[1].messages.iter().any(|message| matches!(
        message,
        ProviderMessage::Tool { tool_call_id, .. } if tool_call_id == "b"
    )));
}

#[tokio::test]
async fn max_iterations_error_when_tool_loop_never_finishes() {
    let responses = (0..MAX_ITERATIONS)
        .map(|i| {
            let id = format!("call_{i}");
            tool_response(&[(id.as_str(), "add", r#"{"a":1,"b":1}"#)])
        })
        .collect();
    let transport = MockTransport::with_responses(responses);
    let mut session = session(&transport, vec![add_tool()]);

    let err = session.respond("loop").await.expect_err("must fail");

    assert_eq!(
        err,
        GenerationError::MaxIterationsExceeded {
            max_iterations: MAX_ITERATIONS
        }
    );
    assert_eq!(transport.requests().len(), MAX_ITERATIONS as usize);
    assert_eq!(
        session.transcript().entries().last(),
        Some(&Entry::Error(err))
    );
}

#[tokio::test]
async fn rejected_response_format_is_retried_without_it() {
    let transport = MockTransport::with_responses(vec![
        rejected("response_format not supported"),
        text_response(r#"{"name":"Ada","age":36}"#),
    ]);
    let mut session = session(&transport, vec![]);

    let person: Person = session
        .respond_as("who is Ada?")
        .await
        .expect("respond succeeds");

    assert_eq!(
        person,
        Person {
            name: "Ada".to_string(),
            age: 36,
            nickname: None,
        }
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].response_format, Some(ResponseFormat::JsonObject));
    assert_eq!(requests[1].response_format, None);
    assert_eq!(requests[0].messages, requests[1].messages);
    assert_eq!(session.transcript().errors().count(), 0);
}

#[tokio::test]
async fn second_rejection_is_fatal() {
    let transport = MockTransport::with_responses(vec![
        rejected("response_format not supported"),
        rejected("still bad"),
    ]);
    let mut session = session(&transport, vec![]);

    let err = session
        .respond_as::<Person>("who?")
        .await
        .expect_err("must fail");

    assert_eq!(
        err,
        GenerationError::Transport(TransportError::RejectedRequest("still bad".to_string()))
    );
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn rejected_tools_are_dropped_once() {
    let transport = MockTransport::with_responses(vec![
        rejected("tools not supported for this model"),
        text_response("answered without tools"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    let response = session.respond("add 1 and 2").await.expect("respond succeeds");

    assert_eq!(response, "answered without tools");
    let requests = transport.requests();
    assert!(requests[0].tools.is_some());
    assert!(requests[1].tools.is_none());
    assert!(requests[1].tool_choice.is_none());
}

#[tokio::test]
async fn rejection_without_degradable_feature_is_fatal() {
    let transport = MockTransport::with_responses(vec![rejected("bad request")]);
    let mut session = session(&transport, vec![]);

    let err = session.respond("hi").await.expect_err("must fail");

    assert!(matches!(
        err,
        GenerationError::Transport(TransportError::RejectedRequest(_))
    ));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn network_errors_are_not_retried() {
    let transport = MockTransport::with_responses(vec![
        Err(TransportError::Network("connection reset".to_string())),
        text_response("unreachable"),
    ]);
    let mut session = session(&transport, vec![]);

    let err = session
        .respond_as::<Person>("who?")
        .await
        .expect_err("must fail");

    assert!(matches!(err, GenerationError::Transport(TransportError::Network(_))));
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(session.transcript().errors().collect::<Vec<_>>(), vec![&err]);
}

#[tokio::test]
async fn unknown_tool_aborts_without_another_request() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[("x", "bad_tool", "{}")]),
        text_response("never sent"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    let err = session.respond("go").await.expect_err("must fail");

    assert_eq!(
        err,
        GenerationError::Tool(ToolError::NotFound("bad_tool".to_string()))
    );
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(
        session.transcript().entries().last(),
        Some(&Entry::Error(err))
    );
}

#[tokio::test]
async fn unknown_tool_leaves_every_call_answered_for_the_next_turn() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[
            ("a", "add", r#"{"a":1,"b":1}"#),
            ("x", "bad_tool", "{}"),
            ("c", "add", r#"{"a":2,"b":2}"#),
        ]),
        text_response("recovered"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    session.respond("go").await.expect_err("unknown tool aborts");
    assert_eq!(tool_result_ids(session.transcript()), vec!["a", "x", "c"]);

    let outputs = session
        .transcript()
        .entries()
        .iter()
        .filter_map(|entry| match entry {
            Entry::ToolResult { output, .. } => {
                Some(serde_json::from_str::<serde_json::Value>(output).expect("output is JSON"))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(outputs[0], json!({"sum": 2}));
    assert_eq!(outputs[1]["kind"], "not_found");
    assert_eq!(outputs[2]["kind"], "not_executed");

    let response = session.respond("again").await.expect("session still usable");
    assert_eq!(response, "recovered");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    let answered = requests[1]
        .messages
        .iter()
        .filter_map(|message| match message {
            ProviderMessage::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(answered, vec!["a", "x", "c"]);
}

#[tokio::test]
async fn malformed_arguments_are_reported_to_the_provider() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[("c1", "add", "{not json")]),
        text_response("sorry, retrying is pointless"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    let response = session.respond("add").await.expect("respond succeeds");
    assert_eq!(response, "sorry, retrying is pointless");

    let transcript = session.transcript();
    assert_eq!(transcript.errors().count(), 1);
    assert!(matches!(
        transcript.errors().next(),
        Some(GenerationError::Tool(ToolError::InvalidArguments { .. }))
    ));

    let output = transcript
        .entries()
        .iter()
        .find_map(|entry| match entry {
            Entry::ToolResult { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("synthetic tool result");
    let output: serde_json::Value = serde_json::from_str(&output).expect("JSON output");
    assert_eq!(output["kind"], "invalid_arguments");
}

#[tokio::test]
async fn tool_execution_failure_still_finishes() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[("c1", "fail", "{}")]),
        text_response("fallback"),
    ]);
    let mut session = session(&transport, vec![fail_tool()]);

    let response = session.respond("try").await.expect("respond succeeds");

    assert_eq!(response, "fallback");
    assert_eq!(
        session.transcript().errors().next(),
        Some(&GenerationError::Tool(ToolError::Execution("boom".to_string())))
    );
    assert_eq!(tool_result_ids(session.transcript()), vec!["c1"]);
}

#[tokio::test]
async fn empty_reply_with_tools_offered_points_at_tool_support() {
    let transport = MockTransport::with_responses(vec![
        empty_response("stop"),
        text_response("never sent"),
    ]);
    let mut session = session(&transport, vec![add_tool()]);

    let err = session.respond("add").await.expect_err("must fail");

    match err {
        GenerationError::UnexpectedResponse(message) => {
            assert!(message.contains("does not support tool calling"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn empty_reply_reports_iteration_flags_and_finish_reason() {
    let transport = MockTransport::with_responses(vec![empty_response("length")]);
    let mut session = session(&transport, vec![]);

    let err = session.respond("write a novel").await.expect_err("must fail");

    let message = err.to_string();
    assert!(message.contains("iteration 1"));
    assert!(message.contains("tools_completed: false"));
    assert!(message.contains("finish_reason: length"));
}

#[tokio::test]
async fn missing_choices_is_unexpected() {
    let transport = MockTransport::with_responses(vec![Ok(ProviderResponse::default())]);
    let mut session = session(&transport, vec![]);

    let err = session.respond("hi").await.expect_err("must fail");

    assert!(matches!(err, GenerationError::UnexpectedResponse(ref m) if m.contains("no choices")));
}

#[tokio::test]
async fn schema_directive_replaces_tool_guidance_once_tools_are_done() {
    let transport = MockTransport::with_responses(vec![
        tool_response(&[("c1", "add", r#"{"a":40,"b":2}"#)]),
        text_response("```json\n{\"name\":\"Answer\",\"age\":42,\"nickname\":\"deep\"}\n```"),
    ]);
    let mut session = Session::builder()
        .transport(transport.clone())
        .tool(add_tool())
        .instructions("You are precise.")
        .build()
        .expect("session builds");

    let person: Person = session.respond_as("compute").await.expect("respond succeeds");
    assert_eq!(person.age, 42);
    assert_eq!(person.nickname.as_deref(), Some("deep"));

    let requests = transport.requests();

    let first = system_content(&requests[0]).expect("system message");
    assert!(first.starts_with("You are precise."));
    assert!(first.contains(TOOL_USAGE_OPEN));
    assert!(first.contains("\"required\""));
    assert_eq!(requests[0].response_format, None);

    let second = system_content(&requests[1]).expect("system message");
    assert!(second.starts_with("You are precise."));
    assert!(!second.contains(TOOL_USAGE_OPEN));
    assert!(second.contains("JSON Schema"));
    assert_eq!(requests[1].response_format, Some(ResponseFormat::JsonObject));

    assert!(matches!(
        session.transcript().entries()[0],
        Entry::Instructions(ref text) if text.contains(TOOL_USAGE_OPEN)
    ));
}

#[tokio::test]
async fn schema_directive_is_injected_without_instructions() {
    let transport = MockTransport::with_responses(vec![text_response(
        r#"{"name":"Ada","age":36,"nickname":null}"#,
    )]);
    let mut session = session(&transport, vec![]);

    let _: Person = session.respond_as("who?").await.expect("respond succeeds");

    let requests = transport.requests();
    assert!(matches!(
        requests[0].messages.first(),
        Some(ProviderMessage::System { content }) if content.contains("\"nickname\"")
    ));
    assert!(session
        .transcript()
        .entries()
        .iter()
        .all(|entry| !matches!(entry, Entry::Instructions(_))));
}

#[tokio::test]
async fn decode_failure_preserves_raw_text() {
    let transport = MockTransport::with_responses(vec![text_response("Ada, 36 years old")]);
    let mut session = session(&transport, vec![]);

    let err = session
        .respond_as::<Person>("who?")
        .await
        .expect_err("must fail");

    match &err {
        GenerationError::SchemaDecodeFailed { raw, .. } => {
            assert_eq!(raw, "Ada, 36 years old");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        session.transcript().entries().last(),
        Some(&Entry::Error(err))
    );
}

#[tokio::test]
async fn failed_inference_is_recorded_and_keeps_instructions() {
    let transport = MockTransport::with_responses(vec![text_response("hello")]);
    let mut session = Session::builder()
        .transport(transport.clone())
        .instructions("You are precise.")
        .build()
        .expect("session builds");

    let err = session
        .respond_as::<Outline>("outline it")
        .await
        .expect_err("recursive type");

    assert!(matches!(
        err,
        GenerationError::Schema(SchemaError::UnsupportedRecursiveSchema { .. })
    ));
    assert!(transport.requests().is_empty());
    assert_eq!(
        session.transcript().entries(),
        &[
            Entry::Instructions("You are precise.".to_string()),
            Entry::Error(err.clone()),
        ]
    );

    session.respond("hi").await.expect("respond succeeds");
    let requests = transport.requests();
    assert_eq!(system_content(&requests[0]), Some("You are precise."));
}

#[tokio::test]
async fn options_are_merged_over_session_defaults() {
    let transport = MockTransport::with_responses(vec![text_response("a"), text_response("b")]);
    let mut session = Session::builder()
        .transport(transport.clone())
        .options(GenerationOptions::default().temperature(0.2).max_output_tokens(128))
        .build()
        .expect("session builds");

    session.respond("first").await.expect("respond succeeds");
    session
        .respond_with(
            "second",
            &GenerationOptions::default()
                .max_output_tokens(16)
                .model_override("small-model"),
        )
        .await
        .expect("respond succeeds");

    let requests = transport.requests();
    assert_eq!(requests[0].temperature, Some(0.2));
    assert_eq!(requests[0].max_tokens, Some(128));
    assert_eq!(requests[0].model, None);
    assert_eq!(requests[1].temperature, Some(0.2));
    assert_eq!(requests[1].max_tokens, Some(16));
    assert_eq!(requests[1].model.as_deref(), Some("small-model"));

    // History carries over between turns.
    assert_eq!(requests[1].messages.len(), 3);
}

#[test]
fn build_requires_transport_and_unique_tools() {
    let err = Session::builder().build().err().expect("missing transport");
    assert!(matches!(err, GenerationError::Config(_)));

    let err = Session::builder()
        .transport(MockTransport::default())
        .tool(add_tool())
        .tool(add_tool())
        .build()
        .err()
        .expect("duplicate tool");
    assert!(err.to_string().contains("duplicate tool registered: add"));
}

#[test]
fn code_fences_are_stripped() {
    assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
    assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
}
