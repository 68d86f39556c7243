use super::*;
use crate::llm::types::{ChatResponse, LlmError, Tool};
use serde_json::json;
use std::sync::Mutex;

struct MockLlm {
    responses: Mutex<Vec<Result<ChatResponse, LlmError>>>,
}

impl MockLlm {
    fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self { responses: Mutex::new(responses) })
    }
}

#[async_trait]
impl LlmChat for MockLlm {
    async fn chat(
        &self,
        _max_tokens: u32,
        _system: &str,
        _messages: &[Message],
        _tools: Option<&[Tool]>,
    ) -> Result<ChatResponse, LlmError> {
        self.responses
            .lock()
            .expect("mock mutex should lock")
            .remove(0)
    }
}

fn text_response(parts: &[&str]) -> ChatResponse {
    ChatResponse {
        content: parts
            .iter()
            .map(|t| ContentBlock::Text { text: (*t).to_string() })
            .collect(),
        model: "mock".into(),
        stop_reason: "end_turn".into(),
        input_tokens: 10,
        output_tokens: 4,
    }
}

async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn text_turn_emits_chunks_final_complete() {
    let llm = MockLlm::new(vec![Ok(text_response(&["The balance", " is $42"]))]);
    let agent = LlmAgent::new(llm, Vec::new());

    let rx = agent
        .begin_turn(Uuid::new_v4(), &[ChatMessage::user("balance?")])
        .await
        .expect("turn should start");
    let events = collect_events(rx).await;

    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], AgentEvent::Chunk(c) if c == "The balance"));
    assert!(matches!(&events[1], AgentEvent::Chunk(c) if c == " is $42"));
    assert!(matches!(&events[2], AgentEvent::Final(t) if t == "The balance is $42"));
    let AgentEvent::Complete { usage: Some(usage) } = &events[3] else {
        panic!("expected complete with usage");
    };
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.output_tokens, 4);
}

#[tokio::test]
async fn tool_use_holds_turn_open_with_approval_request() {
    let response = ChatResponse {
        content: vec![
            ContentBlock::Text { text: "Sure, sending now.".into() },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "send_money".into(),
                input: json!({"to": "bob", "amount": 10}),
            },
        ],
        model: "mock".into(),
        stop_reason: "tool_use".into(),
        input_tokens: 20,
        output_tokens: 8,
    };
    let llm = MockLlm::new(vec![Ok(response)]);
    let agent = LlmAgent::new(llm, Vec::new());

    let rx = agent
        .begin_turn(Uuid::new_v4(), &[ChatMessage::user("send bob $10")])
        .await
        .expect("turn should start");
    let events = collect_events(rx).await;

    // No Complete: the approval request is the terminal event of the stream.
    let AgentEvent::RequestApproval { tool, input, summary } = events.last().expect("events") else {
        panic!("expected approval request last");
    };
    assert_eq!(tool, "send_money");
    assert_eq!(input.get("to").and_then(|v| v.as_str()), Some("bob"));
    assert!(summary.starts_with("send_money"));
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Complete { .. })));
}

#[tokio::test]
async fn provider_failure_surfaces_as_failed_event() {
    let llm = MockLlm::new(vec![Err(LlmError::ApiRequest("connection refused".into()))]);
    let agent = LlmAgent::new(llm, Vec::new());

    let rx = agent
        .begin_turn(Uuid::new_v4(), &[ChatMessage::user("hi")])
        .await
        .expect("turn should start");
    let events = collect_events(rx).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], AgentEvent::Failed(AgentError::Request(_))));
}

#[test]
fn summarize_truncates_long_inputs() {
    let input = json!({"memo": "x".repeat(500)});
    let summary = summarize("send_money", &input);
    assert!(summary.chars().count() <= SUMMARY_MAX_CHARS);
    assert!(summary.ends_with('…'));
}

#[test]
fn summarize_is_compact_for_small_inputs() {
    let summary = summarize("pay_bill", &json!({"biller": "electric"}));
    assert_eq!(summary, r#"pay_bill {"biller":"electric"}"#);
}
