use super::*;
use crate::services::agent::AgentBackend;
use crate::services::approval::ApprovalConfig;
use crate::services::broadcast::ChangeEvent;
use crate::services::tools::{ToolExecutor, ToolOutcome};
use crate::state::test_helpers;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// MOCK COLLABORATORS
// =============================================================================

struct MockAgent {
    turns: Mutex<Vec<Vec<AgentEvent>>>,
}

impl MockAgent {
    fn new(turns: Vec<Vec<AgentEvent>>) -> Arc<Self> {
        Arc::new(Self { turns: Mutex::new(turns) })
    }
}

#[async_trait]
impl AgentBackend for MockAgent {
    async fn begin_turn(
        &self,
        _user_id: Uuid,
        _history: &[ChatMessage],
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError> {
        let mut turns = self.turns.lock().expect("mock mutex should lock");
        let events = if turns.is_empty() { Vec::new() } else { turns.remove(0) };
        let (tx, rx) = mpsc::channel(32);
        for event in events {
            tx.try_send(event).expect("scripted events should fit the channel");
        }
        Ok(rx)
    }
}

struct MockTools {
    calls: Mutex<Vec<(Uuid, String, serde_json::Value)>>,
    fail: bool,
}

impl MockTools {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), fail: false })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), fail: true })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("mock mutex should lock").len()
    }
}

#[async_trait]
impl ToolExecutor for MockTools {
    async fn execute(
        &self,
        user_id: Uuid,
        tool: &str,
        input: &serde_json::Value,
    ) -> Result<ToolOutcome, ToolError> {
        self.calls
            .lock()
            .expect("mock mutex should lock")
            .push((user_id, tool.to_string(), input.clone()));
        if self.fail {
            return Err(ToolError::Failed { tool: tool.to_string(), message: "insufficient funds".into() });
        }
        Ok(ToolOutcome {
            message: format!("Done: {tool} executed."),
            change: Some(ChangeEvent::new("transaction", "created")),
        })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

struct Harness {
    state: AppState,
    conversation: Option<Uuid>,
    user_id: Uuid,
    out_tx: mpsc::Sender<ServerMsg>,
    out_rx: mpsc::Receiver<ServerMsg>,
}

impl Harness {
    fn new(state: AppState) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self { state, conversation: None, user_id: Uuid::new_v4(), out_tx, out_rx }
    }

    async fn send(&mut self, msg: &ClientMsg) {
        let text = serde_json::to_string(msg).expect("serialize client msg");
        process_client_text(&self.state, &mut self.conversation, self.user_id, &self.out_tx, &text)
            .await
            .expect("outbound channel should stay open");
    }

    fn drain(&mut self) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = self.out_rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

fn error_code(msg: &ServerMsg) -> Option<&str> {
    match msg {
        ServerMsg::Error { code, .. } => code.as_deref(),
        _ => None,
    }
}

// =============================================================================
// CONVERSATION BINDING
// =============================================================================

#[tokio::test]
async fn new_conversation_binds_and_acks() {
    let mut h = Harness::new(test_helpers::test_app_state());

    h.send(&ClientMsg::NewConversation).await;

    let out = h.drain();
    assert_eq!(out.len(), 1);
    let ServerMsg::ConversationStarted { conversation_id } = &out[0] else {
        panic!("expected conversation_started, got {out:?}");
    };
    assert_eq!(h.conversation, Some(*conversation_id));
}

#[tokio::test]
async fn resume_unknown_conversation_reports_not_found() {
    let mut h = Harness::new(test_helpers::test_app_state());

    h.send(&ClientMsg::ResumeConversation { conversation_id: Uuid::new_v4() }).await;

    let out = h.drain();
    assert_eq!(out.len(), 1);
    assert_eq!(error_code(&out[0]), Some(crate::protocol::CODE_CONVERSATION_NOT_FOUND));
    assert!(h.conversation.is_none());
}

#[tokio::test]
async fn resume_returns_transcript_verbatim() {
    let mut h = Harness::new(test_helpers::test_app_state());

    let created = h.state.store.create(h.user_id).await.expect("create should succeed");
    h.state
        .store
        .append(h.user_id, created.id, ChatMessage::user("hi"))
        .await
        .expect("append should succeed");
    h.state
        .store
        .append(h.user_id, created.id, ChatMessage::assistant("hello"))
        .await
        .expect("append should succeed");

    h.send(&ClientMsg::ResumeConversation { conversation_id: created.id }).await;

    let out = h.drain();
    let ServerMsg::ConversationResumed { conversation_id, messages } = &out[0] else {
        panic!("expected conversation_resumed, got {out:?}");
    };
    assert_eq!(*conversation_id, created.id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].content, "hello");
}

// =============================================================================
// AGENT TURNS
// =============================================================================

#[tokio::test]
async fn streamed_turn_final_text_is_authoritative() {
    let agent = MockAgent::new(vec![vec![
        AgentEvent::Chunk("The".into()),
        AgentEvent::Chunk(" balance".into()),
        AgentEvent::Chunk(" is $42".into()),
        AgentEvent::Final("The balance is $42".into()),
        AgentEvent::Complete { usage: Some(crate::protocol::TokenUsage { input_tokens: 9, output_tokens: 7 }) },
    ]]);
    let mut h = Harness::new(test_helpers::test_app_state_with(Some(agent), None));

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "What's my balance?".into() }).await;

    let out = h.drain();
    let kinds: Vec<&str> = out.iter().map(ServerMsg::kind).collect();
    assert_eq!(
        kinds,
        vec!["conversation_started", "text_chunk", "text_chunk", "text_chunk", "text", "complete"]
    );

    // The transcript holds exactly one user and one assistant message, and
    // the assistant content is the final text, not the chunk concatenation.
    let conversation_id = h.conversation.expect("conversation should be bound");
    let stored = h
        .state
        .store
        .get(h.user_id, conversation_id)
        .await
        .expect("get should succeed");
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].role, crate::protocol::Role::User);
    assert_eq!(stored.messages[1].role, crate::protocol::Role::Assistant);
    assert_eq!(stored.messages[1].content, "The balance is $42");
}

#[tokio::test]
async fn message_without_conversation_is_rejected() {
    let mut h = Harness::new(test_helpers::test_app_state());

    h.send(&ClientMsg::Message { content: "hello".into() }).await;

    let out = h.drain();
    assert_eq!(error_code(&out[0]), Some("E_NO_CONVERSATION"));
}

#[tokio::test]
async fn message_without_agent_is_rejected() {
    let mut h = Harness::new(test_helpers::test_app_state());

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "hello".into() }).await;

    let out = h.drain();
    assert_eq!(error_code(&out[1]), Some("E_AGENT_UNAVAILABLE"));
}

#[tokio::test]
async fn agent_failure_surfaces_as_error_frame() {
    let agent = MockAgent::new(vec![vec![AgentEvent::Failed(AgentError::Request("upstream 500".into()))]]);
    let mut h = Harness::new(test_helpers::test_app_state_with(Some(agent), None));

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "hello".into() }).await;

    let out = h.drain();
    assert_eq!(error_code(&out[1]), Some("E_AGENT_REQUEST"));
}

#[tokio::test]
async fn invalid_json_is_rejected_without_dropping_connection() {
    let state = test_helpers::test_app_state();
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let mut conversation = None;

    process_client_text(&state, &mut conversation, Uuid::new_v4(), &out_tx, "{nope")
        .await
        .expect("outbound channel should stay open");

    let msg = out_rx.try_recv().expect("expected an error frame");
    assert_eq!(error_code(&msg), Some("E_BAD_MESSAGE"));
}

// =============================================================================
// CONFIRMATION FLOW
// =============================================================================

fn approval_agent() -> Arc<MockAgent> {
    MockAgent::new(vec![vec![
        AgentEvent::Chunk("I can send that.".into()),
        AgentEvent::Final("I can send that.".into()),
        AgentEvent::RequestApproval {
            tool: "send_money".into(),
            input: json!({"to": "bob", "amount": 10}),
            summary: "send $10 to bob".into(),
        },
    ]])
}

#[tokio::test]
async fn approval_flow_executes_tool_exactly_once() {
    let tools = MockTools::new();
    let mut h = Harness::new(test_helpers::test_app_state_with(Some(approval_agent()), Some(tools.clone())));
    let (_feed_id, mut feed_rx) = h.state.feed.subscribe();

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "send bob $10".into() }).await;

    let out = h.drain();
    let ServerMsg::ConfirmRequest { action_id, tool, expires_at, .. } = out.last().expect("frames") else {
        panic!("expected confirm_request last, got {out:?}");
    };
    assert_eq!(tool, "send_money");
    assert!(*expires_at > crate::protocol::now_ms());
    // The turn is held open: no complete frame yet.
    assert!(!out.iter().any(|m| m.kind() == "complete"));
    assert!(h.state.gateway.lookup(h.user_id, *action_id).is_some());

    h.send(&ClientMsg::Confirm { action_id: *action_id }).await;

    let out = h.drain();
    let kinds: Vec<&str> = out.iter().map(ServerMsg::kind).collect();
    assert_eq!(kinds, vec!["text", "complete"]);
    assert_eq!(tools.call_count(), 1);
    assert!(h.state.gateway.lookup(h.user_id, *action_id).is_none());

    // The confirmed execution published a change event to the feed.
    let change = feed_rx.try_recv().expect("expected a change event");
    assert_eq!(change.resource, "transaction");
    assert_eq!(change.action, "created");

    // Confirming again cannot re-execute the tool.
    h.send(&ClientMsg::Confirm { action_id: *action_id }).await;
    let out = h.drain();
    assert_eq!(error_code(&out[0]), Some(crate::protocol::CODE_ACTION_NOT_FOUND));
    assert_eq!(tools.call_count(), 1);
}

#[tokio::test]
async fn confirm_after_expiry_reports_expired_and_never_executes() {
    let tools = MockTools::new();
    let state = test_helpers::with_gateway_config(
        test_helpers::test_app_state_with(Some(approval_agent()), Some(tools.clone())),
        ApprovalConfig { ttl: Duration::ZERO, bucket_width: Duration::from_secs(600) },
    );
    let mut h = Harness::new(state);

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "send bob $10".into() }).await;

    let out = h.drain();
    let ServerMsg::ConfirmRequest { action_id, .. } = out.last().expect("frames") else {
        panic!("expected confirm_request last");
    };

    h.send(&ClientMsg::Confirm { action_id: *action_id }).await;

    let out = h.drain();
    assert_eq!(error_code(&out[0]), Some(crate::protocol::CODE_ACTION_EXPIRED));
    assert_eq!(tools.call_count(), 0);
}

#[tokio::test]
async fn cancel_resolves_turn_and_tolerates_duplicates() {
    let tools = MockTools::new();
    let mut h = Harness::new(test_helpers::test_app_state_with(Some(approval_agent()), Some(tools.clone())));

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "send bob $10".into() }).await;
    let out = h.drain();
    let ServerMsg::ConfirmRequest { action_id, .. } = out.last().expect("frames") else {
        panic!("expected confirm_request last");
    };
    let action_id = *action_id;

    h.send(&ClientMsg::Cancel { action_id }).await;
    h.send(&ClientMsg::Cancel { action_id }).await;

    let out = h.drain();
    assert_eq!(out.iter().filter(|m| m.kind() == "complete").count(), 2);
    assert!(out.iter().all(|m| error_code(m).is_none()));
    assert_eq!(tools.call_count(), 0);

    // A cancelled action cannot be confirmed afterwards.
    h.send(&ClientMsg::Confirm { action_id }).await;
    let out = h.drain();
    assert_eq!(error_code(&out[0]), Some(crate::protocol::CODE_ACTION_NOT_FOUND));
}

#[tokio::test]
async fn tool_failure_keeps_conversation_alive() {
    let tools = MockTools::failing();
    let agent = MockAgent::new(vec![
        vec![AgentEvent::RequestApproval {
            tool: "send_money".into(),
            input: json!({"to": "bob", "amount": 10}),
            summary: "send $10 to bob".into(),
        }],
        vec![
            AgentEvent::Final("Still here.".into()),
            AgentEvent::Complete { usage: None },
        ],
    ]);
    let mut h = Harness::new(test_helpers::test_app_state_with(Some(agent), Some(tools)));

    h.send(&ClientMsg::NewConversation).await;
    h.send(&ClientMsg::Message { content: "send bob $10".into() }).await;
    let out = h.drain();
    let ServerMsg::ConfirmRequest { action_id, .. } = out.last().expect("frames") else {
        panic!("expected confirm_request last");
    };

    h.send(&ClientMsg::Confirm { action_id: *action_id }).await;
    let out = h.drain();
    assert_eq!(error_code(&out[0]), Some("E_TOOL_FAILED"));
    assert_eq!(out[1].kind(), "complete");

    // The session keeps working after the failed tool call.
    h.send(&ClientMsg::Message { content: "are you there?".into() }).await;
    let out = h.drain();
    assert!(out.iter().any(|m| matches!(m, ServerMsg::Text { content } if content == "Still here.")));
}
