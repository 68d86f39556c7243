//! Session manager — one resilient connection per client.
//!
//! DESIGN
//! ======
//! A single task owns the connection lifecycle as an explicit state machine:
//!
//! ```text
//! disconnected → connecting → connected
//!                    ↑            │ transport failure
//!                    │            ▼
//!                    └─ reconnecting (bounded, exponential backoff)
//!                                 │ budget exhausted
//!                                 ▼
//!                               error (sticky until explicit reset)
//! ```
//!
//! Transitions are driven by discrete events — connect success, connect
//! failure, explicit close — never ad hoc flags. The attempt counter resets
//! on any successful connection. Credential refresh runs once eagerly and
//! then on a fixed interval; a due refresh rotates the pair through the
//! `TokenRefresher` and transparently reconnects (not billed against the
//! retry budget). Refresh failure is fatal and never silently retried.
//!
//! Conversation continuity: every successful connect resumes the last known
//! conversation id unless a prior resume already failed; a server-side
//! "conversation not found" clears the id, latches resumption off, and
//! starts a fresh conversation — there is no resume retry loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::assembler::{ConfirmPrompt, Effect, TranscriptAssembler};
use crate::client::auth::{Credentials, TokenRefresher};
use crate::client::transport::{Connector, TransportTx};
use crate::protocol::{ChatMessage, ClientMsg, ServerMsg, TokenUsage, now_ms};

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 64;
const READER_CAPACITY: usize = 64;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Connection lifecycle state, surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted or credentials unrecoverable. Sticky until an
    /// explicit [`Command::Reset`].
    Error,
}

/// Commands accepted by the session task.
#[derive(Debug, Clone)]
pub enum Command {
    SendMessage(String),
    Confirm(Uuid),
    Cancel(Uuid),
    /// Leave the sticky error state and retry from scratch.
    Reset,
    /// Tear the session down.
    Close,
}

/// Events emitted to the owning UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    State(ConnectionState),
    /// Snapshot of the visible transcript. When `streaming` is set, the last
    /// message is still growing.
    Transcript {
        messages: Vec<ChatMessage>,
        streaming: bool,
    },
    ConfirmRequested(ConfirmPrompt),
    ConfirmCleared,
    TurnCompleted { usage: Option<TokenUsage> },
    /// Unrecoverable, user-visible failure.
    Fatal(String),
}

/// Session tuning. Defaults match the production websocket behavior; tests
/// shrink the durations.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub refresh_interval: Duration,
    pub refresh_buffer: Duration,
    pub countdown_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            max_attempts: 5,
            refresh_interval: Duration::from_secs(30),
            refresh_buffer: Duration::from_secs(120),
            countdown_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to a spawned session task.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    pub events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send_message(&self, content: impl Into<String>) {
        let _ = self.commands.send(Command::SendMessage(content.into())).await;
    }

    pub async fn confirm(&self, action_id: Uuid) {
        let _ = self.commands.send(Command::Confirm(action_id)).await;
    }

    pub async fn cancel(&self, action_id: Uuid) {
        let _ = self.commands.send(Command::Cancel(action_id)).await;
    }

    pub async fn reset(&self) {
        let _ = self.commands.send(Command::Reset).await;
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Tear down the session and wait for the task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close).await;
        let _ = self.task.await;
    }
}

/// Spawn the session task.
#[must_use]
pub fn spawn_session(
    connector: Arc<dyn Connector>,
    refresher: Arc<dyn TokenRefresher>,
    credentials: Credentials,
    config: SessionConfig,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

    let session = Session {
        connector,
        refresher,
        creds: credentials,
        config,
        assembler: TranscriptAssembler::new(),
        conversation_id: None,
        resume_unavailable: false,
        attempts: 0,
        state: ConnectionState::Disconnected,
        events: event_tx,
    };

    let task = tokio::spawn(session.run(cmd_rx));
    SessionHandle { commands: cmd_tx, events: event_rx, task }
}

// =============================================================================
// SESSION TASK
// =============================================================================

/// Why a connected phase ended.
enum ConnectedExit {
    TransportFailed,
    UserClosed,
    /// Credentials rotated; reconnect immediately with the new pair.
    Reauth,
    /// Credential refresh failed; the session can no longer be trusted.
    FatalRefresh(String),
}

struct Session {
    connector: Arc<dyn Connector>,
    refresher: Arc<dyn TokenRefresher>,
    creds: Credentials,
    config: SessionConfig,
    assembler: TranscriptAssembler,
    conversation_id: Option<Uuid>,
    /// Latched once a resume attempt fails; prevents a resume-fail loop.
    resume_unavailable: bool,
    /// Consecutive failed connect attempts.
    attempts: u32,
    state: ConnectionState,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            // Eager credential check: on the first pass this is the startup
            // check, on later passes it catches expiry during backoff.
            if self.creds.needs_refresh(now_ms(), self.config.refresh_buffer) {
                match self.refresher.refresh(&self.creds.refresh_token).await {
                    Ok(new_creds) => {
                        info!("session: credentials refreshed");
                        self.creds = new_creds;
                    }
                    Err(e) => {
                        error!(error = %e, "session: credential refresh failed");
                        self.enter_fatal(format!("credential refresh failed: {e}")).await;
                        if self.wait_for_reset(&mut cmd_rx).await {
                            continue;
                        }
                        self.set_state(ConnectionState::Disconnected).await;
                        return;
                    }
                }
            }

            self.set_state(ConnectionState::Connecting).await;
            let (mut tx, rx) = match self.connector.connect(&self.creds.access_token).await {
                Ok(halves) => halves,
                Err(e) => {
                    warn!(error = %e, attempt = self.attempts + 1, "session: connect failed");
                    if !self.backoff_or_error(&mut cmd_rx).await {
                        return;
                    }
                    continue;
                }
            };

            self.attempts = 0;

            // Bind the conversation before reporting connected.
            let open = match (self.conversation_id, self.resume_unavailable) {
                (Some(id), false) => ClientMsg::ResumeConversation { conversation_id: id },
                _ => ClientMsg::NewConversation,
            };
            if tx.send(&open).await.is_err() {
                if !self.backoff_or_error(&mut cmd_rx).await {
                    return;
                }
                continue;
            }

            match self.run_connected(&mut cmd_rx, &mut tx, rx).await {
                ConnectedExit::UserClosed => {
                    tx.close().await;
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                ConnectedExit::Reauth => {
                    tx.close().await;
                    // Not a failure: reconnect immediately with the new pair.
                }
                ConnectedExit::FatalRefresh(reason) => {
                    tx.close().await;
                    self.enter_fatal(reason).await;
                    if self.wait_for_reset(&mut cmd_rx).await {
                        continue;
                    }
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                ConnectedExit::TransportFailed => {
                    if !self.backoff_or_error(&mut cmd_rx).await {
                        return;
                    }
                }
            }
        }
    }

    /// The connected phase: pump commands, server messages, and timers until
    /// something ends the connection.
    async fn run_connected(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        tx: &mut Box<dyn TransportTx>,
        mut rx: Box<dyn crate::client::transport::TransportRx>,
    ) -> ConnectedExit {
        self.set_state(ConnectionState::Connected).await;

        // Reader task: the receive half feeds a channel so this loop can
        // keep the send half for commands.
        let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMsg>(READER_CAPACITY);
        let reader = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "session: transport receive ended");
                        break;
                    }
                }
            }
        });

        // First refresh tick lands a full interval out; the eager check
        // already ran before connect.
        let start = tokio::time::Instant::now();
        let mut refresh_tick = tokio::time::interval_at(start + self.config.refresh_interval, self.config.refresh_interval);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut countdown_tick = tokio::time::interval(self.config.countdown_interval);
        countdown_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Close) => break ConnectedExit::UserClosed,
                        Some(Command::Reset) => {}
                        Some(Command::SendMessage(content)) => {
                            self.assembler.push_local_user_message(&content);
                            self.emit_transcript().await;
                            if tx.send(&ClientMsg::Message { content }).await.is_err() {
                                break ConnectedExit::TransportFailed;
                            }
                        }
                        Some(Command::Confirm(action_id)) => {
                            if tx.send(&ClientMsg::Confirm { action_id }).await.is_err() {
                                break ConnectedExit::TransportFailed;
                            }
                        }
                        Some(Command::Cancel(action_id)) => {
                            if tx.send(&ClientMsg::Cancel { action_id }).await.is_err() {
                                break ConnectedExit::TransportFailed;
                            }
                        }
                    }
                }

                received = msg_rx.recv() => {
                    let Some(msg) = received else {
                        break ConnectedExit::TransportFailed;
                    };
                    if self.handle_server_msg(tx, &msg).await.is_err() {
                        break ConnectedExit::TransportFailed;
                    }
                }

                _ = refresh_tick.tick() => {
                    if self.creds.needs_refresh(now_ms(), self.config.refresh_buffer) {
                        match self.refresher.refresh(&self.creds.refresh_token).await {
                            Ok(new_creds) => {
                                info!("session: credentials refreshed, reconnecting");
                                self.creds = new_creds;
                                break ConnectedExit::Reauth;
                            }
                            Err(e) => {
                                error!(error = %e, "session: credential refresh failed");
                                break ConnectedExit::FatalRefresh(format!("credential refresh failed: {e}"));
                            }
                        }
                    }
                }

                _ = countdown_tick.tick() => {
                    self.collapse_expired_confirmation(tx).await;
                }
            }
        };

        reader.abort();
        exit
    }

    /// Fold a server message through the assembler and act on the effects.
    async fn handle_server_msg(&mut self, tx: &mut Box<dyn TransportTx>, msg: &ServerMsg) -> Result<(), ()> {
        for effect in self.assembler.apply(msg) {
            match effect {
                Effect::ConversationBound(id) => {
                    info!(conversation_id = %id, "session: conversation bound");
                    self.conversation_id = Some(id);
                }
                Effect::TranscriptChanged => self.emit_transcript().await,
                Effect::ConfirmRequested(prompt) => {
                    self.emit(SessionEvent::ConfirmRequested(prompt)).await;
                }
                Effect::ConfirmCleared => self.emit(SessionEvent::ConfirmCleared).await,
                Effect::TurnCompleted { usage } => {
                    self.emit(SessionEvent::TurnCompleted { usage }).await;
                }
                Effect::ConversationLost => {
                    warn!("session: server lost the conversation, starting fresh");
                    self.conversation_id = None;
                    self.resume_unavailable = true;
                    if tx.send(&ClientMsg::NewConversation).await.is_err() {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Auto-collapse a confirmation card whose countdown ran out. The server
    /// sweep is authoritative; the cancel sent here is advisory.
    async fn collapse_expired_confirmation(&mut self, tx: &mut Box<dyn TransportTx>) {
        let expired = self
            .assembler
            .pending()
            .is_some_and(|p| p.remaining_ms(now_ms()) == 0);
        if !expired {
            return;
        }

        if let Some(prompt) = self.assembler.clear_pending() {
            info!(action_id = %prompt.action_id, "session: confirmation expired locally");
            self.emit(SessionEvent::ConfirmCleared).await;
            let _ = tx.send(&ClientMsg::Cancel { action_id: prompt.action_id }).await;
        }
    }

    /// Back off before the next connect attempt, or park in the error state
    /// when the budget is exhausted. Returns `false` when the session should
    /// end (user close).
    async fn backoff_or_error(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
        self.attempts += 1;

        if self.attempts >= self.config.max_attempts {
            self.enter_fatal(format!(
                "connection lost after {} attempts; reconnect paused until reset",
                self.attempts
            ))
            .await;
            if self.wait_for_reset(cmd_rx).await {
                return true;
            }
            self.set_state(ConnectionState::Disconnected).await;
            return false;
        }

        self.set_state(ConnectionState::Reconnecting { attempt: self.attempts }).await;
        let delay = backoff_delay(self.config, self.attempts);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "session: backing off");

        // Stay responsive to close/reset while sleeping.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => {
                        self.set_state(ConnectionState::Disconnected).await;
                        return false;
                    }
                    Some(Command::Reset) => {
                        self.attempts = 0;
                        return true;
                    }
                    Some(other) => {
                        warn!(?other, "session: command dropped while reconnecting");
                    }
                },
            }
        }
    }

    /// Park in the sticky error state until an explicit reset. Returns
    /// `false` on close.
    async fn wait_for_reset(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
        loop {
            match cmd_rx.recv().await {
                None | Some(Command::Close) => return false,
                Some(Command::Reset) => {
                    info!("session: reset, retrying");
                    self.attempts = 0;
                    return true;
                }
                Some(other) => {
                    warn!(?other, "session: command dropped in error state");
                }
            }
        }
    }

    async fn enter_fatal(&mut self, reason: String) {
        self.set_state(ConnectionState::Error).await;
        self.emit(SessionEvent::Fatal(reason)).await;
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.emit(SessionEvent::State(state)).await;
    }

    async fn emit_transcript(&mut self) {
        let messages = self.assembler.messages().to_vec();
        let streaming = self.assembler.is_streaming();
        self.emit(SessionEvent::Transcript { messages, streaming }).await;
    }

    async fn emit(&mut self, event: SessionEvent) {
        // A dropped event receiver must not kill the session task.
        let _ = self.events.send(event).await;
    }
}

/// Exponential backoff: base doubling per attempt, capped.
fn backoff_delay(config: SessionConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config.backoff_base.saturating_mul(factor).min(config.backoff_cap)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
