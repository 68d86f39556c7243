//! Confirmation gateway — human approval for side-effecting tool calls.
//!
//! DESIGN
//! ======
//! Pending actions live in a shared registry behind a mutex. Registration is
//! idempotent within a time bucket: the key is a SHA-256 over (user, tool,
//! canonicalized input, bucket), so a retried request returns the existing
//! pending action instead of stacking approval prompts. Every action has a
//! hard TTL; a background sweep expires overdue actions independent of
//! client liveness.
//!
//! TRADE-OFFS
//! ==========
//! Resolved actions leave a short-lived tombstone so late duplicates are
//! classified correctly: confirming an action the sweep already expired
//! reports `Expired` (not `NotFound`), and a duplicate cancel is a no-op
//! success. Tombstones are pruned after one bucket width.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{ErrorCode, now_ms};

const DEFAULT_TTL_SECS: u64 = 60;
const DEFAULT_BUCKET_SECS: u64 = 600;
const SWEEP_INTERVAL_MS: u64 = 1000;

// =============================================================================
// CONFIG
// =============================================================================

/// Approval window tuning, loaded from environment variables.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalConfig {
    /// How long a pending action stays confirmable.
    pub ttl: Duration,
    /// Width of the idempotency time bucket.
    pub bucket_width: Duration,
}

impl ApprovalConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_parse("APPROVAL_TTL_SECS", DEFAULT_TTL_SECS)),
            bucket_width: Duration::from_secs(env_parse("APPROVAL_BUCKET_SECS", DEFAULT_BUCKET_SECS)),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            bucket_width: Duration::from_secs(DEFAULT_BUCKET_SECS),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no pending action with that id")]
    NotFound,
    #[error("the approval window for this action has expired")]
    Expired,
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound => crate::protocol::CODE_ACTION_NOT_FOUND,
            Self::Expired => crate::protocol::CODE_ACTION_EXPIRED,
        }
    }
}

/// A side-effecting tool call awaiting human approval.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingAction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tool: String,
    pub summary: String,
    pub input: serde_json::Value,
    /// Milliseconds since Unix epoch.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Confirmed,
    Cancelled,
    Expired,
}

struct Tombstone {
    user_id: Uuid,
    resolution: Resolution,
    resolved_at: i64,
}

struct GatewayInner {
    /// Unresolved actions keyed by action id.
    pending: HashMap<Uuid, PendingAction>,
    /// Idempotency key -> unresolved action id.
    by_key: HashMap<String, Uuid>,
    /// Reverse of `by_key`, so resolution can drop the key entry.
    key_of: HashMap<Uuid, String>,
    /// Terminal outcomes of recently resolved actions.
    resolved: HashMap<Uuid, Tombstone>,
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Clone)]
pub struct ApprovalGateway {
    inner: Arc<Mutex<GatewayInner>>,
    config: ApprovalConfig,
}

impl ApprovalGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ApprovalConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: ApprovalConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GatewayInner {
                pending: HashMap::new(),
                by_key: HashMap::new(),
                key_of: HashMap::new(),
                resolved: HashMap::new(),
            })),
            config,
        }
    }

    /// Register a side-effecting action for approval. Returns the existing
    /// pending action when an unresolved one already matches the idempotency
    /// key (same user, tool, input, and time bucket).
    pub fn register(
        &self,
        user_id: Uuid,
        tool: &str,
        input: serde_json::Value,
        summary: &str,
    ) -> PendingAction {
        self.register_at(user_id, tool, input, summary, self.config.ttl, now_ms())
    }

    /// Register with a caller-chosen TTL. Higher-friction tools can hold the
    /// approval window open longer than the gateway default.
    pub fn register_with_ttl(
        &self,
        user_id: Uuid,
        tool: &str,
        input: serde_json::Value,
        summary: &str,
        ttl: Duration,
    ) -> PendingAction {
        self.register_at(user_id, tool, input, summary, ttl, now_ms())
    }

    fn register_at(
        &self,
        user_id: Uuid,
        tool: &str,
        input: serde_json::Value,
        summary: &str,
        ttl: Duration,
        now: i64,
    ) -> PendingAction {
        let key = idempotency_key(user_id, tool, &input, bucket_index(now, self.config.bucket_width));

        let mut inner = self.lock();

        if let Some(existing_id) = inner.by_key.get(&key).copied() {
            if let Some(existing) = inner.pending.get(&existing_id) {
                if now < existing.expires_at {
                    debug!(action_id = %existing_id, %tool, "approval: deduplicated registration");
                    return existing.clone();
                }
            }
            // The keyed action expired but the sweep has not run yet.
            resolve(&mut inner, existing_id, Resolution::Expired, now);
        }

        let action = PendingAction {
            id: Uuid::new_v4(),
            user_id,
            tool: tool.to_string(),
            summary: summary.to_string(),
            input,
            expires_at: now + duration_ms(ttl),
        };
        inner.by_key.insert(key.clone(), action.id);
        inner.key_of.insert(action.id, key);
        inner.pending.insert(action.id, action.clone());
        info!(action_id = %action.id, %user_id, %tool, expires_at = action.expires_at, "approval: registered pending action");
        action
    }

    /// Approve a pending action. On success the action is removed and
    /// returned; the caller is responsible for executing the tool exactly
    /// once. A past-expiry confirm fails with [`GatewayError::Expired`] and
    /// implicitly cancels the action.
    pub fn confirm(&self, user_id: Uuid, action_id: Uuid) -> Result<PendingAction, GatewayError> {
        self.confirm_at(user_id, action_id, now_ms())
    }

    fn confirm_at(&self, user_id: Uuid, action_id: Uuid, now: i64) -> Result<PendingAction, GatewayError> {
        let mut inner = self.lock();

        if let Some(action) = inner.pending.get(&action_id) {
            if action.user_id != user_id {
                return Err(GatewayError::NotFound);
            }
            if now >= action.expires_at {
                resolve(&mut inner, action_id, Resolution::Expired, now);
                return Err(GatewayError::Expired);
            }
            let action = resolve(&mut inner, action_id, Resolution::Confirmed, now)
                .ok_or(GatewayError::NotFound)?;
            info!(%action_id, %user_id, tool = %action.tool, "approval: confirmed");
            return Ok(action);
        }

        match inner.resolved.get(&action_id) {
            Some(t) if t.user_id == user_id && t.resolution == Resolution::Expired => Err(GatewayError::Expired),
            _ => Err(GatewayError::NotFound),
        }
    }

    /// Reject a pending action. Cancelling an action that already reached a
    /// terminal state is a no-op success, so duplicate client cancels (e.g.
    /// local countdown expiry racing an explicit reject) never error.
    pub fn cancel(&self, user_id: Uuid, action_id: Uuid) -> Result<(), GatewayError> {
        self.cancel_at(user_id, action_id, now_ms())
    }

    fn cancel_at(&self, user_id: Uuid, action_id: Uuid, now: i64) -> Result<(), GatewayError> {
        let mut inner = self.lock();

        if let Some(action) = inner.pending.get(&action_id) {
            if action.user_id != user_id {
                return Err(GatewayError::NotFound);
            }
            resolve(&mut inner, action_id, Resolution::Cancelled, now);
            info!(%action_id, %user_id, "approval: cancelled");
            return Ok(());
        }

        match inner.resolved.get(&action_id) {
            Some(t) if t.user_id == user_id => Ok(()),
            _ => Err(GatewayError::NotFound),
        }
    }

    /// Look up an unresolved, unexpired pending action.
    #[must_use]
    pub fn lookup(&self, user_id: Uuid, action_id: Uuid) -> Option<PendingAction> {
        self.lookup_at(user_id, action_id, now_ms())
    }

    fn lookup_at(&self, user_id: Uuid, action_id: Uuid, now: i64) -> Option<PendingAction> {
        let inner = self.lock();
        inner
            .pending
            .get(&action_id)
            .filter(|a| a.user_id == user_id && now < a.expires_at)
            .cloned()
    }

    /// Expire overdue actions and prune old tombstones. Returns how many
    /// actions were expired.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_ms())
    }

    fn sweep_expired_at(&self, now: i64) -> usize {
        let mut inner = self.lock();

        let overdue: Vec<Uuid> = inner
            .pending
            .values()
            .filter(|a| now >= a.expires_at)
            .map(|a| a.id)
            .collect();
        for id in &overdue {
            resolve(&mut inner, *id, Resolution::Expired, now);
        }

        let retention = duration_ms(self.config.bucket_width);
        inner.resolved.retain(|_, t| now - t.resolved_at < retention);

        overdue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GatewayInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ApprovalGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Move a pending action to a terminal state, dropping its idempotency key.
fn resolve(inner: &mut GatewayInner, action_id: Uuid, resolution: Resolution, now: i64) -> Option<PendingAction> {
    let action = inner.pending.remove(&action_id)?;
    if let Some(key) = inner.key_of.remove(&action_id) {
        inner.by_key.remove(&key);
    }
    inner
        .resolved
        .insert(action_id, Tombstone { user_id: action.user_id, resolution, resolved_at: now });
    Some(action)
}

// =============================================================================
// IDEMPOTENCY KEY
// =============================================================================

/// Which bucket an epoch-ms timestamp falls into.
fn bucket_index(now_ms: i64, bucket_width: Duration) -> i64 {
    let width = duration_ms(bucket_width).max(1);
    now_ms.div_euclid(width)
}

/// Stable hex key over (user, tool, canonical input, time bucket).
fn idempotency_key(user_id: Uuid, tool: &str, input: &serde_json::Value, bucket: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(tool.as_bytes());
    hasher.update(canonical_json(input).as_bytes());
    hasher.update(bucket.to_be_bytes());
    bytes_to_hex(&hasher.finalize())
}

/// Deterministic JSON rendering: object keys sorted recursively, no
/// insignificant whitespace. Two semantically equal inputs hash alike.
fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// SWEEP TASK
// =============================================================================

/// Spawn the background expiry sweep. Returns a handle for shutdown.
pub fn spawn_sweep_task(gateway: ApprovalGateway) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let expired = gateway.sweep_expired();
            if expired > 0 {
                debug!(expired, "approval: swept expired actions");
            }
        }
    })
}

#[cfg(test)]
#[path = "approval_test.rs"]
mod tests;
