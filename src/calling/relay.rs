//! Signal relay over the `call_signals` table.
//!
//! There is no signaling server: each offer, answer and ICE candidate is
//! written as a row, and the other participant learns about it through an
//! insert subscription filtered by call id.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::CallError;
use super::CallId;
use crate::backend::{DataStore, Filter, Row, SubscriptionId};

pub const SIGNALS_TABLE: &str = "call_signals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Offer => f.write_str("offer"),
            SignalType::Answer => f.write_str("answer"),
            SignalType::IceCandidate => f.write_str("ice-candidate"),
        }
    }
}

/// Row ids are uuids on some deployments and bigints on others.
fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(d)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

/// One row of `call_signals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(
        default,
        deserialize_with = "id_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    pub call_id: CallId,
    pub sender_id: String,
    pub signal_type: SignalType,
    #[serde(rename = "signal_data")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl SignalMessage {
    pub fn new(
        call_id: CallId,
        sender_id: impl Into<String>,
        signal_type: SignalType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            call_id,
            sender_id: sender_id.into(),
            signal_type,
            payload,
            created_at: None,
        }
    }

    pub fn from_row(row: &Row) -> Result<Self, serde_json::Error> {
        Self::deserialize(row)
    }

    /// Decode `signal_data` as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Exponential backoff for signal writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

struct ActiveSubscription {
    call_id: CallId,
    store_id: SubscriptionId,
    pump: JoinHandle<()>,
}

/// Sends and receives signaling rows for the local user.
pub struct SignalRelay {
    store: Arc<dyn DataStore>,
    self_id: String,
    retry: RetryPolicy,
    active: Mutex<Option<ActiveSubscription>>,
}

impl SignalRelay {
    pub fn new(store: Arc<dyn DataStore>, self_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            self_id: self_id.into(),
            retry,
            active: Mutex::new(None),
        }
    }

    /// Append one signal row, retrying failed writes with backoff.
    pub async fn send(
        &self,
        call_id: &CallId,
        signal_type: SignalType,
        payload: serde_json::Value,
    ) -> Result<SignalMessage, CallError> {
        let message = SignalMessage::new(call_id.clone(), self.self_id.clone(), signal_type, payload);
        let row = serde_json::to_value(&message).map_err(|e| CallError::SignalDelivery {
            kind: signal_type,
            reason: e.to_string(),
        })?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.insert(SIGNALS_TABLE, row.clone()).await {
                Ok(stored) => {
                    tracing::debug!("Sent {} for call {} (attempt {})", signal_type, call_id, attempt);
                    return Ok(SignalMessage::from_row(&stored).unwrap_or(message));
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Sending {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        signal_type,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(CallError::SignalDelivery {
                        kind: signal_type,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
    }

    /// Start receiving the other participant's signals for `call_id`.
    ///
    /// Rows written before the subscription opened are replayed first.
    /// Replaces any previous subscription of this relay.
    pub async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, CallError> {
        self.unsubscribe().await;

        let filter = Filter::eq("call_id", call_id.as_str());
        let sub = self
            .store
            .subscribe_to_inserts(SIGNALS_TABLE, filter.clone())
            .await
            .map_err(|e| CallError::Relay(format!("{:#}", e)))?;

        let backlog = match self.store.query(SIGNALS_TABLE, &[filter]).await {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(e) = self.store.remove_subscription(sub.id).await {
                    tracing::warn!("Failed to remove signal subscription: {:#}", e);
                }
                return Err(CallError::Relay(format!("{:#}", e)));
            }
        };
        tracing::info!(
            "Subscribed to signals for call {} ({} earlier rows)",
            call_id,
            backlog.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let self_id = self.self_id.clone();
        let mut live = sub.rows;
        let pump = tokio::spawn(async move {
            let mut seen = HashSet::new();
            for row in backlog {
                if !deliver(&row, &self_id, &mut seen, &tx) {
                    return;
                }
            }
            while let Some(row) = live.recv().await {
                if !deliver(&row, &self_id, &mut seen, &tx) {
                    return;
                }
            }
        });

        let previous = self.lock().replace(ActiveSubscription {
            call_id: call_id.clone(),
            store_id: sub.id,
            pump,
        });
        if let Some(prev) = previous {
            // Lost a race with a concurrent subscribe.
            self.teardown(prev).await;
        }
        Ok(rx)
    }

    /// Stop delivery and drop the store subscription. Safe to call repeatedly.
    pub async fn unsubscribe(&self) {
        let active = self.lock().take();
        if let Some(active) = active {
            self.teardown(active).await;
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().is_some()
    }

    async fn teardown(&self, active: ActiveSubscription) {
        active.pump.abort();
        if let Err(e) = self.store.remove_subscription(active.store_id).await {
            tracing::warn!("Failed to remove signal subscription: {:#}", e);
        }
        tracing::info!("Unsubscribed from signals for call {}", active.call_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveSubscription>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        if let Some(active) = self.lock().take() {
            active.pump.abort();
        }
    }
}

/// Forward one row to the consumer. Returns false once the consumer is gone.
fn deliver(
    row: &Row,
    self_id: &str,
    seen: &mut HashSet<String>,
    tx: &mpsc::UnboundedSender<SignalMessage>,
) -> bool {
    let message = match SignalMessage::from_row(row) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Skipping malformed signal row: {}", e);
            return true;
        }
    };
    if let Some(id) = &message.id {
        if !seen.insert(id.clone()) {
            return true;
        }
    }
    if message.sender_id == self_id {
        return true;
    }
    tracing::debug!(
        "Received {} from {} for call {}",
        message.signal_type,
        message.sender_id,
        message.call_id
    );
    tx.send(message).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use serde_json::json;

    fn relay(store: &Arc<MemoryStore>, user: &str) -> SignalRelay {
        SignalRelay::new(store.clone(), user, RetryPolicy::default())
    }

    #[test]
    fn test_row_shape() {
        let msg = SignalMessage::new(
            CallId::from("abc"),
            "alice",
            SignalType::IceCandidate,
            json!({"candidate": "candidate:1 1 UDP 1 10.0.0.1 5000 typ host"}),
        );
        let row = serde_json::to_value(&msg).unwrap();
        assert_eq!(row["call_id"], "abc");
        assert_eq!(row["signal_type"], "ice-candidate");
        assert!(row["signal_data"]["candidate"].is_string());
        assert!(row.get("id").is_none());
    }

    #[test]
    fn test_numeric_row_id() {
        let msg = SignalMessage::from_row(&json!({
            "id": 42,
            "call_id": "abc",
            "sender_id": "bob",
            "signal_type": "answer",
            "signal_data": {"type": "answer", "sdp": "v=0"}
        }))
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("42"));
        assert_eq!(msg.signal_type, SignalType::Answer);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10), Duration::from_millis(4000));
        assert_eq!(policy.backoff(100), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_backlog_then_live_without_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let alice = relay(&store, "alice");
        let bob = relay(&store, "bob");
        let call = CallId::from("abc");

        alice
            .send(&call, SignalType::Offer, json!({"type": "offer", "sdp": "v=0"}))
            .await
            .unwrap();

        let mut rx = bob.subscribe(&call).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.signal_type, SignalType::Offer);
        assert_eq!(first.sender_id, "alice");

        alice
            .send(&call, SignalType::IceCandidate, json!({"candidate": "c"}))
            .await
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.signal_type, SignalType::IceCandidate);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_and_malformed_rows_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let alice = relay(&store, "alice");
        let call = CallId::from("abc");
        let mut rx = alice.subscribe(&call).await.unwrap();

        alice
            .send(&call, SignalType::Offer, json!({"sdp": "v=0"}))
            .await
            .unwrap();
        store
            .insert(SIGNALS_TABLE, json!({"call_id": "abc", "sender_id": "bob", "signal_type": "bogus"}))
            .await
            .unwrap();
        store
            .insert(
                SIGNALS_TABLE,
                json!({"call_id": "abc", "sender_id": "bob", "signal_type": "answer", "signal_data": {}}),
            )
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender_id, "bob");
        assert_eq!(msg.signal_type, SignalType::Answer);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let alice = relay(&store, "alice");
        store.fail_next_inserts(2);

        let sent = alice
            .send(&CallId::from("abc"), SignalType::Offer, json!({}))
            .await
            .unwrap();
        assert!(sent.id.is_some());
        assert_eq!(store.rows(SIGNALS_TABLE).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_gives_up_after_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        let alice = relay(&store, "alice");
        store.fail_next_inserts(10);

        let err = alice
            .send(&CallId::from("abc"), SignalType::Answer, json!({}))
            .await
            .unwrap_err();
        match err {
            CallError::SignalDelivery { kind, .. } => assert_eq!(kind, SignalType::Answer),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.rows(SIGNALS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        let alice = relay(&store, "alice");
        let bob = relay(&store, "bob");
        let call = CallId::from("abc");

        let mut rx = bob.subscribe(&call).await.unwrap();
        assert_eq!(store.subscription_count(), 1);
        bob.unsubscribe().await;
        bob.unsubscribe().await;
        assert!(!bob.is_subscribed());
        assert_eq!(store.subscription_count(), 0);

        alice.send(&call, SignalType::Offer, json!({})).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_backlog_query_releases_subscription() {
        let store = Arc::new(MemoryStore::new());
        let bob = relay(&store, "bob");
        store.fail_next_queries(1);

        let err = bob.subscribe(&CallId::from("abc")).await.unwrap_err();
        assert!(matches!(err, CallError::Relay(_)));
        assert!(!bob.is_subscribed());
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let store = Arc::new(MemoryStore::new());
        let bob = relay(&store, "bob");
        let mut old = bob.subscribe(&CallId::from("one")).await.unwrap();
        let _new = bob.subscribe(&CallId::from("two")).await.unwrap();
        assert_eq!(store.subscription_count(), 1);
        assert!(old.recv().await.is_none());
    }
}
