//! Call records in the `calls` table.
//!
//! A record rings the callee before any signaling happens: the caller
//! inserts a `ringing` row, the callee's client sees the insert and flips
//! the status, and both sides use the record id as the call id.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use super::{CallError, CallId, MediaKind};
use crate::backend::{DataStore, Filter, Row, SubscriptionId};

pub const CALLS_TABLE: &str = "calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
    Missed,
}

impl CallStatus {
    /// Whether the record can no longer change.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        };
        f.write_str(s)
    }
}

/// One row of `calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl CallRecord {
    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_call_type(&self.call_type).unwrap_or(MediaKind::Audio)
    }

    fn from_row(row: &Row) -> Option<Self> {
        match Self::deserialize(row) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("Skipping malformed call record: {}", e);
                None
            }
        }
    }
}

fn store_error(e: anyhow::Error) -> CallError {
    CallError::Relay(format!("calls table: {:#}", e))
}

/// A stream of call records from one store subscription.
pub struct RecordWatch {
    store: Arc<dyn DataStore>,
    id: SubscriptionId,
    rows: mpsc::UnboundedReceiver<Row>,
}

impl RecordWatch {
    /// Next well-formed record, or `None` once the subscription ends.
    pub async fn next(&mut self) -> Option<CallRecord> {
        while let Some(row) = self.rows.recv().await {
            if let Some(record) = CallRecord::from_row(&row) {
                return Some(record);
            }
        }
        None
    }

    pub async fn close(self) {
        if let Err(e) = self.store.remove_subscription(self.id).await {
            tracing::warn!("Failed to remove call record subscription: {:#}", e);
        }
    }
}

/// Reads and writes call records for the local user.
#[derive(Clone)]
pub struct CallRecords {
    store: Arc<dyn DataStore>,
    self_id: String,
}

impl CallRecords {
    pub fn new(store: Arc<dyn DataStore>, self_id: impl Into<String>) -> Self {
        Self {
            store,
            self_id: self_id.into(),
        }
    }

    /// Ring `callee_id`.
    pub async fn place(&self, callee_id: &str, kind: MediaKind) -> Result<CallRecord, CallError> {
        let record = CallRecord {
            id: CallId::new(),
            caller_id: self.self_id.clone(),
            callee_id: callee_id.to_string(),
            call_type: kind.as_call_type().to_string(),
            status: CallStatus::Ringing,
            created_at: None,
        };
        let row = serde_json::to_value(&record)
            .map_err(|e| CallError::Relay(format!("cannot encode call record: {}", e)))?;
        let stored = self
            .store
            .insert(CALLS_TABLE, row)
            .await
            .map_err(store_error)?;
        tracing::info!("Ringing {} (call {})", callee_id, record.id);
        Ok(CallRecord::from_row(&stored).unwrap_or(record))
    }

    pub async fn set_status(&self, call_id: &CallId, status: CallStatus) -> Result<(), CallError> {
        let updated = self
            .store
            .update(
                CALLS_TABLE,
                &[Filter::eq("id", call_id.as_str())],
                json!({ "status": status }),
            )
            .await
            .map_err(store_error)?;
        if updated.is_empty() {
            return Err(CallError::Unavailable(format!("call {} not found", call_id)));
        }
        tracing::info!("Call {} marked {}", call_id, status);
        Ok(())
    }

    pub async fn fetch(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        let rows = self
            .store
            .query(CALLS_TABLE, &[Filter::eq("id", call_id.as_str())])
            .await
            .map_err(store_error)?;
        Ok(rows.first().and_then(CallRecord::from_row))
    }

    /// Calls placed to the local user from now on.
    pub async fn watch_incoming(&self) -> Result<RecordWatch, CallError> {
        let sub = self
            .store
            .subscribe_to_inserts(CALLS_TABLE, Filter::eq("callee_id", self.self_id.as_str()))
            .await
            .map_err(store_error)?;
        Ok(RecordWatch {
            store: self.store.clone(),
            id: sub.id,
            rows: sub.rows,
        })
    }

    /// Status changes of one call.
    pub async fn watch_status(&self, call_id: &CallId) -> Result<RecordWatch, CallError> {
        let sub = self
            .store
            .subscribe_to_updates(CALLS_TABLE, Filter::eq("id", call_id.as_str()))
            .await
            .map_err(store_error)?;
        Ok(RecordWatch {
            store: self.store.clone(),
            id: sub.id,
            rows: sub.rows,
        })
    }

    /// Wait until the callee leaves `ringing`. After `timeout` the call is
    /// marked missed.
    pub async fn wait_for_answer(
        &self,
        call_id: &CallId,
        timeout: Duration,
    ) -> Result<CallStatus, CallError> {
        let mut watch = self.watch_status(call_id).await?;

        // The callee may have answered before the subscription opened.
        let current = self.fetch(call_id).await?.map(|r| r.status);
        let status = match current {
            Some(s) if s != CallStatus::Ringing => Some(s),
            _ => {
                let wait = async {
                    while let Some(record) = watch.next().await {
                        if record.status != CallStatus::Ringing {
                            return Some(record.status);
                        }
                    }
                    None
                };
                match tokio::time::timeout(timeout, wait).await {
                    Ok(s) => s,
                    Err(_) => {
                        tracing::info!("No answer for call {} after {:?}", call_id, timeout);
                        self.set_status(call_id, CallStatus::Missed).await?;
                        Some(CallStatus::Missed)
                    }
                }
            }
        };
        watch.close().await;
        status.ok_or_else(|| CallError::Relay("call record subscription ended".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;

    fn records(store: &Arc<MemoryStore>, user: &str) -> CallRecords {
        CallRecords::new(store.clone(), user)
    }

    #[tokio::test]
    async fn test_place_rings_callee_only() {
        let store = Arc::new(MemoryStore::new());
        let alice = records(&store, "alice");
        let bob = records(&store, "bob");
        let carol = records(&store, "carol");
        let mut bob_incoming = bob.watch_incoming().await.unwrap();
        let mut carol_incoming = carol.watch_incoming().await.unwrap();

        let placed = alice.place("bob", MediaKind::AudioVideo).await.unwrap();
        assert_eq!(placed.status, CallStatus::Ringing);
        assert!(placed.created_at.is_some());

        let seen = bob_incoming.next().await.unwrap();
        assert_eq!(seen.id, placed.id);
        assert_eq!(seen.caller_id, "alice");
        assert_eq!(seen.media_kind(), MediaKind::AudioVideo);
        assert!(carol_incoming.rows.try_recv().is_err());

        bob_incoming.close().await;
        carol_incoming.close().await;
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_answer_sees_acceptance() {
        let store = Arc::new(MemoryStore::new());
        let alice = records(&store, "alice");
        let bob = records(&store, "bob");
        let placed = alice.place("bob", MediaKind::Audio).await.unwrap();

        let id = placed.id.clone();
        let answer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            bob.set_status(&id, CallStatus::Accepted).await.unwrap();
        });
        let status = alice
            .wait_for_answer(&placed.id, Duration::from_secs(30))
            .await
            .unwrap();
        answer.await.unwrap();
        assert_eq!(status, CallStatus::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_is_missed() {
        let store = Arc::new(MemoryStore::new());
        let alice = records(&store, "alice");
        let placed = alice.place("bob", MediaKind::Audio).await.unwrap();

        let status = alice
            .wait_for_answer(&placed.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(status, CallStatus::Missed);
        let stored = alice.fetch(&placed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Missed);
        assert!(stored.status.is_final());
    }

    #[tokio::test]
    async fn test_unknown_call_status_update_fails() {
        let store = Arc::new(MemoryStore::new());
        let alice = records(&store, "alice");
        let err = alice
            .set_status(&CallId::from("nope"), CallStatus::Ended)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Unavailable(_)));
    }
}
