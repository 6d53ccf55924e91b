//! In-process data store.
//!
//! Used by the tests and by the `loopback` command. Generates `id` and
//! `created_at` the way the hosted tables do, and fans inserts/updates out to
//! matching subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChangeEvent, DataStore, Filter, Row, Subscription, SubscriptionId};

struct Subscriber {
    table: String,
    event: ChangeEvent,
    filter: Filter,
    tx: mpsc::UnboundedSender<Row>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    failing_inserts: u32,
    failing_queries: u32,
}

impl Inner {
    fn notify(&mut self, table: &str, event: ChangeEvent, row: &Row) {
        // Drop subscribers whose receiver is gone.
        self.subscribers.retain(|_, sub| {
            if sub.table != table || sub.event != event || !sub.filter.matches(row) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(row.clone()).is_ok()
        });
    }
}

/// Data store that keeps all tables in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail, to exercise retry paths.
    pub fn fail_next_inserts(&self, n: u32) {
        self.lock().failing_inserts = n;
    }

    /// Make the next `n` queries fail.
    pub fn fail_next_queries(&self, n: u32) {
        self.lock().failing_queries = n;
    }

    /// Snapshot of every row in `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Number of live subscriptions across all tables.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert(&self, table: &str, mut row: Row) -> Result<Row> {
        let mut inner = self.lock();
        if inner.failing_inserts > 0 {
            inner.failing_inserts -= 1;
            bail!("insert into {} rejected (injected failure)", table);
        }

        let Some(obj) = row.as_object_mut() else {
            bail!("insert into {}: row must be a JSON object", table);
        };
        obj.entry("id")
            .or_insert_with(|| uuid::Uuid::new_v4().to_string().into());
        obj.entry("created_at")
            .or_insert_with(|| chrono::Utc::now().to_rfc3339().into());

        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        inner.notify(table, ChangeEvent::Insert, &row);

        tracing::debug!("memory insert into {}: {}", table, row);
        Ok(row)
    }

    async fn query(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        if inner.failing_queries > 0 {
            inner.failing_queries -= 1;
            bail!("simulated query failure on {}", table);
        }
        let rows = inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        let Some(patch) = patch.as_object() else {
            bail!("update of {}: patch must be a JSON object", table);
        };

        let mut inner = self.lock();
        let mut updated = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows.iter_mut() {
                if !filters.iter().all(|f| f.matches(row)) {
                    continue;
                }
                if let Some(obj) = row.as_object_mut() {
                    for (k, v) in patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            inner.notify(table, ChangeEvent::Update, row);
        }
        Ok(updated)
    }

    async fn subscribe(
        &self,
        table: &str,
        event: ChangeEvent,
        filter: Filter,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.subscribers.insert(
            id,
            Subscriber {
                table: table.to_string(),
                event,
                filter,
                tx,
            },
        );
        Ok(Subscription {
            id: SubscriptionId(id),
            rows: rx,
        })
    }

    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.lock().subscribers.remove(&id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id_and_timestamp() {
        let store = MemoryStore::new();
        let row = store
            .insert("call_signals", json!({"call_id": "abc"}))
            .await
            .unwrap();
        assert!(row["id"].as_str().is_some());
        assert!(row["created_at"].as_str().is_some());
        assert_eq!(store.rows("call_signals").len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_only_see_matching_inserts() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe_to_inserts("call_signals", Filter::eq("call_id", "abc"))
            .await
            .unwrap();

        store
            .insert("call_signals", json!({"call_id": "other"}))
            .await
            .unwrap();
        store
            .insert("calls", json!({"call_id": "abc"}))
            .await
            .unwrap();
        store
            .insert("call_signals", json!({"call_id": "abc", "n": 1}))
            .await
            .unwrap();

        let row = sub.rows.recv().await.unwrap();
        assert_eq!(row["n"], 1);
        assert!(sub.rows.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_subscription_gets_nothing() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe_to_inserts("t", Filter::eq("k", "v"))
            .await
            .unwrap();
        store.remove_subscription(sub.id).await.unwrap();
        store.remove_subscription(sub.id).await.unwrap();

        store.insert("t", json!({"k": "v"})).await.unwrap();
        assert!(sub.rows.recv().await.is_none());
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_update_merges_and_notifies() {
        let store = MemoryStore::new();
        let row = store
            .insert("calls", json!({"status": "ringing"}))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        let mut sub = store
            .subscribe_to_updates("calls", Filter::eq("id", id.clone()))
            .await
            .unwrap();

        let updated = store
            .update("calls", &[Filter::eq("id", id)], json!({"status": "accepted"}))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(sub.rows.recv().await.unwrap()["status"], "accepted");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);
        assert!(store.insert("t", json!({})).await.is_err());
        assert!(store.insert("t", json!({})).await.is_ok());

        store.fail_next_queries(1);
        assert!(store.query("t", &[]).await.is_err());
        assert_eq!(store.query("t", &[]).await.unwrap().len(), 1);
    }
}
