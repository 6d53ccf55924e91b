//! Data access for the hosted backend.
//!
//! Everything the calling code needs from the backend goes through the
//! [`DataStore`] trait: row inserts, filtered queries, updates, and
//! change subscriptions. `SupabaseStore` talks to the real service
//! (PostgREST + Realtime); `MemoryStore` keeps everything in-process.

pub mod memory;
pub mod realtime;
pub mod rest;
pub mod supabase;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

/// A table row as returned by the backend.
pub type Row = serde_json::Value;

/// Column equality filter (`column = value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether `row` satisfies this filter.
    ///
    /// Non-string scalars are compared by their JSON text, so `eq("n", "3")`
    /// matches `{"n": 3}`.
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }

    /// PostgREST / Realtime filter syntax: `column=eq.value`.
    pub fn to_postgrest(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

/// Kind of row change a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert,
    Update,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle used to cancel a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live change subscription. Rows arrive on `rows` until the
/// subscription is removed or the store goes away.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub rows: mpsc::UnboundedReceiver<Row>,
}

/// Backend data access used by the signal relay and call records.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Insert one row and return it as stored (with generated columns).
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Return every row matching all `filters`, in insertion order.
    async fn query(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>>;

    /// Merge `patch` into every row matching all `filters`.
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>>;

    /// Subscribe to changes of `event` kind on `table` matching `filter`.
    async fn subscribe(&self, table: &str, event: ChangeEvent, filter: Filter)
        -> Result<Subscription>;

    /// Stop a subscription. Removing an unknown or already removed
    /// subscription is not an error.
    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()>;

    async fn subscribe_to_inserts(&self, table: &str, filter: Filter) -> Result<Subscription> {
        self.subscribe(table, ChangeEvent::Insert, filter).await
    }

    async fn subscribe_to_updates(&self, table: &str, filter: Filter) -> Result<Subscription> {
        self.subscribe(table, ChangeEvent::Update, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_strings_and_numbers() {
        let row = json!({"call_id": "abc", "n": 3, "gone": null});
        assert!(Filter::eq("call_id", "abc").matches(&row));
        assert!(!Filter::eq("call_id", "abd").matches(&row));
        assert!(Filter::eq("n", "3").matches(&row));
        assert!(!Filter::eq("gone", "null").matches(&row));
        assert!(!Filter::eq("missing", "x").matches(&row));
    }

    #[test]
    fn test_filter_postgrest_syntax() {
        assert_eq!(Filter::eq("call_id", "abc").to_postgrest(), "call_id=eq.abc");
    }
}
