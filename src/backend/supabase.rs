//! Hosted backend: PostgREST for rows, Realtime for change notifications.

use anyhow::Result;
use async_trait::async_trait;

use super::realtime::{self, RealtimeClient};
use super::rest::RestClient;
use super::{ChangeEvent, DataStore, Filter, Row, Subscription, SubscriptionId};
use crate::config::BackendSettings;

pub struct SupabaseStore {
    rest: RestClient,
    realtime: RealtimeClient,
}

impl SupabaseStore {
    /// Build a store for the configured project. Must be called inside a
    /// tokio runtime (the realtime socket task is spawned here).
    pub fn connect(settings: &BackendSettings, access_token: Option<String>) -> Result<Self> {
        let ws_url = realtime::websocket_url(&settings.url, &settings.anon_key)?;
        Ok(Self {
            rest: RestClient::new(&settings.url, &settings.anon_key, access_token.clone()),
            realtime: RealtimeClient::connect(ws_url, access_token),
        })
    }
}

#[async_trait]
impl DataStore for SupabaseStore {
    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        self.rest.insert(table, &row).await
    }

    async fn query(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        self.rest.select(table, filters).await
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        self.rest.update(table, filters, &patch).await
    }

    async fn subscribe(
        &self,
        table: &str,
        event: ChangeEvent,
        filter: Filter,
    ) -> Result<Subscription> {
        tracing::debug!("Subscribing to {} on {} where {}", event, table, filter.to_postgrest());
        self.realtime.subscribe(table, event, filter)
    }

    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.realtime.unsubscribe(id);
        Ok(())
    }
}
