//! PostgREST client for table reads and writes.
//!
//! Wraps reqwest::Client with the `apikey` header and bearer auth the hosted
//! REST gateway expects.

use anyhow::{bail, Context, Result};

use super::{Filter, Row};

/// REST client bound to one project.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, anon_key: &str, access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Requests run as the signed-in user when a token is present, else as anon.
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    /// POST one row; returns the stored representation.
    pub async fn insert(&self, table: &str, row: &Row) -> Result<Row> {
        let url = self.table_url(table);
        tracing::debug!("REST POST {}", url);

        let resp = self
            .request(reqwest::Method::POST, &url)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .with_context(|| format!("REST POST {} failed", url))?;

        let rows: Vec<Row> = check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Insert response is not a JSON array")?;
        rows.into_iter()
            .next()
            .with_context(|| format!("Insert into {} returned no rows", table))
    }

    /// GET rows matching every filter, oldest first.
    pub async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        let url = self.table_url(table);
        tracing::debug!("REST GET {} ({} filters)", url, filters.len());

        let resp = self
            .request(reqwest::Method::GET, &url)
            .query(&[("select", "*"), ("order", "created_at.asc")])
            .query(&filter_params(filters))
            .send()
            .await
            .with_context(|| format!("REST GET {} failed", url))?;

        check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Select response is not a JSON array")
    }

    /// PATCH rows matching every filter; returns the updated rows.
    pub async fn update(&self, table: &str, filters: &[Filter], patch: &Row) -> Result<Vec<Row>> {
        if filters.is_empty() {
            bail!("Refusing unfiltered update of {}", table);
        }
        let url = self.table_url(table);
        tracing::debug!("REST PATCH {}", url);

        let resp = self
            .request(reqwest::Method::PATCH, &url)
            .header("Prefer", "return=representation")
            .query(&filter_params(filters))
            .json(patch)
            .send()
            .await
            .with_context(|| format!("REST PATCH {} failed", url))?;

        check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Update response is not a JSON array")
    }
}

/// Query-string pairs for PostgREST equality filters.
fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column.clone(), format!("eq.{}", f.value)))
        .collect()
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Session may have expired -- run 'callrelay login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
