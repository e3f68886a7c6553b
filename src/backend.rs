//! Thin client for the hosted relational backend's REST surface.
//!
//! Rows are addressed PostgREST-style: `GET {base}/rest/v1/{table}?col=eq.value`,
//! `POST` to insert and `PATCH` with the same filters to update. Every call
//! authenticates with the service key as both `apikey` and bearer token.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[derive(Clone)]
pub struct BackendClient {
    base: Url,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base).context("invalid backend URL")?;
        if !base_url.path().ends_with('/') {
            let p = format!("{}/", base_url.path());
            base_url.set_path(&p);
        }
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert("apikey", HeaderValue::from_str(key).context("backend key is not a valid header value")?);
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key)).context("backend key is not a valid header value")?);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { base: base_url, client })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.base.join(&format!("rest/v1/{}", table)).context("invalid table path")
    }

    /// Equality filter in the backend's query syntax.
    pub fn eq(column: &str, value: &str) -> (String, String) {
        (column.to_string(), format!("eq.{}", value))
    }

    pub async fn select<T: DeserializeOwned>(&self, table: &str, filters: &[(String, String)]) -> Result<Vec<T>> {
        let url = self.table_url(table)?;
        debug!(target: "backend", table, filters = filters.len(), "select");
        let resp = self.client
            .get(url)
            .query(&[("select", "*")])
            .query(filters)
            .send()
            .await
            .with_context(|| format!("select from {} failed", table))?;
        Self::rows(table, resp).await
    }

    pub async fn insert<B: Serialize, T: DeserializeOwned>(&self, table: &str, row: &B) -> Result<Vec<T>> {
        let url = self.table_url(table)?;
        debug!(target: "backend", table, "insert");
        let resp = self.client
            .post(url)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .with_context(|| format!("insert into {} failed", table))?;
        Self::rows(table, resp).await
    }

    pub async fn update<B: Serialize, T: DeserializeOwned>(&self, table: &str, filters: &[(String, String)], patch: &B) -> Result<Vec<T>> {
        let url = self.table_url(table)?;
        debug!(target: "backend", table, filters = filters.len(), "update");
        let resp = self.client
            .patch(url)
            .header("Prefer", "return=representation")
            .query(filters)
            .json(patch)
            .send()
            .await
            .with_context(|| format!("update of {} failed", table))?;
        Self::rows(table, resp).await
    }

    async fn rows<T: DeserializeOwned>(table: &str, resp: reqwest::Response) -> Result<Vec<T>> {
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("backend returned HTTP {} for {}", status, table));
        }
        let body = resp.bytes().await.with_context(|| format!("reading {} response", table))?;
        serde_json::from_slice::<Vec<T>>(&body).with_context(|| format!("malformed {} response", table))
    }
}
