//! HTTP record store
//!
//! Talks to a PostgREST-style endpoint (`/rest/v1/bookmarks`) of the hosted
//! backend. Row-level security on the server restricts every request to the
//! rows of the user named by the access token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::RecordStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, UserId};

const TABLE_PATH: &str = "rest/v1/bookmarks";

/// Connection settings for the hosted record store
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Public (anon) API key
    pub api_key: String,
    /// User access token; requests fall back to the API key without one
    pub access_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), TABLE_PATH)
    }
}

/// Record store backed by the hosted REST API
pub struct RestStore {
    client: Client,
    config: RestConfig,
}

impl RestStore {
    pub fn new(config: RestConfig) -> StoreResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);

        request
            .header("apikey", &self.config.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
    }

    fn returning(&self, request: RequestBuilder) -> RequestBuilder {
        self.authorize(request)
            .header("Prefer", "return=representation")
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn list_by_owner(&self, owner: &UserId) -> StoreResult<Vec<Bookmark>> {
        let owner_filter = format!("eq.{}", owner);
        let request = self.client.get(self.config.table_url()).query(&[
            ("select", "*"),
            ("user_id", owner_filter.as_str()),
            ("order", "created_at.desc"),
        ]);

        let rows: Vec<Bookmark> = read_json(self.authorize(request).send().await?).await?;
        debug!("Fetched {} bookmarks for {}", rows.len(), owner);
        Ok(rows)
    }

    async fn insert(&self, record: NewBookmark) -> StoreResult<Bookmark> {
        let request = self.client.post(self.config.table_url()).json(&record);
        let rows: Vec<Bookmark> = read_json(self.returning(request).send().await?).await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_string()))
    }

    async fn update(
        &self,
        owner: &UserId,
        id: &BookmarkId,
        patch: BookmarkPatch,
    ) -> StoreResult<Bookmark> {
        let (id_filter, owner_filter) = (format!("eq.{}", id), format!("eq.{}", owner));
        let request = self
            .client
            .patch(self.config.table_url())
            .query(&[("id", id_filter.as_str()), ("user_id", owner_filter.as_str())])
            .json(&patch);

        let rows: Vec<Bookmark> = read_json(self.returning(request).send().await?).await?;

        // RLS hides rows of other users, so an empty result covers both cases
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete_by_id(&self, owner: &UserId, id: &BookmarkId) -> StoreResult<()> {
        let (id_filter, owner_filter) = (format!("eq.{}", id), format!("eq.{}", owner));
        let request = self
            .client
            .delete(self.config.table_url())
            .query(&[("id", id_filter.as_str()), ("user_id", owner_filter.as_str())]);

        let response = self.authorize(request).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Error body returned by PostgREST
#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

async fn check_status(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = parse_error_message(&body);
    warn!("Record store request failed with {}: {}", status, message);
    Err(StoreError::from_status(status.as_u16(), message))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> StoreResult<T> {
    let response = check_status(response).await?;
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

fn parse_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => err.message,
        Err(_) if body.is_empty() => "no response body".to_string(),
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url() {
        let config = RestConfig::new("https://abc.supabase.co/", "anon");
        assert_eq!(config.table_url(), "https://abc.supabase.co/rest/v1/bookmarks");
    }

    #[test]
    fn test_parse_error_message() {
        assert_eq!(
            parse_error_message(r#"{"code":"42501","message":"permission denied"}"#),
            "permission denied"
        );
        assert_eq!(parse_error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(parse_error_message(""), "no response body");
    }

    #[test]
    fn test_rows_decode_from_postgrest() {
        let body = r#"[{
            "id": "0b6c8d1e-7f3a-4b2c-9d5e-1a2b3c4d5e6f",
            "user_id": "u1",
            "url": "https://example.com",
            "title": "Example",
            "created_at": "2024-05-01T10:20:30.123456+00:00"
        }]"#;

        let rows: Vec<Bookmark> = serde_json::from_str(body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner_id, UserId::from("u1"));
        assert_eq!(rows[0].created_at.to_rfc3339(), "2024-05-01T10:20:30.123456+00:00");
    }

    #[test]
    fn test_access_token_builder() {
        let config = RestConfig::new("https://abc.supabase.co", "anon").with_access_token("jwt");
        assert_eq!(config.access_token.as_deref(), Some("jwt"));
        assert!(RestStore::new(config).is_ok());
    }
}
