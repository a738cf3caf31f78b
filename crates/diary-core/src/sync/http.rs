//! HTTP implementation of [`RemoteStore`] against the diary API.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use super::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::config::RemoteConfig;
use crate::models::{Destination, Entry, EntryId, GroupId};
use crate::util::compact_text;
use crate::{Error, Result};

/// Diary API client
///
/// Entries are addressed by their client-generated id, so `POST /entries`
/// doubles as an upsert and replays are harmless.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Config(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(RemoteConfig::from_env()?)
    }

    pub fn base_url(&self) -> &str {
        &self.config.api_base_url
    }

    fn entries_url(&self) -> String {
        format!("{}/entries", self.config.api_base_url)
    }

    fn entry_url(&self, id: &EntryId) -> String {
        format!("{}/entries/{}", self.config.api_base_url, id)
    }

    fn group_entry_url(&self, group: &GroupId, id: &EntryId) -> String {
        format!(
            "{}/groups/{}/entries/{}",
            self.config.api_base_url,
            urlencoding::encode(group.as_str()),
            id
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> RemoteResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| RemoteError::Unavailable(format!("{what} failed: {error}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &format!("{what}: {}", parse_api_error(status, &body))))
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response, what: &str) -> RemoteResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|error| RemoteError::Unavailable(format!("{what}: unreadable response: {error}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create_entry(&self, entry: &Entry) -> RemoteResult<Entry> {
        let response = self
            .send(self.client.post(self.entries_url()).json(entry), "Create entry")
            .await?;
        Self::decode(response, "Create entry").await
    }

    async fn update_entry(&self, id: &EntryId, entry: &Entry) -> RemoteResult<Entry> {
        let response = self
            .send(self.client.put(self.entry_url(id)).json(entry), "Update entry")
            .await?;
        Self::decode(response, "Update entry").await
    }

    async fn delete_entry(&self, id: &EntryId) -> RemoteResult<()> {
        self.send(self.client.delete(self.entry_url(id)), "Delete entry")
            .await
            .map(drop)
    }

    async fn fetch_all(&self) -> RemoteResult<Vec<Entry>> {
        let response = self
            .send(self.client.get(self.entries_url()), "List entries")
            .await?;
        let payload: EntriesResponse = Self::decode(response, "List entries").await?;
        Ok(payload.into_entries())
    }

    async fn insert_into(&self, destination: &Destination, entry: &Entry) -> RemoteResult<()> {
        match destination {
            Destination::Private => self.create_entry(entry).await.map(drop),
            Destination::Group(group) => self
                .send(
                    self.client.put(self.group_entry_url(group, &entry.id)).json(entry),
                    "Share entry",
                )
                .await
                .map(drop),
        }
    }

    async fn remove_from(&self, destination: &Destination, id: &EntryId) -> RemoteResult<()> {
        match destination {
            Destination::Private => self.delete_entry(id).await,
            Destination::Group(group) => self
                .send(
                    self.client.delete(self.group_entry_url(group, id)),
                    "Unshare entry",
                )
                .await
                .map(drop),
        }
    }
}

/// `GET /entries` returns either a bare array or `{ "entries": [...] }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntriesResponse {
    List(Vec<Entry>),
    Wrapped { entries: Vec<Entry> },
}

impl EntriesResponse {
    fn into_entries(self) -> Vec<Entry> {
        match self {
            Self::List(entries) | Self::Wrapped { entries } => entries,
        }
    }
}

/// Map a non-success status onto a failure class.
///
/// Auth, timeout, throttling and server errors are worth retrying; other
/// client errors mean the request itself is wrong.
pub fn classify_status(status: StatusCode, message: &str) -> RemoteError {
    let message = message.to_string();
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable(message),
        status if status.is_server_error() => RemoteError::Unavailable(message),
        status if status.is_client_error() => RemoteError::Rejected(message),
        _ => RemoteError::Unavailable(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
