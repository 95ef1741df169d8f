//! Blocking JSON client for the remote document service.
//!
//! Endpoints, relative to `base_url`:
//!
//! - `GET /spaces`: array of space keys, as strings or `{ "key": .. }` objects
//! - `GET /spaces/{key}/changes?start_at=&max_results=[&updated_after=]`:
//!   `{ "start_at", "total"?, "documents" }`, ordered by update time; the
//!   `updated_after` filter is inclusive. Without the paging parameters the
//!   remote returns the complete listing.
//! - `GET /spaces/{key}/documents/{id}`: detail of one document, 404 when gone

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;

use crate::config::RemoteConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{ChangedPage, RawDocument, SpaceKey};
use crate::ports::RemoteSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default, alias = "startAt")]
    start_at: usize,
    #[serde(default)]
    total: Option<usize>,
    #[serde(default, alias = "results")]
    documents: Vec<RawDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSpace {
    Key(String),
    Object { key: String },
}

pub struct HttpRemoteSource {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    page_size: usize,
    fetch_details: bool,
}

impl HttpRemoteSource {
    pub fn new(config: &RemoteConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("space-indexer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            page_size: config.page_size.max(1),
            fetch_details: config.fetch_details,
        })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url).header("Accept", "application/json");
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    /// Send `request` and return the body of a successful response. A 404 is
    /// returned as `Ok(None)`.
    fn send(&self, request: RequestBuilder) -> SyncResult<Option<String>> {
        let response = request
            .send()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .text()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(SyncError::Remote {
                status: status.as_u16(),
                message: truncate(&body, MAX_ERROR_BODY),
            });
        }
        Ok(Some(body))
    }

    fn expect_found(&self, url: &str, body: Option<String>) -> SyncResult<String> {
        body.ok_or_else(|| SyncError::Remote {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("{url} not found"),
        })
    }
}

impl RemoteSource for HttpRemoteSource {
    fn list_spaces(&self) -> SyncResult<Vec<SpaceKey>> {
        let url = format!("{}/spaces", self.base_url);
        let body = self.send(self.get(&url))?;
        parse_spaces(&self.expect_found(&url, body)?)
    }

    fn fetch_page(
        &self,
        key: &SpaceKey,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangedPage> {
        let url = changes_url(&self.base_url, key, Some((offset, self.page_size)), updated_after);
        tracing::debug!(space = %key, offset, ?updated_after, "fetching page");
        let body = self.send(self.get(&url))?;
        parse_page(&self.expect_found(&url, body)?)
    }

    fn fetch_all(&self, key: &SpaceKey) -> SyncResult<ChangedPage> {
        let url = changes_url(&self.base_url, key, None, None);
        tracing::debug!(space = %key, "fetching complete listing");
        let body = self.send(self.get(&url))?;
        parse_page(&self.expect_found(&url, body)?)
    }

    fn fetch_detail(
        &self,
        key: &SpaceKey,
        id: &str,
        _document: &RawDocument,
    ) -> SyncResult<Option<RawDocument>> {
        if !self.fetch_details {
            return Ok(None);
        }
        let url = format!(
            "{}/spaces/{}/documents/{}",
            self.base_url,
            urlencoding::encode(key.as_str()),
            urlencoding::encode(id)
        );
        match self.send(self.get(&url))? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Err(SyncError::NotFound { id: id.to_string() }),
        }
    }
}

/// `paging` is `(start_at, max_results)`; `None` asks for everything.
fn changes_url(
    base_url: &str,
    key: &SpaceKey,
    paging: Option<(usize, usize)>,
    updated_after: Option<DateTime<Utc>>,
) -> String {
    let mut params = Vec::new();
    if let Some((offset, page_size)) = paging {
        params.push(format!("start_at={offset}"));
        params.push(format!("max_results={page_size}"));
    }
    if let Some(after) = updated_after {
        params.push(format!(
            "updated_after={}",
            urlencoding::encode(&after.to_rfc3339_opts(SecondsFormat::Millis, true))
        ));
    }
    let mut url = format!("{}/spaces/{}/changes", base_url, urlencoding::encode(key.as_str()));
    if !params.is_empty() {
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

fn parse_page(body: &str) -> SyncResult<ChangedPage> {
    let page: WirePage = serde_json::from_str(body)?;
    Ok(ChangedPage::new(page.documents, page.start_at, page.total))
}

fn parse_spaces(body: &str) -> SyncResult<Vec<SpaceKey>> {
    let spaces: Vec<WireSpace> = serde_json::from_str(body)?;
    Ok(spaces
        .into_iter()
        .map(|s| match s {
            WireSpace::Key(key) | WireSpace::Object { key } => SpaceKey::new(key),
        })
        .collect())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
