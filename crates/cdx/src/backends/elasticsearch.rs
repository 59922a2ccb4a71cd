//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! *Previously, on Cinedex...*
//!
//! 🎬 COLD OPEN: INT. SEARCH CLUSTER, 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. A user searches for a
//! film whose director was renamed an hour ago. The index still has the old
//! name. Somewhere, a cursor has not moved in a while.
//!
//! 🚀 This module sends film documents into the elastic void. It creates the
//! index, deletes the index, ships `_bulk` payloads, and reads the verdict for
//! every single document, because a 200 from `_bulk` only means the envelope
//! arrived. The letters inside may still have been rejected.
//!
//! ⚠️ Errors come in two flavours, and the difference matters:
//! - [`IndexError::Transport`]: the cluster is unreachable, overloaded (429) or
//!   having a 5xx moment. Retry, it'll pass.
//! - [`IndexError::Api`]: the cluster heard us and said no. Retrying an identical
//!   bad request is the definition of insanity, so we don't.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::backends::{BulkItemFailure, BulkOutcome, IndexBackend, IndexCommand, IndexReply};

/// 📡 Where the index lives and how to get in.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 📦 The one index every film document goes to.
    #[serde(default = "default_index")]
    pub index: String,
    /// 📋 JSON file holding the index settings + mappings, read once at startup.
    #[serde(default = "default_mapping_path")]
    pub mapping_path: String,
    /// 🔒 Username for basic auth. Optional, like flossing.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth. Wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9200
}

fn default_index() -> String {
    "movies".to_string()
}

fn default_mapping_path() -> String {
    "schemas/movies.json".to_string()
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            index: default_index(),
            mapping_path: default_mapping_path(),
            username: None,
            password: None,
            api_key: None,
        }
    }
}

impl ElasticsearchConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// 💀 Why the cluster and us are not currently getting along.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Couldn't reach it, or it's too busy to care right now.
    #[error("elasticsearch unreachable or overloaded: {0}")]
    Transport(String),
    /// It heard us loud and clear, and rejected the request.
    #[error("elasticsearch rejected the request with {status}: {body}")]
    Api { status: u16, body: String },
    /// The request never left the building: bad URL, bad scheme, bad body. Config, not weather.
    #[error("elasticsearch request could not be sent as written: {0}")]
    Invalid(String),
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Transport(_))
    }

    /// 🚦 429 and 5xx mean "later". Everything else non-2xx means "never, as written".
    fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            IndexError::Transport(format!("{status}: {body}"))
        } else {
            IndexError::Api { status: status.as_u16(), body }
        }
    }
}

/// 🚦 Only a failed connection, a timeout or a dropped request deserve another try.
fn classify_send_error(err: reqwest::Error) -> IndexError {
    if !err.is_builder() && (err.is_connect() || err.is_timeout() || err.is_request()) {
        IndexError::Transport(err.to_string())
    } else {
        IndexError::Invalid(err.to_string())
    }
}

/// 📡 The HTTP client for one Elasticsearch index.
///
/// The `reqwest::Client` is built once and reused for every call, because
/// building a new client per request is like buying a new car every time you
/// need groceries.
#[derive(Debug)]
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchIndex {
    /// 🚀 10s to connect, 30s to answer. We will wait, but not forever.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL. Either way: tragic.")?;
        Ok(Self { client, config })
    }

    fn base_url(&self) -> String {
        self.config.url().trim_end_matches('/').to_string()
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base_url(), self.config.index)
    }

    /// 🔒 API key beats basic auth in this club.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 📡 Send it. "The network said no" becomes a retryable [`IndexError::Transport`];
    /// a request that could never be sent becomes [`IndexError::Invalid`].
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(classify_send_error)
            .with_context(|| format!("💀 {what}: the request never made it to Elasticsearch. Check connectivity, check the cluster, check your horoscope."))
    }

    async fn ping(&self) -> Result<IndexReply> {
        let response = self.send(self.client.get(self.base_url()), "ping").await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::from_status(status, body)).context("💀 The cluster answered the ping, but not nicely.");
        }
        Ok(IndexReply::Pong)
    }

    async fn exists(&self) -> Result<IndexReply> {
        let response = self.send(self.client.head(self.index_url()), "index existence check").await?;
        match response.status() {
            status if status.is_success() => Ok(IndexReply::Exists(true)),
            StatusCode::NOT_FOUND => Ok(IndexReply::Exists(false)),
            status => Err(IndexError::from_status(status, String::new()))
                .with_context(|| format!("💀 Asked whether '{}' exists. Got a riddle instead.", self.config.index)),
        }
    }

    async fn create(&self, body: &Value) -> Result<IndexReply> {
        let request = self
            .client
            .put(self.index_url())
            .header("Content-Type", "application/json")
            .body(body.to_string());
        let response = self.send(request, "index creation").await?;
        let status = response.status();
        if status.is_success() {
            debug!(index = %self.config.index, "✅ index created, welcome mat is out");
            return Ok(IndexReply::Created);
        }
        let body = response.text().await.unwrap_or_default();
        // -- 🏁 someone created it between our HEAD and our PUT. same outcome, no drama.
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(IndexReply::AlreadyExists);
        }
        Err(IndexError::from_status(status, body))
            .with_context(|| format!("💀 Elasticsearch refused to create '{}'. The mapping file is the prime suspect.", self.config.index))
    }

    async fn delete(&self) -> Result<IndexReply> {
        let response = self.send(self.client.delete(self.index_url()), "index deletion").await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(IndexReply::Deleted);
        }
        let body = response.text().await.unwrap_or_default();
        Err(IndexError::from_status(status, body))
            .with_context(|| format!("💀 Couldn't delete '{}'. It's clinging to life.", self.config.index))
    }

    async fn bulk(&self, payload: String) -> Result<IndexReply> {
        let bulk_url = format!("{}/_bulk", self.base_url());
        let request = self
            .client
            .post(&bulk_url)
            // ⚠️ application/x-ndjson, not application/json. The bulk API is very particular.
            .header("Content-Type", "application/x-ndjson")
            .body(payload);
        let response = self.send(request, "bulk upload").await?;
        let status = response.status();
        let body = response.text().await.map_err(|err| IndexError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(IndexError::from_status(status, body))
                .context("💀 The bulk request arrived, and Elasticsearch sent it back unopened.");
        }
        let outcome = parse_bulk_response(&body)?;
        trace!(succeeded = outcome.succeeded, failed = outcome.failures.len(), "🚀 bulk request landed");
        Ok(IndexReply::Bulk(outcome))
    }
}

#[async_trait]
impl IndexBackend for ElasticsearchIndex {
    async fn execute(&self, command: IndexCommand) -> Result<IndexReply> {
        match command {
            IndexCommand::Ping => self.ping().await,
            IndexCommand::Exists => self.exists().await,
            IndexCommand::Create { body } => self.create(&body).await,
            IndexCommand::Delete => self.delete().await,
            IndexCommand::Bulk { payload } => self.bulk(payload).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<serde_json::Map<String, Value>>,
}

/// 🔍 Read every item's verdict. `"errors": false` at the top is a summary, not a promise.
pub(crate) fn parse_bulk_response(body: &str) -> Result<BulkOutcome> {
    let response: BulkResponse = serde_json::from_str(body)
        .context("💀 The _bulk response wasn't the JSON we were promised. The cluster is speaking in tongues.")?;
    let mut outcome = BulkOutcome::default();
    for item in response.items {
        // -- 📋 each item is {"<action>": {...}}; we only send `index`, but read whatever came back
        let Some(result) = item.values().next() else { continue };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
        if (200..300).contains(&status) {
            outcome.succeeded += 1;
        } else {
            let id = result.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
            let reason = result
                .get("error")
                .map(|error| {
                    error
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string())
                })
                .unwrap_or_else(|| format!("status {status}"));
            outcome.failures.push(BulkItemFailure { id, status, reason });
        }
    }
    Ok(outcome)
}
