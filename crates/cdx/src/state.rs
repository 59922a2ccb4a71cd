//! 🧠 State: the pipeline's memory, one JSON object under one key.
//!
//! ```json
//! { "film_works_updated": "2026-10-18T09:15:00Z", "index_created": true }
//! ```
//!
//! Updates are read-modify-write of the whole object: fetch it, change one
//! key, write it all back. There is exactly one writer (the pipeline, one pass
//! at a time), so there's no compare-and-swap here. If you run two copies of
//! this service against the same key, they will take turns being wrong. 🦆

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backends::{StateStorage, StorageBackend};
use crate::common::ChangeCursor;
use crate::retry::RetryPolicy;

/// 🔑 Where the cursor lives inside the state object.
pub(crate) const CURSOR_KEY: &str = "film_works_updated";
/// 🔑 Whether a previous run already made sure the index exists.
pub(crate) const INDEX_CREATED_KEY: &str = "index_created";

#[derive(Debug)]
pub(crate) struct State {
    storage: StorageBackend,
    key: String,
    retry: RetryPolicy,
}

impl State {
    pub(crate) fn new(storage: StorageBackend, key: impl Into<String>, retry: RetryPolicy) -> Self {
        Self { storage, key: key.into(), retry }
    }

    /// 📖 The whole state object. Absent key means a fresh start: `{}`.
    async fn load(&self) -> Result<Map<String, Value>> {
        let raw = self
            .retry
            .run("state read", || self.storage.get(&self.key))
            .await?;
        let Some(raw) = raw else {
            return Ok(Map::new());
        };
        serde_json::from_str(&raw).with_context(|| {
            format!("💀 The state under '{}' is not a JSON object. Fix it by hand or reset it; guessing would risk skipping changes.", self.key)
        })
    }

    async fn store(&self, state: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(state).context("💀 state object refused to serialize")?;
        self.retry
            .run("state write", || self.storage.set(&self.key, raw.clone()))
            .await
    }

    pub(crate) async fn get_state(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.load().await?.remove(name))
    }

    /// ✍️ Set one key, keep the rest.
    pub(crate) async fn set_state(&self, name: &str, value: Value) -> Result<()> {
        let mut state = self.load().await?;
        state.insert(name.to_string(), value);
        self.store(&state).await?;
        debug!(key = %self.key, field = name, "🧠 state updated");
        Ok(())
    }

    /// ⏰ The last committed cursor, or `None` on the very first run.
    pub(crate) async fn cursor(&self) -> Result<Option<ChangeCursor>> {
        let Some(value) = self.get_state(CURSOR_KEY).await? else {
            return Ok(None);
        };
        let raw = value
            .as_str()
            .with_context(|| format!("💀 '{CURSOR_KEY}' in state is {value}, expected an RFC 3339 string"))?;
        let parsed = DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("💀 '{CURSOR_KEY}' in state is '{raw}', which is not an RFC 3339 timestamp"))?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    pub(crate) async fn set_cursor(&self, cursor: ChangeCursor) -> Result<()> {
        self.set_state(CURSOR_KEY, Value::String(cursor.to_rfc3339())).await
    }

    pub(crate) async fn index_created(&self) -> Result<bool> {
        Ok(self
            .get_state(INDEX_CREATED_KEY)
            .await?
            .and_then(|value| value.as_bool())
            .unwrap_or(false))
    }

    pub(crate) async fn mark_index_created(&self, created: bool) -> Result<()> {
        self.set_state(INDEX_CREATED_KEY, Value::Bool(created)).await
    }

    /// 🗑️ Forget the cursor and the index flag. The next pass starts from the epoch.
    pub(crate) async fn reset(&self) -> Result<()> {
        let mut state = self.load().await?;
        state.remove(CURSOR_KEY);
        state.remove(INDEX_CREATED_KEY);
        self.store(&state).await
    }
}
