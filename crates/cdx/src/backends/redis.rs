//! 🧠 The Redis backend: one key, one JSON blob, one job. Remember where we stopped.
//!
//! Connections are opened per call. The checkpoint is read once at the top of a
//! pass and written a handful of times at the bottom, so a pool would be
//! furniture nobody sits on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ::redis::AsyncCommands;
use serde::Deserialize;
use tracing::trace;

use crate::backends::StateStorage;

/// 🧠 Where the checkpoint lives.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 🔑 The single well-known key holding the whole state object.
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_state_key() -> String {
    "cdx_state".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), state_key: default_state_key() }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

#[derive(Debug)]
pub struct RedisStorage {
    client: ::redis::Client,
}

impl RedisStorage {
    /// 🚀 Parses the URL only. Redis being asleep is discovered (and retried) on first use.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url())
            .with_context(|| format!("💀 '{}' is not a Redis URL we can work with.", config.url()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StateStorage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("💀 Redis didn't pick up. The checkpoint is in there somewhere, behind a closed socket.")?;
        let value: Option<String> = conn
            .get(key)
            .await
            .with_context(|| format!("💀 GET '{key}' failed. Redis forgot how to remember."))?;
        trace!(key, found = value.is_some(), "🧠 read state");
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("💀 Redis didn't pick up, so the checkpoint stays where it was. That's safe, just slow.")?;
        let _: () = conn
            .set(key, value)
            .await
            .with_context(|| format!("💀 SET '{key}' failed. The cursor did not move."))?;
        trace!(key, "🧠 wrote state");
        Ok(())
    }
}
