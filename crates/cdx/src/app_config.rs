//! 🔧 App Configuration: the sacred env-and-TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Env vars are `CDX_` prefixed, with `__` between nesting levels:
//! `CDX_POSTGRES__HOST=db` sets `postgres.host`. A TOML file, if given, is
//! layered on top and wins on conflicts.

use std::path::Path;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::postgres::validate_identifier;
use crate::backends::{ElasticsearchConfig, PostgresConfig, RedisConfig};
use crate::retry::RetryConfig;

/// 📦 The AppConfig: one struct to rule them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🔄 How the pipeline paces itself.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 📄 LIMIT for every paged catalog query.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 📦 Documents per `_bulk` request.
    #[serde(default = "default_bulk_chunk_docs")]
    pub bulk_chunk_docs: usize,
    /// 💤 Sleep between passes.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// ⏰ The cursor a fresh install starts from. Passes at this cursor take the direct path only.
    #[serde(default = "default_epoch_start")]
    pub epoch_start: DateTime<Utc>,
    /// ⚠️ Cursor lag beyond this is logged as a warning.
    #[serde(default = "default_stale_cursor_warn_secs")]
    pub stale_cursor_warn_secs: u64,
    /// 🗑️ Drop the index and forget the cursor on startup, then rebuild from scratch.
    #[serde(default)]
    pub rebuild_index_on_start: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_page_size() -> usize {
    100
}

fn default_bulk_chunk_docs() -> usize {
    500
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_epoch_start() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn default_stale_cursor_warn_secs() -> u64 {
    3600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            bulk_chunk_docs: default_bulk_chunk_docs(),
            poll_interval_secs: default_poll_interval_secs(),
            epoch_start: default_epoch_start(),
            stale_cursor_warn_secs: default_stale_cursor_warn_secs(),
            rebuild_index_on_start: false,
            retry: RetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// 🔒 Things serde can't check: sizes that must be positive, a factor that must
    /// not collapse to zero, a URL scheme reqwest can speak, a schema name that ends up inside SQL text.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.page_size == 0 {
            bail!("💀 runtime.page_size is 0. A page of nothing, forever. Pick a positive number.");
        }
        if self.runtime.bulk_chunk_docs == 0 {
            bail!("💀 runtime.bulk_chunk_docs is 0. Bulk requests need at least one doc to be bulk.");
        }
        if self.runtime.retry.factor == 0 {
            bail!("💀 runtime.retry.factor is 0. Backoff that collapses to nothing is just a faster way to hammer a sick server.");
        }
        let protocol = self.elasticsearch.protocol.as_str();
        if !matches!(protocol, "http" | "https") {
            bail!("💀 elasticsearch.protocol is '{protocol}'. It's http or https. Anything else is a typo that no amount of retrying will fix.");
        }
        if self.elasticsearch.index.trim().is_empty() {
            bail!("💀 elasticsearch.index is empty. Documents need somewhere to live.");
        }
        validate_identifier(&self.postgres.schema).context("💀 postgres.schema failed validation")?;
        Ok(())
    }
}

/// 🚀 Load the config: env vars (`CDX_*`) first, then the TOML file on top if one was given.
///
/// 📐 No file means env vars only. No assumptions. No pizza defaults.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("CDX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (CDX_*). \
             The file exists in our hearts, but apparently not in the shape we need.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (CDX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}
