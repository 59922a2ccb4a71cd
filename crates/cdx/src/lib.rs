//! 🎬 cdx, a.k.a. Cinedex: keeps a film search index in step with the catalog.
//!
//! Postgres holds the truth, Elasticsearch holds the searchable copy, Redis
//! holds the bookmark that says how far we got. Everything else is plumbing. 🦆

pub mod app_config;
pub mod backends;
pub mod common;
mod extractor;
mod loader;
mod merger;
mod pipeline;
pub mod progress;
pub mod retry;
mod state;
mod supervisors;
mod transforms;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::app_config::AppConfig;
use crate::backends::{
    ElasticsearchIndex, PostgresSource, RedisStorage, SinkBackend, SourceBackend, StorageBackend,
};
use crate::extractor::Extractor;
use crate::loader::{Loader, load_mapping};
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::state::State;
use crate::supervisors::{Supervisor, shutdown_signal};

pub use crate::pipeline::PipelineStage;

/// 🚀 Wire the real backends together and poll until Ctrl-C or SIGTERM.
pub async fn run(app_config: AppConfig) -> Result<()> {
    let retry = RetryPolicy::from(&app_config.runtime.retry);
    let mapping = load_mapping(Path::new(&app_config.elasticsearch.mapping_path)).await?;

    let source = PostgresSource::new(&app_config.postgres).context("💀 could not set up the Postgres source")?;
    let storage = RedisStorage::new(&app_config.redis).context("💀 could not set up the Redis state storage")?;
    let index = ElasticsearchIndex::new(app_config.elasticsearch.clone())
        .context("💀 could not set up the Elasticsearch client")?;

    let pipeline = Pipeline::new(
        Extractor::new(SourceBackend::Postgres(source), app_config.runtime.page_size, retry.clone()),
        Loader::new(
            SinkBackend::Elasticsearch(index),
            app_config.elasticsearch.index.clone(),
            app_config.runtime.bulk_chunk_docs,
            retry.clone(),
        ),
        State::new(StorageBackend::Redis(storage), app_config.redis.state_key.clone(), retry),
        mapping,
        app_config.runtime.epoch_start,
    );

    let mut supervisor = Supervisor::new(pipeline, &app_config.runtime);
    supervisor.preflight().await.context("💀 Elasticsearch did not answer the preflight ping")?;
    info!(
        index = %app_config.elasticsearch.index,
        poll_interval_secs = app_config.runtime.poll_interval_secs,
        "🚀 cinedex is up, polling the catalog"
    );
    supervisor.run_until(shutdown_signal()).await
}
