//! 📡 The Loader: makes sure the index exists, then throws documents at it in tidy chunks.
//!
//! 🎬 *[the index does not exist. the loader creates it. the index already
//! existed, actually, someone else made it a millisecond ago. the loader
//! shrugs. same outcome, no drama.]* 🦆
//!
//! Every call to the cluster goes through the retry policy. Transport trouble
//! is retried. A per-document rejection is not an error at this level: it comes
//! back in [`LoadReport::errors`] so the pipeline can decide what a failed
//! document means for the cursor (spoiler: it means the cursor stays put).

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, info};

use crate::backends::{BulkItemFailure, IndexBackend, IndexCommand, IndexReply, SinkBackend};
use crate::common::IndexDocument;
use crate::retry::RetryPolicy;
use crate::transforms::elasticsearch::hit_for;
use crate::transforms::{EgressTransform, ElasticsearchBulk};

/// ✅ How `ensure_index` found things.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexStatus {
    Created,
    AlreadyExists,
}

/// 📦 The verdict on one `load` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct LoadReport {
    pub(crate) loaded: usize,
    pub(crate) errors: Vec<BulkItemFailure>,
}

#[derive(Debug)]
pub(crate) struct Loader {
    backend: SinkBackend,
    index: String,
    bulk_chunk_docs: usize,
    retry: RetryPolicy,
}

impl Loader {
    pub(crate) fn new(backend: SinkBackend, index: impl Into<String>, bulk_chunk_docs: usize, retry: RetryPolicy) -> Self {
        Self { backend, index: index.into(), bulk_chunk_docs: bulk_chunk_docs.max(1), retry }
    }

    async fn send(&self, what: &str, command: IndexCommand) -> Result<IndexReply> {
        self.retry
            .run(what, || self.backend.execute(command.clone()))
            .await
    }

    /// 🏓 Is anybody home?
    pub(crate) async fn ping(&self) -> Result<()> {
        match self.send("elasticsearch ping", IndexCommand::Ping).await? {
            IndexReply::Pong => Ok(()),
            other => bail!("💀 Pinged Elasticsearch and got {other:?} instead of a pong."),
        }
    }

    /// 🏗️ Check first, create second. "Already exists" is a success, not an error.
    pub(crate) async fn ensure_index(&self, mapping: &Value) -> Result<IndexStatus> {
        match self.send("index existence check", IndexCommand::Exists).await? {
            IndexReply::Exists(true) => {
                debug!(index = %self.index, "✅ index already there");
                return Ok(IndexStatus::AlreadyExists);
            }
            IndexReply::Exists(false) => {}
            other => bail!("💀 Asked whether the index exists, got {other:?}."),
        }
        let status = match self
            .send("index creation", IndexCommand::Create { body: mapping.clone() })
            .await?
        {
            IndexReply::Created => IndexStatus::Created,
            IndexReply::AlreadyExists => IndexStatus::AlreadyExists,
            other => bail!("💀 Asked to create the index, got {other:?}."),
        };
        info!(index = %self.index, ?status, "🏗️ index ensured");
        Ok(status)
    }

    /// 🗑️ Delete the index. A missing index counts as deleted.
    pub(crate) async fn drop_index(&self) -> Result<()> {
        match self.send("index deletion", IndexCommand::Delete).await? {
            IndexReply::Deleted => {
                info!(index = %self.index, "🗑️ index dropped");
                Ok(())
            }
            other => bail!("💀 Asked to delete the index, got {other:?}."),
        }
    }

    /// 🚀 Bulk-index `documents` keyed by film work id, `bulk_chunk_docs` at a time.
    ///
    /// Empty input sends nothing. Per-document failures are collected, not raised.
    pub(crate) async fn load(&self, documents: &[IndexDocument]) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for chunk in documents.chunks(self.bulk_chunk_docs) {
            let payload = self.render_chunk(chunk)?;
            let outcome = match self.send("bulk upload", IndexCommand::Bulk { payload }).await? {
                IndexReply::Bulk(outcome) => outcome,
                other => bail!("💀 Sent a bulk request, got {other:?} back."),
            };
            debug!(docs = chunk.len(), succeeded = outcome.succeeded, failed = outcome.failures.len(), "🚀 chunk loaded");
            report.loaded += outcome.succeeded;
            report.errors.extend(outcome.failures);
        }
        Ok(report)
    }

    fn render_chunk(&self, chunk: &[IndexDocument]) -> Result<String> {
        let mut payload = String::new();
        for document in chunk {
            let hit = hit_for(document, &self.index)?;
            payload.push_str(&ElasticsearchBulk::transform_hit(&hit)?);
            payload.push('\n');
        }
        Ok(payload)
    }
}

/// 📋 Read the index settings + mappings file. Missing or malformed is fatal at startup.
pub(crate) async fn load_mapping(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path).await.with_context(|| {
        format!(
            "💀 Couldn't read the index mapping at '{}'. Relative paths are relative to where you started the process, not where the binary lives.",
            path.display()
        )
    })?;
    serde_json::from_str(&raw)
        .with_context(|| format!("💀 The index mapping at '{}' is not valid JSON.", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryIndex;
    use crate::backends::in_mem::InjectedFailure;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    fn document(id: &str, title: &str) -> IndexDocument {
        IndexDocument {
            id: id.into(),
            imdb_rating: 7.5,
            genres: vec!["Drama".into()],
            title: title.into(),
            description: None,
            directors_names: vec![],
            actors_names: vec![],
            writers_names: vec![],
            directors: vec![],
            actors: vec![],
            writers: vec![],
        }
    }

    fn loader_over(index: &InMemoryIndex, chunk: usize) -> Loader {
        Loader::new(SinkBackend::InMemory(index.clone()), "movies", chunk, RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn the_one_where_loading_twice_leaves_one_document() -> Result<()> {
        let index = InMemoryIndex::new();
        let loader = loader_over(&index, 500);
        loader.load(&[document("fw-1", "First cut")]).await?;
        let report = loader.load(&[document("fw-1", "Director's cut")]).await?;
        assert_eq!(report, LoadReport { loaded: 1, errors: vec![] });
        assert_eq!(index.document_count().await, 1);
        let stored = index.document("fw-1").await.expect("💀 document should be there");
        assert_eq!(stored["title"], "Director's cut");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_documents_travel_in_chunks() -> Result<()> {
        let index = InMemoryIndex::new();
        let loader = loader_over(&index, 2);
        let docs: Vec<IndexDocument> = (0..5).map(|n| document(&format!("fw-{n}"), "x")).collect();
        let report = loader.load(&docs).await?;
        assert_eq!(report.loaded, 5);
        assert_eq!(index.bulk_calls().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nothing_to_load_means_no_request() -> Result<()> {
        let index = InMemoryIndex::new();
        let report = loader_over(&index, 500).load(&[]).await?;
        assert_eq!(report, LoadReport::default());
        assert!(index.commands.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_rejected_documents_are_reported_not_swallowed() -> Result<()> {
        let index = InMemoryIndex::new();
        index.inject(InjectedFailure::RejectIds(vec!["fw-bad".into()])).await;
        let report = loader_over(&index, 500).load(&[document("fw-ok", "ok"), document("fw-bad", "bad")]).await?;
        assert_eq!(report.loaded, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, "fw-bad");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_busy_cluster_is_retried_and_a_bad_request_is_not() -> Result<()> {
        let index = InMemoryIndex::new();
        let patient = RetryPolicy::new(Duration::from_millis(1), 2, Duration::from_millis(2), Some(5));
        let loader = Loader::new(SinkBackend::InMemory(index.clone()), "movies", 500, patient);

        index.inject(InjectedFailure::Unavailable { remaining: 2 }).await;
        assert_eq!(loader.load(&[document("fw-1", "x")]).await?.loaded, 1);
        assert_eq!(index.bulk_calls().await, 3);

        index.inject(InjectedFailure::Rejected).await;
        assert!(loader.load(&[document("fw-2", "y")]).await.is_err());
        assert_eq!(index.bulk_calls().await, 4, "API errors get exactly one shot");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_ensure_index_is_idempotent() -> Result<()> {
        let index = InMemoryIndex::new();
        let loader = loader_over(&index, 500);
        let mapping = json!({"mappings": {"properties": {"title": {"type": "text"}}}});
        assert_eq!(loader.ensure_index(&mapping).await?, IndexStatus::Created);
        assert_eq!(loader.ensure_index(&mapping).await?, IndexStatus::AlreadyExists);
        assert_eq!(index.contents.lock().await.mapping, Some(mapping));
        loader.drop_index().await?;
        assert_eq!(loader.ensure_index(&json!({})).await?, IndexStatus::Created);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_mapping_file_must_exist_and_be_json() -> Result<()> {
        let mut good = tempfile::NamedTempFile::new()?;
        write!(good, r#"{{"settings": {{}}, "mappings": {{}}}}"#)?;
        assert_eq!(load_mapping(good.path()).await?, json!({"settings": {}, "mappings": {}}));

        let mut bad = tempfile::NamedTempFile::new()?;
        write!(bad, "mappings: yes please")?;
        assert!(load_mapping(bad.path()).await.is_err());

        let gone = bad.path().with_extension("nope");
        assert!(load_mapping(&gone).await.is_err());
        Ok(())
    }
}
