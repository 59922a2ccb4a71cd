//! # Previously, on Cinedex...
//!
//! 🎬 The catalog was huge. The cluster was far away. Redis was on a different
//! continent, emotionally. Someone had to fake all three so the tests could
//! run on a laptop in airplane mode. Someone had to be brave.
//!
//! That someone was this module.
//!
//! `in_mem` provides the test doubles behind the three backend traits:
//! - [`InMemorySource`]: a catalog of change stamps, junction links and joined
//!   rows that answers paged queries the way Postgres would, and writes down
//!   every question it was asked (great for "did the first run stay on the
//!   direct path?" assertions, great for trust issues).
//! - [`InMemoryStorage`]: a `HashMap` cosplaying as Redis.
//! - [`InMemoryIndex`]: a `BTreeMap` of documents that parses real NDJSON bulk
//!   payloads, so the bytes the loader renders are the bytes under test.
//!
//! Everything sits behind `Arc<tokio::sync::Mutex<...>>` so a test can keep a
//! clone, hand the original to the pipeline, and peek inside afterwards.
//!
//! ⚠️ This is NOT for production. If you deploy this, please also deploy a therapist. 🦆

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backends::{
    BulkItemFailure, BulkOutcome, IdQuery, IndexBackend, IndexCommand, IndexError, IndexReply,
    RelationalSource, RowQuery, StateStorage,
};
use crate::common::{ChangeCursor, EntityKind, JoinedFilmWorkRow};

// ============================================================
// 🐘 InMemorySource
// ============================================================

/// 📜 What the source was asked, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordedQuery {
    Ids { query: IdQuery, offset: i64 },
    Rows { query: RowQuery, offset: i64 },
}

#[derive(Debug, Default)]
struct Catalog {
    /// (kind, id, modified): one stamp per entity row.
    stamps: Vec<(EntityKind, Uuid, ChangeCursor)>,
    /// (kind, entity id, film work id): the junction tables, flattened.
    links: Vec<(EntityKind, Uuid, Uuid)>,
    /// What the big LEFT JOIN would return, in insertion order per film work.
    rows: Vec<JoinedFilmWorkRow>,
}

impl Catalog {
    fn modified_of(&self, kind: EntityKind, id: Uuid) -> ChangeCursor {
        self.stamps
            .iter()
            .find(|(k, i, _)| *k == kind && *i == id)
            .map(|(_, _, modified)| *modified)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// 🐘 A Postgres that lives in RAM and never needs a VACUUM.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemorySource {
    catalog: Arc<Mutex<Catalog>>,
    /// 🔍 Every query, for assertions.
    pub(crate) queries: Arc<Mutex<Vec<RecordedQuery>>>,
    /// 🔌 The next N calls fail with "connection refused".
    outages: Arc<AtomicU32>,
}

impl InMemorySource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🕰️ Record that an entity row of `kind` was last modified at `modified`.
    pub(crate) async fn stamp(&self, kind: EntityKind, id: Uuid, modified: ChangeCursor) {
        let mut catalog = self.catalog.lock().await;
        catalog.stamps.retain(|(k, i, _)| !(*k == kind && *i == id));
        catalog.stamps.push((kind, id, modified));
    }

    /// 🔗 Put a row in `kind`'s junction table.
    pub(crate) async fn link(&self, kind: EntityKind, entity_id: Uuid, film_work_id: Uuid) {
        self.catalog.lock().await.links.push((kind, entity_id, film_work_id));
    }

    /// 📄 Add rows the big join would produce.
    pub(crate) async fn add_rows(&self, rows: impl IntoIterator<Item = JoinedFilmWorkRow>) {
        self.catalog.lock().await.rows.extend(rows);
    }

    /// 🔌 Make the next `count` calls fail like a database that is still booting.
    pub(crate) fn fail_next(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    pub(crate) async fn recorded(&self) -> Vec<RecordedQuery> {
        self.queries.lock().await.clone()
    }

    fn take_outage(&self) -> Result<()> {
        let remaining = self.outages.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outages.store(remaining - 1, Ordering::SeqCst);
            let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "in-memory outage");
            return Err(anyhow::Error::new(refused)).context("💀 in-memory catalog is pretending to be down");
        }
        Ok(())
    }
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl RelationalSource for InMemorySource {
    async fn fetch_ids(&self, query: &IdQuery, limit: i64, offset: i64) -> Result<Vec<Uuid>> {
        self.take_outage()?;
        self.queries.lock().await.push(RecordedQuery::Ids { query: query.clone(), offset });
        let catalog = self.catalog.lock().await;
        match query {
            IdQuery::ChangedSince { kind, since } => {
                let mut changed: Vec<(ChangeCursor, Uuid)> = catalog
                    .stamps
                    .iter()
                    .filter(|(k, _, modified)| k == kind && modified > since)
                    .map(|(_, id, modified)| (*modified, *id))
                    .collect();
                changed.sort();
                Ok(page(changed, limit, offset).into_iter().map(|(_, id)| id).collect())
            }
            IdQuery::FilmWorksReferencing { kind, ids } => {
                let mut film_works: Vec<(ChangeCursor, Uuid)> = catalog
                    .links
                    .iter()
                    .filter(|(k, entity_id, _)| k == kind && ids.contains(entity_id))
                    .map(|(_, _, film_work_id)| {
                        (catalog.modified_of(EntityKind::FilmWork, *film_work_id), *film_work_id)
                    })
                    .collect();
                film_works.sort();
                film_works.dedup();
                Ok(page(film_works, limit, offset).into_iter().map(|(_, id)| id).collect())
            }
        }
    }

    async fn fetch_rows(&self, query: &RowQuery, limit: i64, offset: i64) -> Result<Vec<JoinedFilmWorkRow>> {
        self.take_outage()?;
        self.queries.lock().await.push(RecordedQuery::Rows { query: query.clone(), offset });
        let catalog = self.catalog.lock().await;
        let mut matching: Vec<(ChangeCursor, Uuid, JoinedFilmWorkRow)> = catalog
            .rows
            .iter()
            .filter_map(|row| {
                let id = row.film_work_id?;
                let modified = catalog.modified_of(EntityKind::FilmWork, id);
                let keep = match query {
                    RowQuery::ByIds(ids) => ids.contains(&id),
                    RowQuery::ModifiedSince(since) => modified > *since,
                };
                keep.then(|| (modified, id, row.clone()))
            })
            .collect();
        // -- stable sort keeps insertion order inside a film work, like pfw.id, gfw.id would
        matching.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(page(matching, limit, offset).into_iter().map(|(_, _, row)| row).collect())
    }
}

// ============================================================
// 🧠 InMemoryStorage
// ============================================================

/// 🧠 Redis, if Redis were a `HashMap` and had never heard of persistence.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryStorage {
    pub(crate) entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

// ============================================================
// 📡 InMemoryIndex
// ============================================================

/// 🎭 Ways the fake cluster can ruin your afternoon on request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InjectedFailure {
    /// The next `remaining` bulk calls fail with a 503.
    Unavailable { remaining: u32 },
    /// Every bulk call is rejected outright, like a malformed request.
    Rejected,
    /// Bulk calls succeed, but these document ids come back as per-item errors.
    RejectIds(Vec<String>),
}

#[derive(Debug, Default)]
pub(crate) struct IndexContents {
    pub(crate) exists: bool,
    pub(crate) mapping: Option<Value>,
    pub(crate) docs: BTreeMap<String, Value>,
}

/// 📡 An Elasticsearch index made of a `BTreeMap` and optimism.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryIndex {
    pub(crate) contents: Arc<Mutex<IndexContents>>,
    /// 📜 Every command received, in order.
    pub(crate) commands: Arc<Mutex<Vec<IndexCommand>>>,
    failure: Arc<Mutex<Option<InjectedFailure>>>,
}

impl InMemoryIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn inject(&self, failure: InjectedFailure) {
        *self.failure.lock().await = Some(failure);
    }

    pub(crate) async fn document(&self, id: &str) -> Option<Value> {
        self.contents.lock().await.docs.get(id).cloned()
    }

    pub(crate) async fn document_count(&self) -> usize {
        self.contents.lock().await.docs.len()
    }

    pub(crate) async fn bulk_calls(&self) -> usize {
        self.commands
            .lock()
            .await
            .iter()
            .filter(|command| matches!(command, IndexCommand::Bulk { .. }))
            .count()
    }

    async fn bulk(&self, payload: &str) -> Result<IndexReply> {
        let rejected_ids = {
            let mut failure = self.failure.lock().await;
            match failure.as_mut() {
                Some(InjectedFailure::Unavailable { remaining }) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(IndexError::Transport("503 Service Unavailable (in-memory)".into()).into());
                }
                Some(InjectedFailure::Rejected) => {
                    return Err(IndexError::Api { status: 400, body: "illegal_argument_exception (in-memory)".into() }.into());
                }
                Some(InjectedFailure::RejectIds(ids)) => ids.clone(),
                _ => Vec::new(),
            }
        };

        let mut contents = self.contents.lock().await;
        let mut outcome = BulkOutcome::default();
        let mut lines = payload.lines().filter(|line| !line.trim().is_empty());
        while let Some(action_line) = lines.next() {
            let action: Value = serde_json::from_str(action_line).context("💀 bulk action line is not JSON")?;
            let source_line = lines.next().context("💀 bulk action line with no source line after it")?;
            let source: Value = serde_json::from_str(source_line).context("💀 bulk source line is not JSON")?;
            let id = action
                .pointer("/index/_id")
                .and_then(Value::as_str)
                .context("💀 bulk action without an index._id")?
                .to_string();
            if rejected_ids.contains(&id) {
                outcome.failures.push(BulkItemFailure {
                    id,
                    status: 400,
                    reason: "mapper_parsing_exception (in-memory)".into(),
                });
            } else {
                contents.docs.insert(id, source);
                outcome.succeeded += 1;
            }
        }
        Ok(IndexReply::Bulk(outcome))
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndex {
    async fn execute(&self, command: IndexCommand) -> Result<IndexReply> {
        self.commands.lock().await.push(command.clone());
        match command {
            IndexCommand::Ping => Ok(IndexReply::Pong),
            IndexCommand::Exists => Ok(IndexReply::Exists(self.contents.lock().await.exists)),
            IndexCommand::Create { body } => {
                let mut contents = self.contents.lock().await;
                if contents.exists {
                    return Ok(IndexReply::AlreadyExists);
                }
                contents.exists = true;
                contents.mapping = Some(body);
                Ok(IndexReply::Created)
            }
            IndexCommand::Delete => {
                let mut contents = self.contents.lock().await;
                *contents = IndexContents::default();
                Ok(IndexReply::Deleted)
            }
            IndexCommand::Bulk { payload } => self.bulk(&payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn the_one_where_the_fake_catalog_pages_like_the_real_one() -> Result<()> {
        let source = InMemorySource::new();
        let t0 = Utc::now();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (n, id) in ids.iter().enumerate() {
            source.stamp(EntityKind::Person, *id, t0 + Duration::seconds(n as i64)).await;
        }
        let query = IdQuery::ChangedSince { kind: EntityKind::Person, since: t0 };
        assert_eq!(source.fetch_ids(&query, 2, 0).await?, ids[1..3].to_vec());
        assert_eq!(source.fetch_ids(&query, 2, 2).await?, ids[3..5].to_vec());
        assert!(source.fetch_ids(&query, 2, 4).await?.is_empty());
        assert_eq!(source.recorded().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_fake_index_parses_real_ndjson() -> Result<()> {
        let index = InMemoryIndex::new();
        let payload = concat!(
            "{\"index\":{\"_index\":\"movies\",\"_id\":\"a\"}}\n",
            "{\"title\":\"A\"}\n",
            "{\"index\":{\"_index\":\"movies\",\"_id\":\"a\"}}\n",
            "{\"title\":\"A, again\"}\n",
        );
        let reply = index.execute(IndexCommand::Bulk { payload: payload.to_string() }).await?;
        assert_eq!(reply, IndexReply::Bulk(BulkOutcome { succeeded: 2, failures: vec![] }));
        assert_eq!(index.document_count().await, 1);
        assert_eq!(index.document("a").await, Some(serde_json::json!({"title": "A, again"})));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_outage_ends() -> Result<()> {
        let source = InMemorySource::new();
        source.fail_next(1);
        let query = RowQuery::ModifiedSince(DateTime::<Utc>::UNIX_EPOCH);
        let err = source.fetch_rows(&query, 10, 0).await.unwrap_err();
        assert!(crate::retry::is_transient(&err));
        assert!(source.fetch_rows(&query, 10, 0).await?.is_empty());
        Ok(())
    }
}
