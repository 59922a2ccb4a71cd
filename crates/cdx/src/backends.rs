//! 🔌 Backends: where the real I/O happens.
//!
//! 🐘 Postgres pours the rows, 🧠 Redis remembers where we stopped, and
//! 📡 Elasticsearch slurps up the documents. In between, we panic! (kidding, we use anyhow)
//!
//! 🎭 Every external store hides behind a narrow trait and a backend enum, so the
//! pipeline never knows (or cares) whether it is talking to a real cluster or a
//! `Vec` pretending very hard to be one. The in-memory variants exist for tests.
//! If you deploy them to prod, please also deploy a therapist.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::common::{ChangeCursor, EntityKind, JoinedFilmWorkRow};

pub(crate) mod elasticsearch;
// 🧪 test doubles; production wiring never picks them
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) mod in_mem;
pub(crate) mod postgres;
pub(crate) mod redis;

pub use self::elasticsearch::{ElasticsearchConfig, ElasticsearchIndex, IndexError};
pub use self::postgres::{PostgresConfig, PostgresSource};
pub use self::redis::{RedisConfig, RedisStorage};

pub(crate) use self::in_mem::{InMemoryIndex, InMemorySource, InMemoryStorage};

// ===== Relational side =====

/// 🔍 A paged query that yields ids.
#[derive(Debug, Clone, PartialEq)]
pub enum IdQuery {
    /// Rows of `kind` whose `modified` is strictly after `since`, oldest first.
    ChangedSince { kind: EntityKind, since: ChangeCursor },
    /// Film works linked to any of `ids` through `kind`'s junction table.
    FilmWorksReferencing { kind: EntityKind, ids: Vec<Uuid> },
}

/// 🎬 A paged query that yields the big denormalizing join.
#[derive(Debug, Clone, PartialEq)]
pub enum RowQuery {
    /// Explicit film work ids, typically fanned out from a changed genre or person.
    ByIds(Vec<Uuid>),
    /// Film works whose own `modified` is strictly after the cursor.
    ModifiedSince(ChangeCursor),
}

/// 🚰 A relational store that answers one page of a query per call.
///
/// # Contract 📜
/// - Pages are `LIMIT limit OFFSET offset` over a stable ordering.
/// - An empty page means "no more". The caller stops asking.
/// - Reads only. Retrying a page is always safe.
#[async_trait]
pub(crate) trait RelationalSource: std::fmt::Debug + Send + Sync {
    async fn fetch_ids(&self, query: &IdQuery, limit: i64, offset: i64) -> Result<Vec<Uuid>>;
    async fn fetch_rows(&self, query: &RowQuery, limit: i64, offset: i64) -> Result<Vec<JoinedFilmWorkRow>>;
}

/// 🎭 The many faces of a relational source.
#[derive(Debug)]
pub(crate) enum SourceBackend {
    #[cfg_attr(not(test), allow(dead_code))]
    InMemory(InMemorySource),
    Postgres(PostgresSource),
}

#[async_trait]
impl RelationalSource for SourceBackend {
    async fn fetch_ids(&self, query: &IdQuery, limit: i64, offset: i64) -> Result<Vec<Uuid>> {
        match self {
            SourceBackend::InMemory(source) => source.fetch_ids(query, limit, offset).await,
            SourceBackend::Postgres(source) => source.fetch_ids(query, limit, offset).await,
        }
    }

    async fn fetch_rows(&self, query: &RowQuery, limit: i64, offset: i64) -> Result<Vec<JoinedFilmWorkRow>> {
        match self {
            SourceBackend::InMemory(source) => source.fetch_rows(query, limit, offset).await,
            SourceBackend::Postgres(source) => source.fetch_rows(query, limit, offset).await,
        }
    }
}

// ===== Checkpoint side =====

/// 🧠 The narrowest possible key-value capability: get a string, set a string.
///
/// Everything smarter (JSON objects, cursors, flags) lives in [`crate::state::State`].
#[async_trait]
pub(crate) trait StateStorage: std::fmt::Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug)]
pub(crate) enum StorageBackend {
    #[cfg_attr(not(test), allow(dead_code))]
    InMemory(InMemoryStorage),
    Redis(RedisStorage),
}

#[async_trait]
impl StateStorage for StorageBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            StorageBackend::InMemory(storage) => storage.get(key).await,
            StorageBackend::Redis(storage) => storage.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        match self {
            StorageBackend::InMemory(storage) => storage.set(key, value).await,
            StorageBackend::Redis(storage) => storage.set(key, value).await,
        }
    }
}

// ===== Index side =====

/// 📡 Everything we ever ask of the search index, as a closed set.
///
/// Adding a command means adding a variant, and the compiler then walks you to
/// every handler that has to learn about it. No string lookups, no "unrecognised
/// command" at runtime.
#[derive(Debug, Clone)]
pub(crate) enum IndexCommand {
    /// Is the cluster even there?
    Ping,
    /// Does the configured index exist?
    Exists,
    /// Create the configured index with this settings+mappings body.
    Create { body: Value },
    /// Delete the configured index. Missing index is fine.
    Delete,
    /// POST an NDJSON payload to `_bulk`.
    Bulk { payload: String },
}

/// 📬 What came back from an [`IndexCommand`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IndexReply {
    Pong,
    Exists(bool),
    Created,
    AlreadyExists,
    Deleted,
    Bulk(BulkOutcome),
}

/// 📦 Per-document verdicts from one `_bulk` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failures: Vec<BulkItemFailure>,
}

/// 💀 One document the cluster refused, and its reasons.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// 🕳️ A search index that executes commands.
#[async_trait]
pub(crate) trait IndexBackend: std::fmt::Debug + Send + Sync {
    async fn execute(&self, command: IndexCommand) -> Result<IndexReply>;
}

#[derive(Debug)]
pub(crate) enum SinkBackend {
    #[cfg_attr(not(test), allow(dead_code))]
    InMemory(InMemoryIndex),
    Elasticsearch(ElasticsearchIndex),
}

#[async_trait]
impl IndexBackend for SinkBackend {
    async fn execute(&self, command: IndexCommand) -> Result<IndexReply> {
        match self {
            SinkBackend::InMemory(index) => index.execute(command).await,
            SinkBackend::Elasticsearch(index) => index.execute(command).await,
        }
    }
}
