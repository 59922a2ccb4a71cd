//! 🔍 The Extractor: asks the catalog "what changed?" and keeps asking until it says "nothing".
//!
//! 🎬 *[a genre is renamed. the extractor finds it. the extractor finds every
//! film wearing it. the extractor pulls every row of every one of those films.
//! the extractor does not get paid overtime.]* 🦆
//!
//! Three questions, all paged with LIMIT/OFFSET until an empty page comes back:
//! 1. which rows of an entity table changed since the cursor?
//! 2. which film works reference those rows?
//! 3. what does the big join say about those film works?
//!
//! Every page is a read, so every page goes through the retry policy.

use std::collections::HashSet;
use std::future::Future;

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use crate::backends::{IdQuery, RelationalSource, RowQuery, SourceBackend};
use crate::common::{ChangeCursor, EntityKind, JoinedFilmWorkRow};
use crate::retry::RetryPolicy;

#[derive(Debug)]
pub(crate) struct Extractor {
    source: SourceBackend,
    page_size: i64,
    retry: RetryPolicy,
}

impl Extractor {
    pub(crate) fn new(source: SourceBackend, page_size: usize, retry: RetryPolicy) -> Self {
        Self { source, page_size: page_size.max(1) as i64, retry }
    }

    /// 🔍 Ids of `kind` modified strictly after `since`, oldest first, every page.
    pub(crate) async fn find_changed_entity_ids(&self, kind: EntityKind, since: ChangeCursor) -> Result<Vec<Uuid>> {
        let query = IdQuery::ChangedSince { kind, since };
        let ids = self
            .drain_pages("changed entity ids", |offset| self.source.fetch_ids(&query, self.page_size, offset))
            .await?;
        debug!(entity = %kind, found = ids.len(), "🔍 scanned for changes");
        Ok(ids)
    }

    /// 🔗 Film works referencing any of `ids` through `kind`'s junction table.
    ///
    /// An empty `ids` returns empty without touching the database: `= ANY('{}')`
    /// is technically legal and practically a waste of a round trip.
    /// Film works expand to themselves.
    pub(crate) async fn expand_to_film_work_ids(&self, kind: EntityKind, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if kind == EntityKind::FilmWork {
            return Ok(dedup_keep_first(ids.to_vec()));
        }
        let query = IdQuery::FilmWorksReferencing { kind, ids: ids.to_vec() };
        let film_work_ids = self
            .drain_pages("film works referencing changes", |offset| {
                self.source.fetch_ids(&query, self.page_size, offset)
            })
            .await?;
        let film_work_ids = dedup_keep_first(film_work_ids);
        debug!(entity = %kind, changed = ids.len(), affected = film_work_ids.len(), "🔗 expanded to film works");
        Ok(film_work_ids)
    }

    /// 🎬 Every joined row for the film works the query selects.
    pub(crate) async fn extract_film_work_rows(&self, query: &RowQuery) -> Result<Vec<JoinedFilmWorkRow>> {
        if matches!(query, RowQuery::ByIds(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }
        let rows = self
            .drain_pages("film work rows", |offset| self.source.fetch_rows(query, self.page_size, offset))
            .await?;
        debug!(rows = rows.len(), "🎬 extracted joined rows");
        Ok(rows)
    }

    /// 🔄 Keep fetching pages until one comes back empty. Each page retries on its own,
    /// so a blip on page 40 does not restart pages 1 to 39.
    async fn drain_pages<T, F, Fut>(&self, what: &str, mut fetch: F) -> Result<Vec<T>>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut collected = Vec::new();
        let mut offset: i64 = 0;
        loop {
            let page = self.retry.run(what, || fetch(offset)).await?;
            if page.is_empty() {
                return Ok(collected);
            }
            offset += page.len() as i64;
            collected.extend(page);
        }
    }
}

fn dedup_keep_first(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
