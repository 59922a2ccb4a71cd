// ai
//! # 🎬 THE PIPELINE
//!
//! *Previously, on Cinedex...* a genre was renamed, an actor's surname got its
//! accent back, and three new films landed in the catalog. The search index
//! knows none of this. Yet.
//!
//! One pass walks the state machine:
//!
//! ```text
//!   Idle → CheckIndex → ScanEntities → ExpandChanges → ExtractRows
//!        → Merge → Transform → Load → AdvanceCursor → Idle
//! ```
//!
//! - `CheckIndex` only runs until the state says the index was created.
//! - For each entity kind (genre, person, film work) the changed ids are
//!   expanded to the film works they touch, and those film works go through
//!   extract → merge → transform → load on their own before the next kind.
//! - A final direct pass picks up film works whose own `modified` moved.
//!   At the epoch cursor (a fresh install) that direct pass is the only path:
//!   "changed since the dawn of time" is just "everything".
//! - The cursor advances to the moment the pass *started*, never when it
//!   finished, so rows committed mid-pass are picked up next time. If anything
//!   fails the cursor stays where it was and the next pass redoes the window.
//!   At-least-once in, idempotent overwrite out. 🦆

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use anyhow::{Result, bail};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::{ChangeCursor, EntityKind, MergedFilmWork};
use crate::extractor::Extractor;
use crate::loader::Loader;
use crate::merger::FilmWorkMerger;
use crate::progress::RunMetrics;
use crate::backends::RowQuery;
use crate::state::State;
use crate::transforms::DocumentTransformer;

/// 🚦 Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    CheckIndex,
    ScanEntities,
    ExpandChanges,
    ExtractRows,
    Merge,
    Transform,
    Load,
    AdvanceCursor,
}

#[derive(Debug)]
pub(crate) struct Pipeline {
    extractor: Extractor,
    merger: FilmWorkMerger,
    transformer: DocumentTransformer,
    loader: Loader,
    state: State,
    mapping: Value,
    epoch_start: ChangeCursor,
    stage: PipelineStage,
}

impl Pipeline {
    pub(crate) fn new(extractor: Extractor, loader: Loader, state: State, mapping: Value, epoch_start: ChangeCursor) -> Self {
        Self {
            extractor,
            merger: FilmWorkMerger::new(),
            transformer: DocumentTransformer::new(),
            loader,
            state,
            mapping,
            epoch_start,
            stage: PipelineStage::Idle,
        }
    }

    fn transition(&mut self, next: PipelineStage) {
        info!(from = ?self.stage, to = ?next, "🚦 stage transition");
        self.stage = next;
    }

    /// 🏓 Make sure the index is reachable before committing to a life of polling it.
    pub(crate) async fn preflight(&self) -> Result<()> {
        self.loader.ping().await
    }

    /// ⏰ The cursor as last committed, without running anything.
    pub(crate) async fn committed_cursor(&self) -> Result<Option<ChangeCursor>> {
        self.state.cursor().await
    }

    /// 🗑️ Drop the index and forget all progress. The next pass reindexes everything.
    pub(crate) async fn rebuild_index(&mut self) -> Result<()> {
        warn!("🗑️ rebuilding from scratch: dropping the index and resetting the cursor");
        self.loader.drop_index().await?;
        self.state.reset().await
    }

    /// 🚀 One full pass. `started_at` must be captured before the pass begins;
    /// it becomes the new cursor on success.
    pub(crate) async fn run_once(&mut self, started_at: ChangeCursor) -> Result<RunMetrics> {
        let clock = Instant::now();
        let mut metrics = RunMetrics::default();
        let result = self.pass(started_at, &mut metrics).await;
        metrics.duration = clock.elapsed();
        if let Err(ref err) = result {
            error!(failed_in = ?self.stage, error = %format!("{err:#}"), "💀 pass failed, cursor not advanced");
        }
        self.transition(PipelineStage::Idle);
        result.map(|()| metrics)
    }

    async fn pass(&mut self, started_at: ChangeCursor, metrics: &mut RunMetrics) -> Result<()> {
        let stored_cursor = self.state.cursor().await?;
        metrics.cursor_before = stored_cursor;
        let cursor = stored_cursor.unwrap_or(self.epoch_start);

        if !self.state.index_created().await? {
            self.transition(PipelineStage::CheckIndex);
            let status = self.loader.ensure_index(&self.mapping).await?;
            self.state.mark_index_created(true).await?;
            info!(?status, "✅ index checked");
        }

        if cursor == self.epoch_start {
            info!(%cursor, "🌅 cursor at the epoch, taking the direct path only");
        } else {
            for kind in EntityKind::SCAN_ORDER {
                self.transition(PipelineStage::ScanEntities);
                let changed = self.extractor.find_changed_entity_ids(kind, cursor).await?;
                metrics.record_changed(kind, changed.len());
                info!(entity = %kind, found = changed.len(), "🔍 entities changed since cursor");
                if changed.is_empty() {
                    continue;
                }
                self.transition(PipelineStage::ExpandChanges);
                let film_work_ids = self.extractor.expand_to_film_work_ids(kind, &changed).await?;
                info!(entity = %kind, affected = film_work_ids.len(), "🔗 film works affected");
                metrics.film_works_affected += film_work_ids.len() as u64;
                self.process(RowQuery::ByIds(film_work_ids), metrics).await?;
            }
        }
        let modified_directly = self.process(RowQuery::ModifiedSince(cursor), metrics).await?;
        metrics.film_works_affected += modified_directly as u64;

        self.transition(PipelineStage::AdvanceCursor);
        let next_cursor = if started_at < cursor {
            warn!(%cursor, %started_at, "⏰ pass started before the stored cursor (clock skew?), keeping the cursor");
            cursor
        } else {
            started_at
        };
        self.state.set_cursor(next_cursor).await?;
        metrics.cursor_after = Some(next_cursor);
        info!(cursor = %next_cursor, "⏩ cursor advanced");
        Ok(())
    }

    /// 🎬 extract → merge → transform → load for one set of film works.
    /// Returns how many distinct film works the extracted rows belonged to.
    async fn process(&mut self, query: RowQuery, metrics: &mut RunMetrics) -> Result<usize> {
        self.transition(PipelineStage::ExtractRows);
        let rows = self.extractor.extract_film_work_rows(&query).await?;
        let film_works_seen = rows.iter().filter_map(|row| row.film_work_id).collect::<HashSet<_>>().len();
        metrics.rows_extracted += rows.len() as u64;
        info!(rows = rows.len(), film_works = film_works_seen, "🎬 rows extracted");

        self.transition(PipelineStage::Merge);
        let merged: BTreeMap<Uuid, MergedFilmWork> = self.merger.merge(rows);
        metrics.rows_rejected += self.merger.rejected_rows() as u64;
        metrics.records_merged += merged.len() as u64;
        info!(records = merged.len(), rejected = self.merger.rejected_rows(), "🧩 records merged");

        self.transition(PipelineStage::Transform);
        let output = self.transformer.transform(&merged);
        metrics.documents_rejected += output.rejected.len() as u64;

        self.transition(PipelineStage::Load);
        let report = self.loader.load(&output.documents).await?;
        metrics.documents_loaded += report.loaded as u64;
        info!(loaded = report.loaded, failed = report.errors.len(), "🚀 documents loaded");
        if !report.errors.is_empty() {
            for failure in report.errors.iter().take(5) {
                error!(id = %failure.id, status = failure.status, reason = %failure.reason, "💀 document rejected by the index");
            }
            bail!(
                "💀 {} document(s) were rejected by the index. That's a mapping or data bug, not bad luck, so the cursor stays put until it's fixed.",
                report.errors.len()
            );
        }
        Ok(film_works_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InjectedFailure, RecordedQuery};
    use crate::backends::{
        IdQuery, IndexCommand, InMemoryIndex, InMemorySource, InMemoryStorage, SinkBackend, SourceBackend,
        StorageBackend,
    };
    use crate::common::JoinedFilmWorkRow;
    use crate::retry::RetryPolicy;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    struct Fixture {
        source: InMemorySource,
        index: InMemoryIndex,
        storage: InMemoryStorage,
    }

    impl Fixture {
        fn new() -> Self {
            Self { source: InMemorySource::new(), index: InMemoryIndex::new(), storage: InMemoryStorage::new() }
        }

        fn state(&self) -> State {
            State::new(StorageBackend::InMemory(self.storage.clone()), "cdx_state", RetryPolicy::no_retry())
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(
                Extractor::new(SourceBackend::InMemory(self.source.clone()), 2, RetryPolicy::no_retry()),
                Loader::new(SinkBackend::InMemory(self.index.clone()), "movies", 500, RetryPolicy::no_retry()),
                self.state(),
                json!({"mappings": {}}),
                DateTime::<Utc>::UNIX_EPOCH,
            )
        }

        async fn film(&self, id: Uuid, title: &str, modified: ChangeCursor, genre: &str) {
            self.source.stamp(EntityKind::FilmWork, id, modified).await;
            self.source
                .add_rows([JoinedFilmWorkRow {
                    film_work_id: Some(id),
                    title: Some(title.into()),
                    rating: Some(7.1),
                    kind: Some("movie".into()),
                    genre: Some(genre.into()),
                    ..JoinedFilmWorkRow::default()
                }])
                .await;
        }
    }

    #[tokio::test]
    async fn the_one_where_the_first_run_only_takes_the_direct_path() -> Result<()> {
        let fixture = Fixture::new();
        let fw = Uuid::new_v4();
        fixture.film(fw, "Metropolis", Utc::now() - Duration::days(1), "Sci-Fi").await;

        let started_at = Utc::now();
        let metrics = fixture.pipeline().run_once(started_at).await?;

        let queries = fixture.source.recorded().await;
        assert!(!queries.is_empty());
        assert!(
            queries.iter().all(|q| matches!(
                q,
                RecordedQuery::Rows { query: RowQuery::ModifiedSince(since), .. } if *since == DateTime::<Utc>::UNIX_EPOCH
            )),
            "first run must never scan or expand entities, got {queries:?}"
        );
        assert_eq!(metrics.documents_loaded, 1);
        assert!(fixture.index.document(&fw.to_string()).await.is_some());
        assert_eq!(fixture.state().cursor().await?, Some(started_at));
        assert!(fixture.state().index_created().await?);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_renamed_genre_drags_its_old_film_along() -> Result<()> {
        let fixture = Fixture::new();
        let cursor = Utc::now() - Duration::hours(1);
        fixture.state().set_cursor(cursor).await?;
        fixture.state().mark_index_created(true).await?;

        let (fw, genre) = (Uuid::new_v4(), Uuid::new_v4());
        fixture.film(fw, "Casablanca", cursor - Duration::days(3650), "Romance").await;
        fixture.source.stamp(EntityKind::Genre, genre, cursor + Duration::minutes(5)).await;
        fixture.source.link(EntityKind::Genre, genre, fw).await;

        let started_at = Utc::now();
        let metrics = fixture.pipeline().run_once(started_at).await?;

        assert_eq!(metrics.genres_changed, 1);
        assert_eq!(metrics.persons_changed, 0);
        assert_eq!(metrics.film_works_changed, 0);
        assert_eq!(metrics.documents_loaded, 1);
        let doc = fixture.index.document(&fw.to_string()).await.expect("💀 the old film should be reindexed");
        assert_eq!(doc["genres"], json!(["Romance"]));

        let queries = fixture.source.recorded().await;
        for kind in EntityKind::SCAN_ORDER {
            assert!(queries.contains(&RecordedQuery::Ids {
                query: IdQuery::ChangedSince { kind, since: cursor },
                offset: 0
            }));
        }
        assert!(queries.contains(&RecordedQuery::Rows { query: RowQuery::ByIds(vec![fw]), offset: 0 }));
        assert_eq!(fixture.state().cursor().await?, Some(started_at));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_affected_counts_the_fan_out_not_the_survivors() -> Result<()> {
        let fixture = Fixture::new();
        let cursor = Utc::now() - Duration::hours(1);
        fixture.state().set_cursor(cursor).await?;
        fixture.state().mark_index_created(true).await?;

        let (with_rows, rowless, genre) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fixture.film(with_rows, "Stalker", cursor - Duration::days(30), "Drama").await;
        fixture.source.stamp(EntityKind::FilmWork, rowless, cursor - Duration::days(20)).await;
        fixture.source.stamp(EntityKind::Genre, genre, cursor + Duration::minutes(1)).await;
        fixture.source.link(EntityKind::Genre, genre, with_rows).await;
        fixture.source.link(EntityKind::Genre, genre, rowless).await;

        let metrics = fixture.pipeline().run_once(Utc::now()).await?;
        assert_eq!(metrics.film_works_affected, 2);
        assert_eq!(metrics.records_merged, 1);
        assert_eq!(metrics.documents_loaded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_load_leaves_the_cursor_alone() -> Result<()> {
        let fixture = Fixture::new();
        let cursor = Utc::now() - Duration::hours(1);
        fixture.state().set_cursor(cursor).await?;
        let fw = Uuid::new_v4();
        fixture.film(fw, "Brazil", cursor + Duration::minutes(1), "Satire").await;

        fixture.index.inject(InjectedFailure::RejectIds(vec![fw.to_string()])).await;
        let mut pipeline = fixture.pipeline();
        assert!(pipeline.run_once(Utc::now()).await.is_err());
        assert_eq!(pipeline.stage, PipelineStage::Idle);
        assert_eq!(fixture.state().cursor().await?, Some(cursor), "cursor must not move on a failed load");

        fixture.index.inject(InjectedFailure::RejectIds(vec![])).await;
        let started_at = Utc::now();
        let metrics = pipeline.run_once(started_at).await?;
        assert_eq!(metrics.documents_loaded, 2, "the film work scan and the direct pass both see it");
        assert_eq!(fixture.index.document_count().await, 1);
        assert_eq!(fixture.state().cursor().await?, Some(started_at));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_bad_mapping_fails_the_pass_outright() -> Result<()> {
        let fixture = Fixture::new();
        let fw = Uuid::new_v4();
        fixture.film(fw, "Solaris", Utc::now(), "Drama").await;
        fixture.index.inject(InjectedFailure::Rejected).await;
        assert!(fixture.pipeline().run_once(Utc::now()).await.is_err());
        assert_eq!(fixture.state().cursor().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_running_twice_from_scratch_still_means_one_document() -> Result<()> {
        let fixture = Fixture::new();
        let fw = Uuid::new_v4();
        fixture.film(fw, "Groundhog Day", Utc::now() - Duration::days(1), "Comedy").await;
        let mut pipeline = fixture.pipeline();
        pipeline.run_once(Utc::now()).await?;
        fixture.state().reset().await?;
        pipeline.run_once(Utc::now()).await?;
        assert_eq!(fixture.index.document_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_check_index_is_skipped_once_remembered() -> Result<()> {
        let fixture = Fixture::new();
        fixture.state().mark_index_created(true).await?;
        fixture.pipeline().run_once(Utc::now()).await?;
        let commands = fixture.index.commands.lock().await.clone();
        assert!(
            !commands.iter().any(|c| matches!(c, IndexCommand::Exists | IndexCommand::Create { .. })),
            "index check should be skipped, got {commands:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bad_rows_and_bad_ratings_are_counted_not_fatal() -> Result<()> {
        let fixture = Fixture::new();
        let t = Utc::now() - Duration::minutes(10);
        let (good, unrated, weird) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fixture.film(good, "Good", t, "Drama").await;
        fixture.source.stamp(EntityKind::FilmWork, unrated, t).await;
        fixture.source.stamp(EntityKind::FilmWork, weird, t).await;
        fixture
            .source
            .add_rows([
                JoinedFilmWorkRow {
                    film_work_id: Some(unrated),
                    title: Some("Unrated".into()),
                    kind: Some("movie".into()),
                    ..JoinedFilmWorkRow::default()
                },
                JoinedFilmWorkRow {
                    film_work_id: Some(weird),
                    title: Some("Weird".into()),
                    rating: Some(5.0),
                    kind: Some("hologram".into()),
                    ..JoinedFilmWorkRow::default()
                },
            ])
            .await;

        let metrics = fixture.pipeline().run_once(Utc::now()).await?;
        assert_eq!(metrics.film_works_affected, 3, "the broken row still named its film work");
        assert_eq!(metrics.rows_extracted, 3);
        assert_eq!(metrics.rows_rejected, 1);
        assert_eq!(metrics.records_merged, 2);
        assert_eq!(metrics.documents_rejected, 1);
        assert_eq!(metrics.documents_loaded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_rebuild_wipes_the_slate() -> Result<()> {
        let fixture = Fixture::new();
        let fw = Uuid::new_v4();
        fixture.film(fw, "Memento", Utc::now() - Duration::days(1), "Mystery").await;
        let mut pipeline = fixture.pipeline();
        pipeline.run_once(Utc::now()).await?;
        assert_eq!(fixture.index.document_count().await, 1);

        pipeline.rebuild_index().await?;
        assert_eq!(fixture.index.document_count().await, 0);
        assert_eq!(fixture.state().cursor().await?, None);
        assert!(!fixture.state().index_created().await?);

        pipeline.run_once(Utc::now()).await?;
        assert_eq!(fixture.index.document_count().await, 1);
        Ok(())
    }
}
