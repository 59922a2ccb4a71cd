// ai
//! 🧩 The Merger: eight rows walk in claiming to be the same movie. One record walks out.
//!
//! 🎬 COLD OPEN: INT. CUTTING ROOM, NIGHT
//!
//! The LEFT JOIN does what LEFT JOINs do: one row per (film work × person-role ×
//! genre). A film with two directors, three actors and two genres arrives as a
//! dozen rows, each carrying a sliver of the truth. The merger folds them back
//! into one [`MergedFilmWork`] per film work id.
//!
//! 📜 Rules of the cutting room:
//! - people are deduplicated per role by **person id**, never by name (two
//!   "John Smith"s are two people and both get credit);
//! - genres are deduplicated by **name**;
//! - first-seen order is kept everywhere (stable dedup, no sorting);
//! - a film work with no people and no genres is still a film work (bare record);
//! - a row that fails the structural check is logged, counted and skipped, and
//!   the rest of the batch carries on;
//! - the in-progress map is detached at the end of every call, so one merger
//!   can be reused run after run without yesterday's cast showing up today. 🦆

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::{FilmWorkKind, JoinedFilmWorkRow, MergedFilmWork, PersonRef, PersonRole};

/// 🧩 Folds joined rows into one record per film work.
#[derive(Debug, Default)]
pub(crate) struct FilmWorkMerger {
    in_progress: BTreeMap<Uuid, MergedFilmWork>,
    rejected: usize,
}

/// 🔍 The parts of a row that passed inspection.
struct CheckedRow {
    film_work_id: Uuid,
    title: String,
    description: Option<String>,
    rating: Option<f64>,
    kind: FilmWorkKind,
    person: Option<(PersonRole, PersonRef)>,
    genre: Option<String>,
}

impl FilmWorkMerger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🧩 Merge `rows` into a detached map keyed by film work id.
    pub(crate) fn merge(&mut self, rows: impl IntoIterator<Item = JoinedFilmWorkRow>) -> BTreeMap<Uuid, MergedFilmWork> {
        self.rejected = 0;
        for (position, row) in rows.into_iter().enumerate() {
            match check_row(row) {
                Ok(checked) => self.fold(checked),
                Err(err) => {
                    self.rejected += 1;
                    warn!(row = position, error = %format!("{err:#}"), "⚠️ skipping a joined row that failed the structural check");
                }
            }
        }
        let merged = std::mem::take(&mut self.in_progress);
        debug!(records = merged.len(), rejected = self.rejected, "🧩 merge finished");
        merged
    }

    /// 💀 Rows skipped by the last [`merge`](Self::merge) call.
    pub(crate) fn rejected_rows(&self) -> usize {
        self.rejected
    }

    fn fold(&mut self, row: CheckedRow) {
        let record = self.in_progress.entry(row.film_work_id).or_insert_with(|| {
            MergedFilmWork::bare(row.film_work_id, row.title, row.description, row.rating, row.kind)
        });
        if let Some((role, person)) = row.person {
            let people = record.people_mut(role);
            if !people.iter().any(|known| known.id == person.id) {
                people.push(person);
            }
        }
        if let Some(genre) = row.genre {
            if !record.genres.contains(&genre) {
                record.genres.push(genre);
            }
        }
    }
}

/// 📋 Required: film work id, title, type. Optional but must parse if present: role.
/// A person only counts with id, name and role all present.
fn check_row(row: JoinedFilmWorkRow) -> Result<CheckedRow> {
    let film_work_id = row.film_work_id.context("💀 row has no film_work_id. A film with no id is just a rumour.")?;
    let title = row
        .title
        .with_context(|| format!("💀 film work {film_work_id} has no title"))?;
    let kind = row
        .kind
        .as_deref()
        .with_context(|| format!("💀 film work {film_work_id} has no type"))?
        .parse::<FilmWorkKind>()
        .with_context(|| format!("💀 film work {film_work_id} has a type we can't read"))?;
    let role = row
        .role
        .as_deref()
        .map(str::parse::<PersonRole>)
        .transpose()
        .with_context(|| format!("💀 film work {film_work_id} has a person with a role we can't read"))?;
    let person = match (role, row.person_id, row.full_name) {
        (Some(role), Some(id), Some(name)) => Some((role, PersonRef { id, name })),
        _ => None,
    };
    Ok(CheckedRow {
        film_work_id,
        title,
        description: row.description,
        rating: row.rating,
        kind,
        person,
        genre: row.genre,
    })
}
