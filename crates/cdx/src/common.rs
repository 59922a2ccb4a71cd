// ai
//! 📦 Common data structures: the building blocks of cinedex
//!
//! ---
//!
//! 🎬 COLD OPEN: INT. FILM ARCHIVE, 3:47 AM
//!
//! A single film work sits in Postgres. It has two directors, four actors and
//! a genre that someone renamed at lunch. The LEFT JOIN hands it over as eight
//! rows that all swear they are the same movie. They are. Nobody believes them.
//!
//! 🦆
//!
//! This module defines the shapes that ferry a film through the pipeline:
//! the flat [`JoinedFilmWorkRow`] the database coughs up, the
//! [`MergedFilmWork`] the merger glues back together, and the
//! [`IndexDocument`] Elasticsearch actually wants. Plus the closed enums
//! ([`EntityKind`], [`PersonRole`], [`FilmWorkKind`]) that keep stringly-typed
//! chaos out of the hot path.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ⏰ The cursor: "changes strictly after this instant have not been processed yet."
pub type ChangeCursor = DateTime<Utc>;

// ============================================================
// 🎭 EntityKind: the three tables that can make a film stale
// ============================================================

/// 🎭 A relational table whose rows can change on their own and drag film works along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Genre,
    Person,
    FilmWork,
}

impl EntityKind {
    /// 🔄 The scan order of a full pass. Film works go last, like the credits.
    pub const SCAN_ORDER: [EntityKind; 3] =
        [EntityKind::Genre, EntityKind::Person, EntityKind::FilmWork];

    /// 📋 The table holding this entity.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Genre => "genre",
            EntityKind::Person => "person",
            EntityKind::FilmWork => "film_work",
        }
    }

    /// 🔗 The junction table linking this entity to film works.
    /// `None` for film works themselves: they do not need a bridge to reach themselves.
    pub fn junction(self) -> Option<(&'static str, &'static str)> {
        match self {
            EntityKind::Genre => Some(("genre_film_work", "genre_id")),
            EntityKind::Person => Some(("person_film_work", "person_id")),
            EntityKind::FilmWork => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

// ============================================================
// 🎬 PersonRole / FilmWorkKind: closed sets from the catalog
// ============================================================

/// 🎬 What a person did in a film work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonRole {
    Director,
    Actor,
    Writer,
}

impl FromStr for PersonRole {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "director" => Ok(PersonRole::Director),
            "actor" => Ok(PersonRole::Actor),
            "writer" => Ok(PersonRole::Writer),
            // 💀 "key grip" is a real job. It is not a real role in this schema.
            other => bail!("💀 Unknown person role '{other}'. We know directors, actors and writers. That's the whole guest list."),
        }
    }
}

/// 📺 Movie or TV show, per the catalog's `film_work.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilmWorkKind {
    Movie,
    TvShow,
}

impl FromStr for FilmWorkKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "movie" => Ok(FilmWorkKind::Movie),
            "tv_show" => Ok(FilmWorkKind::TvShow),
            other => bail!("💀 Unknown film work type '{other}'. Not a movie, not a tv_show. A podcast, maybe. We don't index podcasts."),
        }
    }
}

// ============================================================
// 📄 Row / record / document shapes
// ============================================================

/// 📄 One flat row out of the big LEFT JOIN:
/// (film work) × (at most one person+role) × (at most one genre).
///
/// Every column is `Option` because LEFT JOIN produces NULLs on purpose and
/// dirty data produces them by accident. The merger sorts out which is which.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct JoinedFilmWorkRow {
    pub film_work_id: Option<Uuid>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating: Option<f64>,
    #[sqlx(rename = "type")]
    pub kind: Option<String>,
    pub role: Option<String>,
    pub person_id: Option<Uuid>,
    pub full_name: Option<String>,
    pub genre: Option<String>,
}

/// 🪪 A person as the index sees them: an id and a name. That's it. No headshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// 🧩 A film work glued back together from all its joined rows.
///
/// Person lists are deduplicated by person id (two different people can both be
/// called "John Smith", and both deserve credit). Genres are deduplicated by name.
/// Everything keeps first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedFilmWork {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub kind: FilmWorkKind,
    pub directors: Vec<PersonRef>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
    pub genres: Vec<String>,
}

impl MergedFilmWork {
    /// 🏗️ A bare record: core fields only, every collection empty.
    pub fn bare(id: Uuid, title: String, description: Option<String>, rating: Option<f64>, kind: FilmWorkKind) -> Self {
        Self {
            id,
            title,
            description,
            rating,
            kind,
            directors: Vec::new(),
            actors: Vec::new(),
            writers: Vec::new(),
            genres: Vec::new(),
        }
    }

    /// 🎭 The person list for a role, mutable, for the merger's eyes only.
    pub fn people_mut(&mut self, role: PersonRole) -> &mut Vec<PersonRef> {
        match role {
            PersonRole::Director => &mut self.directors,
            PersonRole::Actor => &mut self.actors,
            PersonRole::Writer => &mut self.writers,
        }
    }
}

/// 📡 The read-optimized document that lands in Elasticsearch, keyed by film work id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub imdb_rating: f64,
    pub genres: Vec<String>,
    pub title: String,
    pub description: Option<String>,
    pub directors_names: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub directors: Vec<PersonRef>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
}

/// 🎯 A bulk-ready document: who it is, where it goes, and its serialized body.
///
/// The film's id rides along as `_id` so a second delivery overwrites instead
/// of duplicating. At-least-once in, exactly-one-copy out.
#[derive(Debug, Clone, Default)]
pub(crate) struct Hit {
    pub id: Option<String>,
    pub index: Option<String>,
    pub source_buf: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_roles_parse_and_strangers_are_turned_away() {
        assert_eq!("director".parse::<PersonRole>().unwrap(), PersonRole::Director);
        assert_eq!("actor".parse::<PersonRole>().unwrap(), PersonRole::Actor);
        assert_eq!("writer".parse::<PersonRole>().unwrap(), PersonRole::Writer);
        assert!("key_grip".parse::<PersonRole>().is_err());
    }

    #[test]
    fn the_one_where_entity_kinds_know_their_tables() {
        assert_eq!(EntityKind::Genre.junction(), Some(("genre_film_work", "genre_id")));
        assert_eq!(EntityKind::Person.junction(), Some(("person_film_work", "person_id")));
        assert_eq!(EntityKind::FilmWork.junction(), None);
        assert_eq!(EntityKind::FilmWork.to_string(), "film_work");
    }

    #[test]
    fn the_one_where_film_work_kinds_match_the_catalog() {
        assert_eq!("tv_show".parse::<FilmWorkKind>().unwrap(), FilmWorkKind::TvShow);
        assert!("podcast".parse::<FilmWorkKind>().is_err());
    }
}
