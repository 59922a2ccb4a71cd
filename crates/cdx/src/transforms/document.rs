//! 🎬 Merged film work → search document. The glow-up montage.
//!
//! Rating becomes `imdb_rating`. Each role's people become two fields: a flat
//! `{role}s_names` list for full-text search and a `{role}s` list of `{id, name}`
//! pairs for anything that wants to link back. Same order in both, one name per
//! person, so two people called "John Smith" show up as two names.

use anyhow::{Result, bail};

use super::IngestTransform;
use crate::common::{IndexDocument, MergedFilmWork, PersonRef};

/// ⭐ The rating scale the catalog enforces on `film_work.rating`.
const RATING_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// 🎬 The one ingest transform this crate needs.
pub(crate) struct FilmWorkDocument;

impl IngestTransform for FilmWorkDocument {
    fn transform_record(merged: &MergedFilmWork) -> Result<IndexDocument> {
        let Some(rating) = merged.rating else {
            bail!("💀 film work {} has no rating. imdb_rating is not optional in the index.", merged.id);
        };
        if !rating.is_finite() || !RATING_RANGE.contains(&rating) {
            bail!("💀 film work {} has rating {rating}, which is not a rating, it's a cry for help.", merged.id);
        }
        Ok(IndexDocument {
            id: merged.id.to_string(),
            imdb_rating: rating,
            genres: merged.genres.clone(),
            title: merged.title.clone(),
            description: merged.description.clone(),
            directors_names: names_of(&merged.directors),
            actors_names: names_of(&merged.actors),
            writers_names: names_of(&merged.writers),
            directors: merged.directors.clone(),
            actors: merged.actors.clone(),
            writers: merged.writers.clone(),
        })
    }
}

fn names_of(people: &[PersonRef]) -> Vec<String> {
    people.iter().map(|person| person.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FilmWorkKind;
    use uuid::Uuid;

    fn merged(rating: Option<f64>) -> MergedFilmWork {
        MergedFilmWork::bare(Uuid::new_v4(), "Up".into(), None, rating, FilmWorkKind::Movie)
    }

    #[test]
    fn the_one_where_every_field_lands_in_the_right_place() -> Result<()> {
        let mut up = merged(Some(8.2));
        let docter = PersonRef { id: Uuid::new_v4(), name: "Pete Docter".into() };
        let asner = PersonRef { id: Uuid::new_v4(), name: "Ed Asner".into() };
        up.directors.push(docter.clone());
        up.writers.push(docter.clone());
        up.actors.push(asner.clone());
        up.genres = vec!["Animation".into(), "Adventure".into()];

        let document = FilmWorkDocument::transform_record(&up)?;
        assert_eq!(document.id, up.id.to_string());
        assert_eq!(document.imdb_rating, 8.2);
        assert_eq!(document.title, "Up");
        assert_eq!(document.description, None);
        assert_eq!(document.genres, ["Animation", "Adventure"]);
        assert_eq!(document.directors_names, ["Pete Docter"]);
        assert_eq!(document.writers, vec![docter]);
        assert_eq!(document.actors, vec![asner]);
        assert_eq!(document.actors_names, ["Ed Asner"]);
        Ok(())
    }

    #[test]
    fn the_one_where_a_bare_record_gets_empty_lists_not_nulls() -> Result<()> {
        let document = FilmWorkDocument::transform_record(&merged(Some(0.0)))?;
        let json = serde_json::to_value(&document)?;
        for field in ["genres", "directors_names", "actors_names", "writers_names", "directors", "actors", "writers"] {
            assert_eq!(json[field], serde_json::json!([]), "{field} should be an empty list");
        }
        Ok(())
    }

    #[test]
    fn the_one_where_ratings_must_be_actual_ratings() {
        for rating in [None, Some(f64::NAN), Some(f64::INFINITY), Some(-0.5), Some(100.1)] {
            assert!(FilmWorkDocument::transform_record(&merged(rating)).is_err(), "{rating:?} should be rejected");
        }
        assert!(FilmWorkDocument::transform_record(&merged(Some(100.0))).is_ok());
    }
}
