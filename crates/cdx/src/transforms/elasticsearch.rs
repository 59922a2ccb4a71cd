// ai
//! 📡 Elasticsearch Bulk Transform: formatting documents for the bulk API's peculiar tastes 🚀
//!
//! Rule 1: Two lines per document. Action metadata, then document source. Always.
//! Rule 2: Newline-delimited. Not comma-separated. Not XML. NEWLINES.
//! Rule 3: The trailing newline on the whole body matters. It MATTERS.
//!          The loader adds it. This module does not.
//!
//! The `_id` is always the film work id, which is what turns "deliver twice"
//! into "overwrite once". 🦆

use anyhow::{Context, Result};
use serde_json::json;

use super::EgressTransform;
use crate::common::{Hit, IndexDocument};

/// 📡 Formats a [`Hit`] as `{"index":{...}}\n{...source...}`.
pub(crate) struct ElasticsearchBulk;

impl EgressTransform for ElasticsearchBulk {
    fn transform_hit(hit: &Hit) -> Result<String> {
        let mut action_metadata = serde_json::Map::new();
        if let Some(ref id) = hit.id {
            action_metadata.insert("_id".to_string(), serde_json::Value::String(id.clone()));
        }
        if let Some(ref index) = hit.index {
            action_metadata.insert("_index".to_string(), serde_json::Value::String(index.clone()));
        }
        let action_line = serde_json::to_string(&json!({ "index": action_metadata })).context(
            "💀 Failed to serialize bulk action metadata. The JSON that describes JSON has failed to become JSON.",
        )?;
        Ok(format!("{action_line}\n{}", hit.source_buf))
    }
}

/// 🎯 Wrap a document for the bulk API: its id as `_id`, the target index, its JSON body.
pub(crate) fn hit_for(document: &IndexDocument, index: &str) -> Result<Hit> {
    let source_buf = serde_json::to_string(document)
        .with_context(|| format!("💀 film work {} refused to become JSON", document.id))?;
    Ok(Hit { id: Some(document.id.clone()), index: Some(index.to_string()), source_buf })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_a_fully_loaded_hit_becomes_beautiful_bulk_format() -> Result<()> {
        let hit = Hit {
            id: Some("doc-42".to_string()),
            index: Some("movies".to_string()),
            source_buf: r#"{"title":"The Answer","imdb_rating":42.0}"#.to_string(),
        };
        let output = ElasticsearchBulk::transform_hit(&hit)?;
        let lines: Vec<&str> = output.split('\n').collect();
        assert_eq!(lines.len(), 2, "ES bulk format demands exactly two lines. No more. No less.");
        let action: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(action["index"]["_id"], "doc-42");
        assert_eq!(action["index"]["_index"], "movies");
        assert_eq!(lines[1], hit.source_buf);
        Ok(())
    }

    #[test]
    fn the_one_where_no_metadata_means_an_empty_action() -> Result<()> {
        let hit = Hit { id: None, index: None, source_buf: "{}".into() };
        let output = ElasticsearchBulk::transform_hit(&hit)?;
        let action: serde_json::Value = serde_json::from_str(output.lines().next().unwrap_or_default())?;
        assert_eq!(action["index"], json!({}));
        Ok(())
    }

    #[test]
    fn the_one_where_special_characters_survive_the_trip() -> Result<()> {
        let document = IndexDocument {
            id: "amelie".into(),
            imdb_rating: 8.3,
            genres: vec!["Comédie".into()],
            title: "Le Fabuleux Destin d'Amélie Poulain 🔥".into(),
            description: Some("she said \"bonjour\"\nthen left".into()),
            directors_names: vec![],
            actors_names: vec![],
            writers_names: vec![],
            directors: vec![],
            actors: vec![],
            writers: vec![],
        };
        let hit = hit_for(&document, "movies")?;
        let output = ElasticsearchBulk::transform_hit(&hit)?;
        let lines: Vec<&str> = output.split('\n').collect();
        // -- embedded newlines are escaped by serde, so the pair stays a pair
        assert_eq!(lines.len(), 2);
        let back: IndexDocument = serde_json::from_str(lines[1])?;
        assert_eq!(back, document);
        Ok(())
    }
}
