// ai
//! 🔄 Transforms: from "what the database knows" to "what the search box wants" 🎭🚀
//!
//! 🎬 COLD OPEN: INT. TRANSLATION BOOTH, 2:47 AM
//!
//! Relational on the left screen. Search-shaped JSON on the right. In between:
//! a merged film work that knows its directors by id and a search index that
//! wants their names as a flat list AND as id/name pairs, because people search
//! by name and link by id. Both are right. Both get what they want.
//!
//! ## Architecture 📐
//!
//! ```text
//!   MergedFilmWork ──▶ IngestTransform ──▶ IndexDocument ──▶ Hit ──▶ EgressTransform ──▶ NDJSON
//!   (relational)       (document.rs)       (search shape)          (elasticsearch.rs)   (_bulk)
//! ```
//!
//! Both transforms are zero-sized marker types with static methods. No vtables.
//! The [`DocumentTransformer`] drives the ingest side over a whole merge result,
//! skipping (and logging) any record that fails validation so one bad rating
//! does not sink the batch. 🦆

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::{Hit, IndexDocument, MergedFilmWork};

pub(crate) mod document;
pub(crate) mod elasticsearch;

pub(crate) use document::FilmWorkDocument;
pub(crate) use elasticsearch::ElasticsearchBulk;

/// 📥 IngestTransform: one merged relational record in, one index document out.
///
/// # Contract 📜
/// - Pure. Same input, same output, every time.
/// - Total over valid input: missing optional fields become empty lists, never nulls.
/// - Invalid input (e.g. a rating that isn't a usable number) is an `Err`,
///   which the caller logs and skips.
pub(crate) trait IngestTransform {
    fn transform_record(merged: &MergedFilmWork) -> Result<IndexDocument>;
}

/// 📤 EgressTransform: a [`Hit`] in, the exact wire text for the sink out.
///
/// For Elasticsearch that's the bulk action line + source line, no trailing newline.
/// The loader assembles the full body.
pub(crate) trait EgressTransform {
    fn transform_hit(hit: &Hit) -> Result<String>;
}

/// 📦 What came out of a transform pass.
#[derive(Debug, Default)]
pub(crate) struct TransformOutput {
    pub(crate) documents: Vec<IndexDocument>,
    /// 💀 Film work ids excluded by validation.
    pub(crate) rejected: Vec<Uuid>,
}

/// 🔄 Runs the ingest transform over every merged record.
#[derive(Debug, Default)]
pub(crate) struct DocumentTransformer;

impl DocumentTransformer {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn transform(&self, merged: &BTreeMap<Uuid, MergedFilmWork>) -> TransformOutput {
        let mut output = TransformOutput::default();
        for (id, record) in merged {
            match FilmWorkDocument::transform_record(record) {
                Ok(document) => output.documents.push(document),
                Err(err) => {
                    warn!(film_work = %id, error = %format!("{err:#}"), "⚠️ excluding a film work that failed document validation");
                    output.rejected.push(*id);
                }
            }
        }
        debug!(documents = output.documents.len(), rejected = output.rejected.len(), "🔄 transform finished");
        output
    }
}
