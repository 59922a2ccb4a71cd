// AI
//! 📊 progress.rs: "Did anything happen?" Every pass, every time, forever.
//!
//! 🚀 One [`RunMetrics`] per pipeline pass: how many entities changed, how many
//! film works that dragged along, how many rows came out of Postgres and how
//! many documents made it into the index. Rendered as a comfy-table after every
//! pass, because "loaded=1432 rejected=0" in a log line is data, and a table is
//! a story.
//!
//! ⏰ The number that matters most at 3am is the cursor lag: how far behind
//! "now" the committed cursor is. A healthy service keeps it around one poll
//! interval. A lag that keeps growing means passes keep failing. 🦆

use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};

use crate::common::{ChangeCursor, EntityKind};

/// 🔢 Formats a number with commas. "1000000 docs" → "1,000,000 docs". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if the pass took long enough to warrant a phone call home.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📊 Counters for one pipeline pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    pub genres_changed: u64,
    pub persons_changed: u64,
    pub film_works_changed: u64,
    /// 🔗 Film works pulled in by the entity scans plus the direct pass (may overlap).
    pub film_works_affected: u64,
    pub rows_extracted: u64,
    pub rows_rejected: u64,
    pub records_merged: u64,
    pub documents_rejected: u64,
    pub documents_loaded: u64,
    pub duration: Duration,
    pub cursor_before: Option<ChangeCursor>,
    pub cursor_after: Option<ChangeCursor>,
}

impl RunMetrics {
    pub(crate) fn record_changed(&mut self, kind: EntityKind, count: usize) {
        let count = count as u64;
        match kind {
            EntityKind::Genre => self.genres_changed += count,
            EntityKind::Person => self.persons_changed += count,
            EntityKind::FilmWork => self.film_works_changed += count,
        }
    }

    /// ⏰ How far the committed cursor trails `now`. `None` before any cursor exists.
    pub fn cursor_lag(&self, now: ChangeCursor) -> Option<Duration> {
        let cursor = self.cursor_after.or(self.cursor_before)?;
        Some((now - cursor).to_std().unwrap_or(Duration::ZERO))
    }

    /// 🍽️ The after-pass summary: two columns, right-aligned, no borders.
    pub fn summary_table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        let cursor = |value: Option<ChangeCursor>| value.map_or_else(|| "epoch".to_string(), |c| c.to_rfc3339());
        let rows = [
            ("genres changed", format_number(self.genres_changed)),
            ("persons changed", format_number(self.persons_changed)),
            ("film works changed", format_number(self.film_works_changed)),
            ("film works affected", format_number(self.film_works_affected)),
            ("rows extracted", format_number(self.rows_extracted)),
            ("rows rejected", format_number(self.rows_rejected)),
            ("records merged", format_number(self.records_merged)),
            ("documents rejected", format_number(self.documents_rejected)),
            ("documents loaded", format_number(self.documents_loaded)),
            ("pass duration", format_duration(self.duration)),
            ("cursor before", cursor(self.cursor_before)),
            ("cursor after", cursor(self.cursor_after)),
        ];
        for (label, value) in rows {
            table.add_row(vec![
                Cell::new(label).set_alignment(CellAlignment::Right),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        }
        table
    }
}
