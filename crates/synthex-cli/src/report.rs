//! JSON export of every stored paper with its syntheses.

use std::io::Write;

use serde::Serialize;
use synthex_core::SynthesisExtraction;
use synthex_store::{StoreError, SynthesisStore};

#[derive(Debug, Serialize)]
pub struct PaperReport {
    pub stable_identifier: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub ingested_at: String,
    pub syntheses: Vec<SynthesisExtraction>,
}

/// Collect the whole store, papers oldest first.
pub fn build_report(store: &SynthesisStore) -> Result<Vec<PaperReport>, StoreError> {
    store
        .papers()?
        .into_iter()
        .map(|stored| {
            let syntheses = store
                .load_syntheses(stored.id)?
                .into_iter()
                .map(|s| s.extraction)
                .collect();
            Ok(PaperReport {
                stable_identifier: stored.paper.stable_identifier,
                title: stored.paper.title,
                authors: stored.paper.authors,
                ingested_at: stored.ingested_at,
                syntheses,
            })
        })
        .collect()
}

/// Write the report as a pretty-printed JSON array.
pub fn write_report(w: &mut dyn Write, report: &[PaperReport]) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *w, report)?;
    writeln!(w)?;
    Ok(())
}
