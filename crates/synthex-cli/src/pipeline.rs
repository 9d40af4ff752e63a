//! Sequential batch driver: render → extract → persist, one document at a
//! time. Every per-document error becomes a [`DocumentOutcome`]; nothing
//! here aborts the batch.

use synthex_core::{
    ExtractionEvent, ExtractionFailure, ExtractionOrchestrator, PageImage, PageRenderer, Paper,
};
use synthex_store::{PaperId, SynthesisStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    Stored {
        document_id: String,
        target_material: String,
        precursors: usize,
        conditions: usize,
        source_pages: Vec<usize>,
        /// True if earlier syntheses for this paper were replaced.
        replaced: bool,
    },
    AlreadyPresent {
        document_id: String,
    },
    NoStructuredData {
        document_id: String,
        pages_tried: usize,
    },
    Failed {
        document_id: String,
        reason: String,
    },
    Cancelled {
        document_id: String,
    },
}

impl DocumentOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            DocumentOutcome::Stored { document_id, .. }
            | DocumentOutcome::AlreadyPresent { document_id }
            | DocumentOutcome::NoStructuredData { document_id, .. }
            | DocumentOutcome::Failed { document_id, .. }
            | DocumentOutcome::Cancelled { document_id } => document_id,
        }
    }

    pub fn failed(paper: &Paper, reason: impl std::fmt::Display) -> Self {
        DocumentOutcome::Failed {
            document_id: paper.stable_identifier.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Tally of outcomes over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub stored: usize,
    pub already_present: usize,
    pub no_data: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Stored { .. } => self.stored += 1,
            DocumentOutcome::AlreadyPresent { .. } => self.already_present += 1,
            DocumentOutcome::NoStructuredData { .. } => self.no_data += 1,
            DocumentOutcome::Failed { .. } => self.failed += 1,
            DocumentOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.stored + self.already_present + self.no_data + self.failed + self.cancelled
    }
}

pub struct Pipeline<'a> {
    renderer: &'a dyn PageRenderer,
    orchestrator: &'a ExtractionOrchestrator,
    store: &'a SynthesisStore,
    /// Re-extract documents that already have syntheses and replace them.
    force: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        renderer: &'a dyn PageRenderer,
        orchestrator: &'a ExtractionOrchestrator,
        store: &'a SynthesisStore,
        force: bool,
    ) -> Self {
        Self {
            renderer,
            orchestrator,
            store,
            force,
        }
    }

    /// Render the PDF and run it through extraction and persistence.
    pub async fn process(
        &self,
        paper: &Paper,
        pdf: &[u8],
        progress: impl Fn(ExtractionEvent),
    ) -> DocumentOutcome {
        let existing = match self.existing_paper(paper) {
            Ok(Existing::Skip) => return already_present(paper),
            Ok(Existing::Replace(id, count)) => Some((id, count)),
            Ok(Existing::None) => None,
            Err(outcome) => return outcome,
        };

        let max_pages = self.orchestrator.options().max_pages;
        let pages = match self.renderer.render(pdf, max_pages) {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(document = %paper.stable_identifier, error = %e, "render failed");
                return DocumentOutcome::failed(paper, e);
            }
        };

        self.extract_and_store(paper, &pages, existing, progress).await
    }

    fn existing_paper(&self, paper: &Paper) -> Result<Existing, DocumentOutcome> {
        let stored = self
            .store
            .find_paper(&paper.stable_identifier)
            .map_err(|e| DocumentOutcome::failed(paper, e))?;
        let Some(stored) = stored else {
            return Ok(Existing::None);
        };
        let count = self
            .store
            .synthesis_count_for(stored.id)
            .map_err(|e| DocumentOutcome::failed(paper, e))?;

        Ok(match (count, self.force) {
            (0, _) | (_, true) => Existing::Replace(stored.id, count),
            (_, false) => {
                tracing::info!(document = %paper.stable_identifier, "already present, skipping");
                Existing::Skip
            }
        })
    }

    async fn extract_and_store(
        &self,
        paper: &Paper,
        pages: &[PageImage],
        existing: Option<(PaperId, usize)>,
        progress: impl Fn(ExtractionEvent),
    ) -> DocumentOutcome {
        let document_id = paper.stable_identifier.clone();

        let record = match self
            .orchestrator
            .extract_with_progress(paper, pages, progress)
            .await
        {
            Ok(record) => record,
            Err(ExtractionFailure::NoValidExtraction { pages_tried, .. }) => {
                return DocumentOutcome::NoStructuredData {
                    document_id,
                    pages_tried,
                };
            }
            Err(ExtractionFailure::Cancelled) => {
                return DocumentOutcome::Cancelled { document_id };
            }
            Err(e @ ExtractionFailure::InferenceUnavailable(_)) => {
                tracing::warn!(document = %document_id, error = %e, "inference failed");
                return DocumentOutcome::failed(paper, e);
            }
        };

        let extraction = &record.extraction;
        let stored = match existing {
            Some((paper_id, _)) => self.store.replace_syntheses(paper_id, extraction).map(|_| ()),
            None => self.store.persist(paper, extraction).map(|_| ()),
        };
        if let Err(e) = stored {
            tracing::warn!(document = %document_id, error = %e, "persist failed");
            return DocumentOutcome::failed(paper, e);
        }

        DocumentOutcome::Stored {
            document_id,
            target_material: extraction.target_material.clone(),
            precursors: extraction.precursors.len(),
            conditions: extraction.conditions.len(),
            source_pages: record.source_pages,
            replaced: existing.is_some_and(|(_, count)| count > 0),
        }
    }
}

enum Existing {
    None,
    Skip,
    /// Paper row exists with this many syntheses; they are replaced.
    Replace(PaperId, usize),
}

fn already_present(paper: &Paper) -> DocumentOutcome {
    DocumentOutcome::AlreadyPresent {
        document_id: paper.stable_identifier.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use synthex_core::inference::mock::{MockInference, MockReply};
    use synthex_core::{ExtractionOptions, InferenceError, PagePolicy, RenderError};
    use synthex_store::StoreCounts;
    use tokio_util::sync::CancellationToken;

    const MOF5: &str = r#"{"target_material": "MOF-5", "method_type": "solvothermal",
        "precursors": [{"name": "zinc nitrate", "role": "metal source"}, {"name": "terephthalic acid", "role": "linker"}],
        "conditions": [{"parameter_name": "temperature", "value": "120", "unit": "C"}]}"#;

    /// Produces `pages` blank page images for any input.
    struct BlankRenderer {
        pages: usize,
    }

    impl PageRenderer for BlankRenderer {
        fn render(&self, _pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, RenderError> {
            Ok((1..=self.pages.min(max_pages))
                .map(|n| PageImage::new(n, vec![0u8; 4]))
                .collect())
        }
    }

    struct BrokenRenderer;

    impl PageRenderer for BrokenRenderer {
        fn render(&self, _pdf: &[u8], _max_pages: usize) -> Result<Vec<PageImage>, RenderError> {
            Err(RenderError::OpenError("not a PDF".into()))
        }
    }

    fn orchestrator(mock: &Arc<MockInference>) -> ExtractionOrchestrator {
        let options = ExtractionOptions {
            max_pages: 5,
            pages_per_request: 1,
            page_policy: PagePolicy::FirstValid,
            inference_timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        };
        ExtractionOrchestrator::new(mock.clone(), options, CancellationToken::new())
    }

    #[tokio::test]
    async fn arxiv_document_is_persisted_end_to_end() {
        let mock = Arc::new(MockInference::new(MockReply::text(MOF5)));
        let orch = orchestrator(&mock);
        let store = SynthesisStore::open_in_memory().unwrap();
        let renderer = BlankRenderer { pages: 3 };
        let pipeline = Pipeline::new(&renderer, &orch, &store, false);

        let paper = Paper::new("arXiv:1234.5678").with_title("MOF-5");
        let outcome = pipeline.process(&paper, b"%PDF-1.7", |_| {}).await;

        assert_eq!(
            outcome,
            DocumentOutcome::Stored {
                document_id: "arXiv:1234.5678".into(),
                target_material: "MOF-5".into(),
                precursors: 2,
                conditions: 1,
                source_pages: vec![1],
                replaced: false,
            }
        );
        assert_eq!(
            store.counts().unwrap(),
            StoreCounts {
                papers: 1,
                syntheses: 1,
                precursors: 2,
                conditions: 1,
            }
        );
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn second_run_skips_without_inference() {
        let mock = Arc::new(MockInference::new(MockReply::text(MOF5)));
        let orch = orchestrator(&mock);
        let store = SynthesisStore::open_in_memory().unwrap();
        let renderer = BlankRenderer { pages: 2 };
        let pipeline = Pipeline::new(&renderer, &orch, &store, false);
        let paper = Paper::new("arXiv:1234.5678");

        pipeline.process(&paper, b"%PDF", |_| {}).await;
        let outcome = pipeline.process(&paper, b"%PDF", |_| {}).await;

        assert!(matches!(outcome, DocumentOutcome::AlreadyPresent { .. }));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(store.counts().unwrap().syntheses, 1);
    }

    #[tokio::test]
    async fn force_replaces_existing_synthesis() {
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::text(MOF5),
            MockReply::text(r#"{"target_material": "MOF-5", "method_type": "microwave"}"#),
        ]));
        let orch = orchestrator(&mock);
        let store = SynthesisStore::open_in_memory().unwrap();
        let renderer = BlankRenderer { pages: 1 };
        let paper = Paper::new("arXiv:1234.5678");

        Pipeline::new(&renderer, &orch, &store, false)
            .process(&paper, b"%PDF", |_| {})
            .await;
        let outcome = Pipeline::new(&renderer, &orch, &store, true)
            .process(&paper, b"%PDF", |_| {})
            .await;

        assert!(matches!(outcome, DocumentOutcome::Stored { replaced: true, .. }));
        let counts = store.counts().unwrap();
        assert_eq!((counts.papers, counts.syntheses, counts.precursors), (1, 1, 0));
    }

    #[tokio::test]
    async fn failures_do_not_halt_the_batch() {
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::text("nothing useful"),
            MockReply::Error(InferenceError::Unreachable("connection reset".into())),
            MockReply::text(MOF5),
        ]));
        let orch = orchestrator(&mock);
        let store = SynthesisStore::open_in_memory().unwrap();
        let renderer = BlankRenderer { pages: 1 };
        let broken = BrokenRenderer;

        let docs = ["file://a.pdf", "file://b.pdf", "file://c.pdf", "file://d.pdf"];
        let mut summary = BatchSummary::default();
        for (i, id) in docs.iter().enumerate() {
            let pipeline = if i == 2 {
                Pipeline::new(&broken, &orch, &store, false)
            } else {
                Pipeline::new(&renderer, &orch, &store, false)
            };
            let outcome = pipeline.process(&Paper::new(*id), b"%PDF", |_| {}).await;
            summary.record(&outcome);
        }

        assert_eq!(
            summary,
            BatchSummary {
                stored: 1,
                already_present: 0,
                no_data: 1,
                failed: 2,
                cancelled: 0,
            }
        );
        assert_eq!(summary.total(), 4);
        let stored = store.find_paper("file://d.pdf").unwrap().unwrap();
        assert_eq!(store.synthesis_count_for(stored.id).unwrap(), 1);
        assert!(store.find_paper("file://a.pdf").unwrap().is_none());
    }

    #[tokio::test]
    async fn process_reports_events() {
        let mock = Arc::new(MockInference::new(MockReply::text(MOF5)));
        let orch = orchestrator(&mock);
        let store = SynthesisStore::open_in_memory().unwrap();
        let renderer = BlankRenderer { pages: 2 };
        let pipeline = Pipeline::new(&renderer, &orch, &store, false);

        let events = std::sync::Mutex::new(Vec::new());
        let outcome = pipeline
            .process(&Paper::new("doi:10.1000/mof"), b"%PDF", |e| {
                events.lock().unwrap().push(e)
            })
            .await;

        assert_eq!(outcome.document_id(), "doi:10.1000/mof");
        let events = events.into_inner().unwrap();
        assert!(matches!(events[0], ExtractionEvent::Attempt { .. }));
        assert!(matches!(events[1], ExtractionEvent::Accepted { .. }));
    }
}
