//! Drives one document through prompt → inference → parse, page group by
//! page group, until a valid extraction is found or the window is exhausted.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::inference::{InferenceBackend, InferenceError, InferenceRequest};
use crate::parser::{self, ParseFailure};
use crate::prompt::{self, DocumentContext};
use crate::render::PageImage;
use crate::schema::SynthesisExtraction;
use crate::{Config, Paper};

/// What to do once a page group yields a valid extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagePolicy {
    /// Stop at the first valid extraction; later pages are never sent.
    #[default]
    FirstValid,
    /// Process the whole window and fold later extractions of the same
    /// target material into the first.
    MergeAll,
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Leading pages considered per document.
    pub max_pages: usize,
    /// Page images attached to a single inference request.
    pub pages_per_request: usize,
    pub page_policy: PagePolicy,
    /// Upper bound on a single inference call.
    pub inference_timeout: Duration,
    /// Retries after the first failed inference call.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExtractionOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_pages: config.max_pages,
            pages_per_request: config.pages_per_request.max(1),
            page_policy: config.page_policy,
            inference_timeout: Duration::from_secs(config.inference_timeout_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }
}

/// A validated extraction, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRecord {
    pub document_id: String,
    pub extraction: SynthesisExtraction,
    /// Pages whose responses contributed to `extraction`.
    pub source_pages: Vec<usize>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionFailure {
    #[error("no structured data found in {pages_tried} page(s)")]
    NoValidExtraction {
        pages_tried: usize,
        last_failure: Option<ParseFailure>,
    },
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(#[from] InferenceError),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Progress of a single document, reported to the caller as it happens.
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    /// A page group is being sent to the model.
    Attempt { pages: Vec<usize> },
    /// An inference call failed and will be retried.
    Retrying {
        pages: Vec<usize>,
        attempt: u32,
        error: InferenceError,
    },
    /// The model answered but the answer was unusable.
    Rejected {
        pages: Vec<usize>,
        failure: ParseFailure,
    },
    /// A valid extraction was obtained from these pages.
    Accepted { pages: Vec<usize> },
    /// A later extraction was folded into the accepted one.
    Merged { pages: Vec<usize>, added: usize },
    /// Every page group in the window was tried without success.
    Exhausted { pages_tried: usize },
}

/// Turns page images into at most one [`SynthesisRecord`] per document.
///
/// Has no persistence side effects; the caller decides what to store.
pub struct ExtractionOrchestrator {
    backend: Arc<dyn InferenceBackend>,
    options: ExtractionOptions,
    cancel: CancellationToken,
}

impl ExtractionOrchestrator {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        options: ExtractionOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub async fn extract(
        &self,
        paper: &Paper,
        pages: &[PageImage],
    ) -> Result<SynthesisRecord, ExtractionFailure> {
        self.extract_with_progress(paper, pages, |_| {}).await
    }

    pub async fn extract_with_progress(
        &self,
        paper: &Paper,
        pages: &[PageImage],
        progress: impl Fn(ExtractionEvent),
    ) -> Result<SynthesisRecord, ExtractionFailure> {
        let window = &pages[..pages.len().min(self.options.max_pages)];
        let group_size = self.options.pages_per_request.max(1);

        let mut accepted: Option<(SynthesisExtraction, Vec<usize>)> = None;
        let mut pages_tried = 0;
        let mut last_failure = None;

        for group in window.chunks(group_size) {
            if self.cancel.is_cancelled() {
                return Err(ExtractionFailure::Cancelled);
            }

            let page_numbers: Vec<usize> = group.iter().map(|p| p.page_number).collect();
            pages_tried += group.len();
            tracing::debug!(
                document = %paper.stable_identifier,
                pages = ?page_numbers,
                backend = self.backend.name(),
                "extraction attempt"
            );
            progress(ExtractionEvent::Attempt {
                pages: page_numbers.clone(),
            });

            let request = self.build_request(paper, group, &page_numbers);
            let raw = self.infer_with_retry(&request, &page_numbers, &progress).await?;

            let extraction = match parser::parse(&raw) {
                Ok(extraction) => extraction,
                Err(failure) => {
                    tracing::debug!(
                        document = %paper.stable_identifier,
                        pages = ?page_numbers,
                        reason = %failure,
                        "response rejected"
                    );
                    progress(ExtractionEvent::Rejected {
                        pages: page_numbers,
                        failure: failure.clone(),
                    });
                    last_failure = Some(failure);
                    continue;
                }
            };

            match accepted.as_mut() {
                None => {
                    tracing::info!(
                        document = %paper.stable_identifier,
                        pages = ?page_numbers,
                        target = %extraction.target_material,
                        "extraction accepted"
                    );
                    progress(ExtractionEvent::Accepted {
                        pages: page_numbers.clone(),
                    });
                    accepted = Some((extraction, page_numbers));
                    if self.options.page_policy == PagePolicy::FirstValid {
                        break;
                    }
                }
                Some((base, source_pages)) => {
                    if !base.same_target(&extraction) {
                        tracing::debug!(
                            document = %paper.stable_identifier,
                            pages = ?page_numbers,
                            target = %extraction.target_material,
                            "ignoring extraction for a different target"
                        );
                        continue;
                    }
                    let added = base.absorb(extraction);
                    tracing::debug!(
                        document = %paper.stable_identifier,
                        pages = ?page_numbers,
                        added,
                        "merged extraction"
                    );
                    source_pages.extend(page_numbers.iter().copied());
                    progress(ExtractionEvent::Merged {
                        pages: page_numbers,
                        added,
                    });
                }
            }
        }

        match accepted {
            Some((extraction, source_pages)) => Ok(SynthesisRecord {
                document_id: paper.stable_identifier.clone(),
                extraction,
                source_pages,
            }),
            None => {
                tracing::info!(
                    document = %paper.stable_identifier,
                    pages_tried,
                    "no valid extraction"
                );
                progress(ExtractionEvent::Exhausted { pages_tried });
                Err(ExtractionFailure::NoValidExtraction {
                    pages_tried,
                    last_failure,
                })
            }
        }
    }

    fn build_request(
        &self,
        paper: &Paper,
        group: &[PageImage],
        page_numbers: &[usize],
    ) -> InferenceRequest {
        let prompts = prompt::build(&DocumentContext {
            document_id: &paper.stable_identifier,
            title: paper.title.as_deref(),
            page_numbers,
        });
        InferenceRequest {
            system_prompt: prompts.system,
            user_prompt: prompts.user,
            images: group.iter().map(PageImage::to_base64).collect(),
        }
    }

    /// One inference call with timeout, cancellation and fixed-delay retries.
    async fn infer_with_retry(
        &self,
        request: &InferenceRequest,
        pages: &[usize],
        progress: &impl Fn(ExtractionEvent),
    ) -> Result<String, ExtractionFailure> {
        let timeout = self.options.inference_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ExtractionFailure::Cancelled),
                r = tokio::time::timeout(timeout, self.backend.infer(request)) => r,
            };

            let error = match outcome {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => e,
                Err(_) => InferenceError::Timeout(timeout),
            };

            if attempt > self.options.max_retries {
                tracing::warn!(
                    pages = ?pages,
                    attempts = attempt,
                    error = %error,
                    "inference failed, giving up"
                );
                return Err(ExtractionFailure::InferenceUnavailable(error));
            }

            tracing::warn!(
                pages = ?pages,
                attempt,
                error = %error,
                "inference failed, retrying in {:.1}s",
                self.options.retry_delay.as_secs_f64()
            );
            progress(ExtractionEvent::Retrying {
                pages: pages.to_vec(),
                attempt,
                error,
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ExtractionFailure::Cancelled),
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockInference, MockReply};
    use std::sync::Mutex;

    const VALID: &str = r#"{"target_material": "MOF-5", "method_type": "solvothermal",
        "precursors": ["zinc nitrate", "terephthalic acid"],
        "conditions": [{"parameter_name": "temperature", "value": 120, "unit": "C"}]}"#;

    fn paper() -> Paper {
        Paper::new("arXiv:1234.5678").with_title("MOF-5 synthesis")
    }

    fn pages(n: usize) -> Vec<PageImage> {
        (1..=n).map(|i| PageImage::new(i, vec![i as u8])).collect()
    }

    fn options() -> ExtractionOptions {
        ExtractionOptions {
            max_pages: 5,
            pages_per_request: 1,
            page_policy: PagePolicy::FirstValid,
            inference_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    fn orchestrator(mock: &Arc<MockInference>, options: ExtractionOptions) -> ExtractionOrchestrator {
        ExtractionOrchestrator::new(mock.clone(), options, CancellationToken::new())
    }

    #[tokio::test]
    async fn first_valid_page_wins_and_later_pages_are_not_sent() {
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::text("I could not find any synthesis on this page."),
            MockReply::text(VALID),
            MockReply::text(VALID),
        ]));
        let record = orchestrator(&mock, options())
            .extract(&paper(), &pages(3))
            .await
            .unwrap();

        assert_eq!(record.document_id, "arXiv:1234.5678");
        assert_eq!(record.source_pages, vec![2]);
        assert_eq!(record.extraction.target_material, "MOF-5");
        assert_eq!(record.extraction.precursors.len(), 2);
        assert_eq!(mock.call_count(), 2);

        let requests = mock.requests();
        assert_eq!(requests[1].images, vec![PageImage::new(2, vec![2]).to_base64()]);
        assert!(requests[1].user_prompt.contains("arXiv:1234.5678"));
    }

    #[tokio::test]
    async fn exhausted_window_reports_last_failure() {
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::text(""),
            MockReply::text(r#"{"method_type": "hydrothermal"}"#),
        ]));
        let err = orchestrator(&mock, options())
            .extract(&paper(), &pages(2))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExtractionFailure::NoValidExtraction {
                pages_tried: 2,
                last_failure: Some(ParseFailure::MissingRequiredField("target_material")),
            }
        );
    }

    #[tokio::test]
    async fn window_is_bounded_by_max_pages() {
        let mock = Arc::new(MockInference::new(MockReply::text("no json here")));
        let opts = ExtractionOptions {
            max_pages: 3,
            ..options()
        };
        let err = orchestrator(&mock, opts)
            .extract(&paper(), &pages(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExtractionFailure::NoValidExtraction { pages_tried: 3, .. }
        ));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn no_pages_is_no_valid_extraction() {
        let mock = Arc::new(MockInference::new(MockReply::text(VALID)));
        let err = orchestrator(&mock, options())
            .extract(&paper(), &[])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExtractionFailure::NoValidExtraction {
                pages_tried: 0,
                last_failure: None,
            }
        );
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn pages_are_grouped_per_request() {
        let mock = Arc::new(MockInference::new(MockReply::text("nothing")));
        let opts = ExtractionOptions {
            pages_per_request: 2,
            ..options()
        };
        let _ = orchestrator(&mock, opts).extract(&paper(), &pages(5)).await;

        let sizes: Vec<usize> = mock.requests().iter().map(|r| r.images.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::Error(InferenceError::Unreachable("refused".into())),
            MockReply::text(VALID),
        ]));
        let events = Mutex::new(Vec::new());
        let record = orchestrator(&mock, options())
            .extract_with_progress(&paper(), &pages(1), |e| events.lock().unwrap().push(e))
            .await
            .unwrap();

        assert_eq!(record.source_pages, vec![1]);
        assert_eq!(mock.call_count(), 2);
        let events = events.into_inner().unwrap();
        assert!(matches!(events[1], ExtractionEvent::Retrying { attempt: 1, .. }));
        assert!(matches!(events.last(), Some(ExtractionEvent::Accepted { .. })));
    }

    #[tokio::test]
    async fn persistent_errors_become_inference_unavailable() {
        let mock = Arc::new(MockInference::new(MockReply::Error(InferenceError::Backend {
            status: 500,
            message: "model not loaded".into(),
        })));
        let err = orchestrator(&mock, options())
            .extract(&paper(), &pages(3))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExtractionFailure::InferenceUnavailable(InferenceError::Backend { status: 500, .. })
        ));
        // first attempt plus two retries, then the document is abandoned
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_inference_times_out() {
        let mock = Arc::new(
            MockInference::new(MockReply::text(VALID)).with_delay(Duration::from_secs(600)),
        );
        let opts = ExtractionOptions {
            inference_timeout: Duration::from_secs(30),
            max_retries: 0,
            ..options()
        };
        let err = orchestrator(&mock, opts)
            .extract(&paper(), &pages(1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExtractionFailure::InferenceUnavailable(InferenceError::Timeout(Duration::from_secs(30)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_inference() {
        let mock = Arc::new(
            MockInference::new(MockReply::text(VALID)).with_delay(Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        let orch = ExtractionOrchestrator::new(mock.clone(), options(), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = orch.extract(&paper(), &pages(2)).await.unwrap_err();
        assert_eq!(err, ExtractionFailure::Cancelled);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn merge_all_folds_same_target_entries() {
        let later = r#"{"target_material": "mof-5", "method_type": "solvothermal",
            "precursors": ["Zinc nitrate", "DMF"],
            "conditions": [{"parameter_name": "time", "value": "24", "unit": "h"}]}"#;
        let other = r#"{"target_material": "ZIF-8", "method_type": "solvothermal",
            "precursors": ["2-methylimidazole"]}"#;
        let mock = Arc::new(MockInference::with_sequence(vec![
            MockReply::text(VALID),
            MockReply::text(other),
            MockReply::text(later),
        ]));
        let opts = ExtractionOptions {
            page_policy: PagePolicy::MergeAll,
            ..options()
        };
        let record = orchestrator(&mock, opts)
            .extract(&paper(), &pages(3))
            .await
            .unwrap();

        assert_eq!(mock.call_count(), 3);
        assert_eq!(record.source_pages, vec![1, 3]);
        assert_eq!(record.extraction.target_material, "MOF-5");
        let names: Vec<&str> = record
            .extraction
            .precursors
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["zinc nitrate", "terephthalic acid", "DMF"]);
        assert_eq!(record.extraction.conditions.len(), 2);
    }
}
