use std::path::PathBuf;

pub mod config_file;
pub mod inference;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod render;
pub mod schema;
pub mod source;

// Re-export for convenience
pub use inference::ollama::{DEFAULT_KEEP_ALIVE, DEFAULT_MODEL, DEFAULT_NUM_CTX, DEFAULT_OLLAMA_URL};
pub use inference::{InferenceBackend, InferenceError, InferenceRequest};
pub use orchestrator::{
    ExtractionEvent, ExtractionFailure, ExtractionOptions, ExtractionOrchestrator, PagePolicy,
    SynthesisRecord,
};
pub use parser::ParseFailure;
pub use render::{PageImage, PageRenderer, RenderError};
pub use schema::{Condition, Precursor, SynthesisExtraction};

/// A source document, identified by a stable key (DOI, arXiv id or URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paper {
    pub stable_identifier: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
}

impl Paper {
    pub fn new(stable_identifier: impl Into<String>) -> Self {
        Self {
            stable_identifier: stable_identifier.into(),
            title: None,
            authors: Vec::new(),
            abstract_text: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Runtime configuration, assembled from defaults, config files, the
/// environment and CLI flags (in increasing precedence).
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_url: String,
    pub model: String,
    pub num_ctx: u32,
    /// Ollama `keep_alive` sent with each request; -1 keeps the model loaded.
    pub keep_alive: i64,
    /// Spawn `ollama serve` when no server is reachable.
    pub autostart_server: bool,
    pub max_pages: usize,
    pub pages_per_request: usize,
    pub page_policy: PagePolicy,
    pub inference_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Rasterization scale factor (1.0 = 72 dpi).
    pub render_zoom: f32,
    pub db_path: PathBuf,
    pub download_dir: PathBuf,
    pub max_results: usize,
    pub arxiv_api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            num_ctx: DEFAULT_NUM_CTX,
            keep_alive: DEFAULT_KEEP_ALIVE,
            autostart_server: true,
            max_pages: 5,
            pages_per_request: 1,
            page_policy: PagePolicy::FirstValid,
            inference_timeout_secs: 120,
            max_retries: 2,
            retry_delay_secs: 2,
            render_zoom: 1.5,
            db_path: PathBuf::from("data/synthesis.db"),
            download_dir: PathBuf::from("data/downloads"),
            max_results: 3,
            arxiv_api_url: source::ARXIV_API_URL.to_string(),
        }
    }
}
