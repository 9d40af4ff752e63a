//! Inference capability boundary: `infer(system, user, images) -> text`.

pub mod mock;
pub mod ollama;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

/// Errors from the inference backend itself, as opposed to problems with
/// what it returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference backend unreachable: {0}")]
    Unreachable(String),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("malformed backend response: {0}")]
    InvalidResponse(String),
    #[error("failed to start inference server: {0}")]
    Startup(String),
}

/// One synchronous request/response exchange with a multimodal model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Base64-encoded page images, in page order.
    pub images: Vec<String>,
}

/// A multimodal model that turns instructions plus images into text.
///
/// Implementations make no promise about the shape of the returned text;
/// callers run it through [`crate::parser::parse`].
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs (e.g. "ollama:llava").
    fn name(&self) -> &str;

    fn infer<'a>(
        &'a self,
        request: &'a InferenceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>>;
}
