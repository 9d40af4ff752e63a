use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to open PDF: {0}")]
    OpenError(String),
    #[error("failed to render page {page}: {message}")]
    PageError { page: usize, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One rasterized page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page number within the source document.
    pub page_number: usize,
    /// PNG-encoded image data.
    pub png: Vec<u8>,
}

impl PageImage {
    pub fn new(page_number: usize, png: Vec<u8>) -> Self {
        Self { page_number, png }
    }

    /// Standard base64 encoding of the image, as inference backends expect.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }
}

/// Trait for PDF rasterization backends.
///
/// Implementors turn document bytes into page images, in reading order,
/// stopping after `max_pages` pages.
pub trait PageRenderer: Send + Sync {
    fn render(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_uses_standard_alphabet_with_padding() {
        let page = PageImage::new(1, b"hello".to_vec());
        assert_eq!(page.to_base64(), "aGVsbG8=");
    }
}
