use mupdf::{Colorspace, Document, ImageFormat, Matrix};

use synthex_core::{PageImage, PageRenderer, RenderError};

/// MuPDF-based implementation of [`PageRenderer`].
///
/// This crate is the sole AGPL island: it isolates the mupdf dependency
/// (which is AGPL-3.0) so that the rest of the workspace does not
/// transitively depend on it.
pub struct MupdfRenderer {
    /// Scale factor applied to the 72 dpi page box.
    zoom: f32,
}

impl Default for MupdfRenderer {
    fn default() -> Self {
        Self { zoom: 1.5 }
    }
}

impl MupdfRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the render scale. Non-positive values fall back to 1.0.
    pub fn with_zoom(mut self, zoom: f32) -> Self {
        self.zoom = if zoom > 0.0 { zoom } else { 1.0 };
        self
    }
}

impl PageRenderer for MupdfRenderer {
    fn render(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, RenderError> {
        let document =
            Document::from_bytes(pdf, "pdf").map_err(|e| RenderError::OpenError(e.to_string()))?;

        let matrix = Matrix::new_scale(self.zoom, self.zoom);
        let colorspace = Colorspace::device_rgb();
        let mut images = Vec::new();

        let pages = document
            .pages()
            .map_err(|e| RenderError::OpenError(e.to_string()))?;

        for (index, page_result) in pages.take(max_pages).enumerate() {
            let page_number = index + 1;
            let page_error = |e: mupdf::Error| RenderError::PageError {
                page: page_number,
                message: e.to_string(),
            };

            let page = page_result.map_err(page_error)?;
            let pixmap = page
                .to_pixmap(&matrix, &colorspace, false, false)
                .map_err(page_error)?;

            let mut png = Vec::new();
            pixmap
                .write_to(&mut png, ImageFormat::PNG)
                .map_err(page_error)?;

            images.push(PageImage::new(page_number, png));
        }

        tracing::debug!(pages = images.len(), zoom = self.zoom, "rendered PDF pages");
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_fail_to_open() {
        let result = MupdfRenderer::new().render(b"definitely not a pdf", 5);
        assert!(matches!(result, Err(RenderError::OpenError(_))));
    }

    #[test]
    fn zoom_is_clamped() {
        assert_eq!(MupdfRenderer::new().with_zoom(-2.0).zoom, 1.0);
        assert_eq!(MupdfRenderer::new().with_zoom(2.0).zoom, 2.0);
    }
}
