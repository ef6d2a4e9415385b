//! Rasterisation: render one page to a [`Bitmap`] for OCR.
//!
//! ## Why scale, not DPI?
//!
//! Recipe cards and cookbook scans arrive at every physical size. Rendering
//! at a scale factor (2.0 by default) keeps small print legible for the
//! recognizer, while the backend caps the longest edge
//! ([`MAX_RENDER_EDGE`](crate::pipeline::backend::MAX_RENDER_EDGE)) so a
//! poster-sized page cannot exhaust memory.

use crate::document::{Bitmap, DocumentHandle};
use crate::error::{ExtractionError, Stage};
use std::time::Duration;
use tracing::debug;

/// Render `page_number` at `scale`, bounded by `timeout`.
///
/// Timeout → [`ExtractionError::Timeout`] with [`Stage::Render`]; any
/// backend failure → [`ExtractionError::ExtractionFailed`].
pub async fn rasterize_page(
    handle: &DocumentHandle,
    page_number: usize,
    scale: f32,
    timeout: Duration,
) -> Result<Bitmap, ExtractionError> {
    let bitmap = tokio::time::timeout(timeout, handle.render_page(page_number, scale))
        .await
        .map_err(|_| ExtractionError::timeout(Stage::Render, timeout))?
        .map_err(|e| ExtractionError::ExtractionFailed {
            detail: format!("cannot render page {page_number}: {e}"),
        })?;
    debug!(
        "Rendered page {} → {}x{} px",
        page_number,
        bitmap.width(),
        bitmap.height()
    );
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{OpenedDocument, SourceKind};
    use crate::error::{AdapterError, ErrorKind};
    use async_trait::async_trait;
    use image::{DynamicImage, RgbaImage};

    struct Renderer {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl OpenedDocument for Renderer {
        fn page_count(&self) -> usize {
            1
        }

        async fn page_text(&self, _: usize) -> Result<String, AdapterError> {
            Ok(String::new())
        }

        async fn render_page_to_image(&self, _: usize, scale: f32) -> Result<Bitmap, AdapterError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AdapterError::Failed("bad page tree".into()));
            }
            let side = (10.0 * scale) as u32;
            Ok(Bitmap::new(DynamicImage::ImageRgba8(RgbaImage::new(side, side))))
        }

        fn close(&mut self) {}
    }

    fn handle(delay: Duration, fail: bool) -> DocumentHandle {
        DocumentHandle::new(Box::new(Renderer { delay, fail }), 1, SourceKind::TextDocument)
    }

    #[tokio::test(start_paused = true)]
    async fn renders_at_scale() {
        let bmp = rasterize_page(&handle(Duration::ZERO, false), 1, 2.0, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(bmp.width(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_render_times_out() {
        let err = rasterize_page(&handle(Duration::from_secs(60), false), 1, 2.0, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout { stage: Stage::Render, elapsed_ms: 20_000 }));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_is_extraction_failed() {
        let err = rasterize_page(&handle(Duration::ZERO, true), 1, 2.0, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
        assert!(err.to_string().contains("bad page tree"));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_page_fails() {
        let err = rasterize_page(&handle(Duration::ZERO, false), 2, 1.0, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }
}
