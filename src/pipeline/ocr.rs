//! OCR fallback: rasterise a page, recognise it, validate the result.
//!
//! ## When does OCR run?
//!
//! * the text-layer path failed on every page,
//! * the text layer produced fewer than `min_usable_chars` characters
//!   (typical for scanned cookbooks), or
//! * the source is a photo, which has no text layer at all.
//!
//! ## Why a service instead of a global engine?
//!
//! Recognition engines are expensive to start (model handles, HTTP pools),
//! so one instance is shared by every extraction. [`OcrService`] makes that
//! lifecycle explicit: the engine is created lazily on first use,
//! concurrent first users wait on the same initialisation, and
//! [`OcrService::shutdown`] waits for in-flight recognitions before
//! terminating the engine. A later call simply initialises it again.

use crate::config::ExtractionOptions;
use crate::document::{Bitmap, DocumentHandle};
use crate::error::{AdapterError, ExtractionError, Stage};
use crate::pipeline::normalize::normalize;
use crate::pipeline::render::rasterize_page;
use crate::progress::ProgressAggregator;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Parameters for one recognition call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionOptions {
    /// Only these characters (plus whitespace) may appear in the output.
    pub char_allowlist: String,
}

/// Text returned by a [`TextRecognizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    pub text: String,
    /// Engine-reported or heuristic confidence in `0.0..=1.0`.
    pub confidence: f32,
}

/// An OCR engine.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize_text(
        &self,
        bitmap: &Bitmap,
        options: &RecognitionOptions,
    ) -> Result<RecognizedText, AdapterError>;

    /// Release engine resources. Called once by [`OcrService::shutdown`].
    async fn terminate(&self) {}
}

type InitFuture = BoxFuture<'static, Result<Arc<dyn TextRecognizer>, AdapterError>>;
type InitFn = Box<dyn Fn() -> InitFuture + Send + Sync>;

/// Lazily-initialised, shareable OCR engine.
pub struct OcrService {
    init: InitFn,
    engine: RwLock<Option<Arc<dyn TextRecognizer>>>,
    inits: AtomicUsize,
}

impl std::fmt::Debug for OcrService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrService")
            .field("inits", &self.init_count())
            .finish_non_exhaustive()
    }
}

impl OcrService {
    /// A service whose engine is produced by `init` on first use.
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn TextRecognizer>, AdapterError>> + Send + 'static,
    {
        Self {
            init: Box::new(move || -> InitFuture { Box::pin(init()) }),
            engine: RwLock::new(None),
            inits: AtomicUsize::new(0),
        }
    }

    /// A service around an already-built engine.
    pub fn with_recognizer(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self::new(move || {
            let recognizer = Arc::clone(&recognizer);
            async move { Ok(recognizer) }
        })
    }

    /// How many times the engine has been initialised.
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.read().await.is_some()
    }

    /// Recognise `bitmap`, initialising the engine if needed.
    ///
    /// The engine is held under a shared guard for the whole call, so
    /// [`shutdown`](Self::shutdown) waits for it to finish.
    pub async fn recognize(
        &self,
        bitmap: &Bitmap,
        options: &RecognitionOptions,
    ) -> Result<RecognizedText, AdapterError> {
        loop {
            {
                let guard = self.engine.read().await;
                if let Some(engine) = guard.as_ref() {
                    return engine.recognize_text(bitmap, options).await;
                }
            }

            let mut guard = self.engine.write().await;
            if guard.is_none() {
                let engine = (self.init)().await?;
                let n = self.inits.fetch_add(1, Ordering::SeqCst) + 1;
                info!("OCR engine initialised (#{n})");
                *guard = Some(engine);
            }
        }
    }

    /// Terminate the engine after in-flight recognitions finish.
    pub async fn shutdown(&self) {
        let mut guard = self.engine.write().await;
        if let Some(engine) = guard.take() {
            engine.terminate().await;
            info!("OCR engine terminated");
        }
    }

    /// Process-wide service backed by the environment-configured
    /// [`VisionRecognizer`](crate::pipeline::vision::VisionRecognizer).
    pub fn global() -> &'static OcrService {
        static GLOBAL: OnceLock<OcrService> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            OcrService::new(|| async {
                let recognizer = crate::pipeline::vision::VisionRecognizer::from_env()?;
                Ok::<_, AdapterError>(Arc::new(recognizer) as Arc<dyn TextRecognizer>)
            })
        })
    }

    /// Shut down the process-wide service.
    pub async fn shutdown_global() {
        Self::global().shutdown().await;
    }
}

// ── Fallback ─────────────────────────────────────────────────────────────────

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, ExtractionError>>,
) -> Result<T, ExtractionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
        r = work => r,
    }
}

/// Rasterise `ocr_page`, recognise it, validate and normalise the text.
///
/// Progress on `task` moves through render → recognise → validate and is
/// completed on success.
pub async fn run_ocr_fallback(
    handle: &DocumentHandle,
    service: &OcrService,
    options: &ExtractionOptions,
    cancel: &CancellationToken,
    progress: &ProgressAggregator,
    task: &str,
) -> Result<String, ExtractionError> {
    if cancel.is_cancelled() {
        return Err(ExtractionError::Cancelled);
    }

    let page = options.ocr_page.clamp(1, handle.page_count().max(1));
    info!("Running OCR on page {}", page);
    let bitmap = until_cancelled(
        cancel,
        rasterize_page(handle, page, options.render_scale, options.render_timeout()),
    )
    .await?;
    progress.update_task(task, 30.0);

    if cancel.is_cancelled() {
        return Err(ExtractionError::Cancelled);
    }

    let recognition = RecognitionOptions {
        char_allowlist: options.ocr_char_allowlist.clone(),
    };
    let recognized = until_cancelled(cancel, async {
        tokio::time::timeout(options.ocr_timeout(), service.recognize(&bitmap, &recognition))
            .await
            .map_err(|_| ExtractionError::timeout(Stage::Recognize, options.ocr_timeout()))?
            .map_err(AdapterError::into_ocr_error)
    })
    .await?;
    progress.update_task(task, 90.0);

    let chars = recognized.text.trim().chars().count();
    debug!(chars, confidence = recognized.confidence, "OCR text received");
    if chars < options.min_usable_chars {
        return Err(ExtractionError::InsufficientOcrText {
            chars,
            min: options.min_usable_chars,
        });
    }

    let text = normalize(&recognized.text);
    progress.complete_task(task);
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{OpenedDocument, SourceKind};
    use crate::error::ErrorKind;
    use image::{DynamicImage, RgbaImage};
    use std::time::Duration;

    struct Fixed {
        text: String,
        calls: AtomicUsize,
        terminated: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Fixed {
        fn new(text: &str) -> Self {
            Self {
                text: text.into(),
                calls: AtomicUsize::new(0),
                terminated: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TextRecognizer for Fixed {
        async fn recognize_text(
            &self,
            _bitmap: &Bitmap,
            _options: &RecognitionOptions,
        ) -> Result<RecognizedText, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(RecognizedText {
                text: self.text.clone(),
                confidence: 0.9,
            })
        }

        async fn terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Page;

    #[async_trait]
    impl OpenedDocument for Page {
        fn page_count(&self) -> usize {
            2
        }
        async fn page_text(&self, _: usize) -> Result<String, AdapterError> {
            Ok(String::new())
        }
        async fn render_page_to_image(&self, _: usize, _: f32) -> Result<Bitmap, AdapterError> {
            Ok(Bitmap::new(DynamicImage::ImageRgba8(RgbaImage::new(4, 4))))
        }
        fn close(&mut self) {}
    }

    fn bitmap() -> Bitmap {
        Bitmap::new(DynamicImage::ImageRgba8(RgbaImage::new(1, 1)))
    }

    fn recognition() -> RecognitionOptions {
        RecognitionOptions {
            char_allowlist: "abc".into(),
        }
    }

    fn handle() -> DocumentHandle {
        DocumentHandle::new(Box::new(Page), 1, SourceKind::TextDocument)
    }

    fn progress() -> ProgressAggregator {
        let p = ProgressAggregator::new(None, Duration::ZERO);
        p.register_task("ocr", 1.0);
        p
    }

    #[tokio::test]
    async fn concurrent_first_use_initialises_once() {
        let service = Arc::new(OcrService::new(|| async {
            tokio::task::yield_now().await;
            Ok::<_, AdapterError>(Arc::new(Fixed::new("ok")) as Arc<dyn TextRecognizer>)
        }));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                s.recognize(&bitmap(), &recognition()).await.map(|r| r.text)
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), "ok");
        }
        assert_eq!(service.init_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_terminates_and_allows_reinit() {
        let engine = Arc::new(Fixed::new("ok"));
        let terminated = Arc::clone(&engine.terminated);
        let service = OcrService::with_recognizer(engine);

        service.recognize(&bitmap(), &recognition()).await.unwrap();
        assert!(service.is_initialized().await);
        service.shutdown().await;
        assert!(!service.is_initialized().await);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);

        service.shutdown().await;
        assert_eq!(terminated.load(Ordering::SeqCst), 1);

        service.recognize(&bitmap(), &recognition()).await.unwrap();
        assert_eq!(service.init_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_inflight_recognition() {
        let mut engine = Fixed::new("ok");
        engine.delay = Duration::from_secs(5);
        let terminated = Arc::clone(&engine.terminated);
        let service = Arc::new(OcrService::with_recognizer(Arc::new(engine)));
        let start = tokio::time::Instant::now();

        let s = Arc::clone(&service);
        let inflight = tokio::spawn(async move { s.recognize(&bitmap(), &recognition()).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        service.shutdown().await;
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(inflight.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn init_failure_propagates_and_retries_next_time() {
        let service = OcrService::new(|| async {
            Err::<Arc<dyn TextRecognizer>, _>(AdapterError::Unavailable("no key".into()))
        });
        let err = service.recognize(&bitmap(), &recognition()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
        assert_eq!(service.init_count(), 0);
        assert!(!service.is_initialized().await);
    }

    #[tokio::test]
    async fn fallback_normalises_recognised_text() {
        let service = OcrService::with_recognizer(Arc::new(Fixed::new(
            "INGREDIENTS\n2 cups flour\nl/2 tsp salt",
        )));
        let p = progress();
        let text = run_ocr_fallback(
            &handle(),
            &service,
            &ExtractionOptions::default(),
            &CancellationToken::new(),
            &p,
            "ocr",
        )
        .await
        .unwrap();
        assert_eq!(text, "Ingredients:\n2 cups flour\n1/2 tsp salt");
        assert_eq!(p.current(), 100);
    }

    #[tokio::test]
    async fn fallback_rejects_short_text() {
        let service = OcrService::with_recognizer(Arc::new(Fixed::new("  salt  ")));
        let err = run_ocr_fallback(
            &handle(),
            &service,
            &ExtractionOptions::default(),
            &CancellationToken::new(),
            &progress(),
            "ocr",
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::InsufficientOcrText { chars: 4, min: 20 }
        ));
    }

    #[tokio::test]
    async fn fallback_honours_cancellation_before_render() {
        let engine = Arc::new(Fixed::new("plenty of recognised recipe text"));
        let service = OcrService::with_recognizer(engine.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_ocr_fallback(
            &handle(),
            &service,
            &ExtractionOptions::default(),
            &cancel,
            &progress(),
            "ocr",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_recognition_times_out() {
        let mut engine = Fixed::new("plenty of recognised recipe text");
        engine.delay = Duration::from_secs(600);
        let service = OcrService::with_recognizer(Arc::new(engine));
        let err = run_ocr_fallback(
            &handle(),
            &service,
            &ExtractionOptions::default(),
            &CancellationToken::new(),
            &progress(),
            "ocr",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout { stage: Stage::Recognize, .. }));
    }

    #[tokio::test]
    async fn ocr_page_is_clamped_to_document() {
        let service = OcrService::with_recognizer(Arc::new(Fixed::new(
            "plenty of recognised recipe text",
        )));
        let options = ExtractionOptions::builder().ocr_page(9).build().unwrap();
        let text = run_ocr_fallback(
            &handle(),
            &service,
            &options,
            &CancellationToken::new(),
            &progress(),
            "ocr",
        )
        .await
        .unwrap();
        assert_eq!(text, "plenty of recognised recipe text");
    }
}
