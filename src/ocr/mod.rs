//! OCR collaborator interface.
//! The extractor itself is external; the pipeline only consumes detected
//! text regions and treats extractor failures as "nothing to translate".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One detected speech bubble / caption on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    /// x, y, w, h in page pixels.
    pub bbox: (u32, u32, u32, u32),
    pub text: String,
    pub confidence: f32,
}

impl TextRegion {
    pub fn new(bbox: (u32, u32, u32, u32), text: impl Into<String>) -> Self {
        Self {
            bbox,
            text: text.into(),
            confidence: 1.0,
        }
    }
}

/// Text extractor adapter. Implementations are blocking and get called from
/// `spawn_blocking`.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, page_image: &[u8]) -> Result<Vec<TextRegion>, OcrError>;
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine not running")]
    EngineNotRunning,
    #[error("OCR processing failed: {0}")]
    ProcessingFailed(String),
    #[error("OCR timeout")]
    Timeout,
}

/// Extractor that never finds text. Useful when OCR is unavailable: every page
/// then resolves to its original image.
pub struct NoTextExtractor;

impl TextExtractor for NoTextExtractor {
    fn extract(&self, _page_image: &[u8]) -> Result<Vec<TextRegion>, OcrError> {
        Ok(Vec::new())
    }
}
