//! Image compositor interface. Draws translated strings into their regions.
//! Failures here fail the translation task; they are never swallowed.

use bytes::Bytes;
use thiserror::Error;

use crate::ocr::TextRegion;

pub trait ImageCompositor: Send + Sync {
    /// `translations[i]` belongs to `regions[i]`.
    fn compose(
        &self,
        original: &[u8],
        regions: &[TextRegion],
        translations: &[String],
    ) -> Result<Bytes, ComposeError>;
}

#[derive(Debug, Error)]
#[error("compose failed: {0}")]
pub struct ComposeError(pub String);
