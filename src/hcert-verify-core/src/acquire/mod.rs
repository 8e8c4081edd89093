//! Image acquisition.
//!
//! Normalizes an uploaded document into one greyscale frame for the QR
//! extractor. Raster formats are decoded directly; PDF documents have their
//! first page rendered (see [`pdf`]).

pub mod pdf;

use std::path::Path;

use image::GrayImage;
use tracing::{debug, instrument};

use crate::error::VerifyError;

/// Leading bytes of every PDF file.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// How a document is turned into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Decoded with the `image` crate.
    Raster,
    /// First page rendered.
    Pdf,
}

impl DocumentKind {
    /// Pick the decoding path from the filename hint.
    ///
    /// A `.pdf` extension (any case) selects the PDF path; without an
    /// extension the bytes are sniffed for the PDF header.
    #[must_use]
    pub fn detect(bytes: &[u8], filename_hint: &str) -> Self {
        match Path::new(filename_hint).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pdf") => Self::Pdf,
            Some(_) => Self::Raster,
            None if bytes.starts_with(PDF_MAGIC) => Self::Pdf,
            None => Self::Raster,
        }
    }
}

/// Decode `bytes` into a single greyscale frame.
///
/// # Errors
///
/// Returns `UnsupportedInput` if the selected path cannot produce a frame.
#[instrument(skip(bytes), fields(len = bytes.len()))]
pub fn acquire_frame(bytes: &[u8], filename_hint: &str) -> Result<GrayImage, VerifyError> {
    let unsupported = |reason: String| VerifyError::UnsupportedInput {
        hint: filename_hint.to_string(),
        reason,
    };

    if bytes.is_empty() {
        return Err(unsupported("empty document".into()));
    }

    let kind = DocumentKind::detect(bytes, filename_hint);
    let frame = match kind {
        DocumentKind::Raster => image::load_from_memory(bytes)
            .map(|img| img.to_luma8())
            .map_err(|e| unsupported(format!("image decode failed: {}", e)))?,
        DocumentKind::Pdf => pdf::render_first_page(bytes).map_err(unsupported)?,
    };

    debug!(
        ?kind,
        width = frame.width(),
        height = frame.height(),
        "Acquire: frame ready"
    );
    Ok(frame)
}
