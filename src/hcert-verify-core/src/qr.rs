//! QR code extraction.
//!
//! Grids are tried in the order the detector reports them and the first one
//! that decodes wins. That order depends on the detector's scan and is not
//! a property of the document; frames carrying several codes are therefore
//! not guaranteed to yield the same code across detector versions.

use image::imageops::{self, FilterType};
use image::GrayImage;
use tracing::{debug, instrument};

use crate::error::VerifyError;

/// Frames larger than this (longest side) get a second, downscaled pass.
const DOWNSCALE_THRESHOLD: u32 = 1600;

/// Result of scanning one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrScan {
    /// Payload of the first decodable code.
    pub payload: Vec<u8>,
    /// Number of grids the detector located.
    pub candidates: usize,
}

/// Extract the first decodable QR payload from `frame`.
///
/// # Errors
///
/// Returns `NoQrCodeFound` when no grid decodes.
#[instrument(skip(frame), fields(width = frame.width(), height = frame.height()))]
pub fn extract_payload(frame: &GrayImage) -> Result<QrScan, VerifyError> {
    let (first, candidates) = scan(frame);
    if let Some(payload) = first {
        return Ok(QrScan { payload, candidates });
    }

    let longest = frame.width().max(frame.height());
    if longest > DOWNSCALE_THRESHOLD {
        let factor = f64::from(DOWNSCALE_THRESHOLD) / f64::from(longest);
        let w = ((f64::from(frame.width()) * factor) as u32).max(1);
        let h = ((f64::from(frame.height()) * factor) as u32).max(1);
        let small = imageops::resize(frame, w, h, FilterType::Triangle);
        debug!(w, h, "QR: retrying on downscaled frame");

        let (retry, more) = scan(&small);
        if let Some(payload) = retry {
            return Ok(QrScan {
                payload,
                candidates: candidates + more,
            });
        }
        return Err(VerifyError::NoQrCodeFound {
            candidates: candidates + more,
        });
    }

    Err(VerifyError::NoQrCodeFound { candidates })
}

fn scan(frame: &GrayImage) -> (Option<Vec<u8>>, usize) {
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        frame.width() as usize,
        frame.height() as usize,
        |x, y| frame.get_pixel(x as u32, y as u32)[0],
    );
    let grids = prepared.detect_grids();
    let candidates = grids.len();

    for (index, grid) in grids.iter().enumerate() {
        let mut payload = Vec::new();
        match grid.decode_to(&mut payload) {
            Ok(meta) => {
                debug!(
                    index,
                    candidates,
                    version = meta.version.0,
                    bytes = payload.len(),
                    "QR: decoded"
                );
                if !payload.is_empty() {
                    return (Some(payload), candidates);
                }
            },
            Err(e) => debug!(index, error = %e, "QR: grid did not decode"),
        }
    }
    (None, candidates)
}
