//! Decoder capability and preview encoding
//!
//! The scheduler never talks to a document engine directly. A [`Backend`]
//! opens documents from bytes; the opened [`DocumentHandle`] hands out
//! [`PageHandle`]s which rasterize into a [`Surface`]. Handles are created and
//! used on the scheduler's worker thread only, so they need not be `Send`.

use std::io::Cursor;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use super::request::RenderFault;
use super::types::{PageSize, Surface};

pub trait Backend: Send + 'static {
    type Document: DocumentHandle;

    /// Parse a document. This is the expensive step the handle pool amortizes.
    fn open(&self, bytes: &[u8]) -> Result<Self::Document, RenderFault>;
}

pub trait DocumentHandle {
    type Page<'a>: PageHandle
    where
        Self: 'a;

    fn page_count(&self) -> Result<u32, RenderFault>;

    /// Load a page by its 1-based number
    fn load_page(&self, page: u32) -> Result<Self::Page<'_>, RenderFault>;
}

/// A loaded page. Page-level resources are released on drop.
pub trait PageHandle {
    fn size(&self) -> Result<PageSize, RenderFault>;

    /// Rasterize the page into `surface`, whose dimensions were derived from
    /// [`PageSize::viewport`] at `scale`.
    fn rasterize(&self, surface: &mut Surface, scale: f32) -> Result<(), RenderFault>;
}

/// MIME prefix of every encoded preview
pub const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Encode an RGB surface as a JPEG `data:` URI.
///
/// `quality` is clamped to 1..=100.
pub fn encode_jpeg_data_uri(surface: &Surface, quality: u8) -> Result<String, RenderFault> {
    let expected = surface.width as usize * surface.height as usize * 3;
    if surface.pixels.len() != expected {
        return Err(RenderFault::generic(format!(
            "surface buffer size mismatch: {} bytes for {}x{}",
            surface.pixels.len(),
            surface.width,
            surface.height
        )));
    }

    let mut jpeg = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).write_image(
        &surface.pixels,
        surface.width,
        surface.height,
        ExtendedColorType::Rgb8,
    )?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg.get_ref());
    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + encoded.len());
    uri.push_str(DATA_URI_PREFIX);
    uri.push_str(&encoded);
    Ok(uri)
}

/// Decode a preview produced by [`encode_jpeg_data_uri`] back to JPEG bytes
pub fn decode_data_uri(uri: &str) -> Option<Vec<u8>> {
    let payload = uri.strip_prefix(DATA_URI_PREFIX)?;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()
}
