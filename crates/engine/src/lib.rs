use core_types::{BlobReference, ServableFormat};
use image::{DynamicImage, ImageFormat};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, debug_span, Span};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported format: {0} is not servable with a mime type")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Result of fingerprinting one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub blob_reference: BlobReference,
    pub format: ServableFormat,
    pub width: u32,
    pub height: u32,
}

impl Fingerprint {
    pub fn digest(&self) -> &str {
        self.blob_reference.digest()
    }
}

/// Decodes uploads, enforces the servable-format allowlist and derives the
/// content-addressed blob reference.
///
/// The digest is computed over the decoded pixels widened to RGBA16 (plus the
/// dimensions), not over the uploaded bytes, so re-encodes of the same picture
/// map to the same digest while 16-bit sources keep their full precision.
#[derive(Debug, Clone)]
pub struct ContentFingerprinter {
    allowlist: Vec<ServableFormat>,
    span: Span,
}

impl ContentFingerprinter {
    pub fn new(allowlist: impl IntoIterator<Item = ServableFormat>, span: Span) -> Self {
        Self {
            allowlist: allowlist.into_iter().collect(),
            span,
        }
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint> {
        let _guard = debug_span!(parent: &self.span, "fingerprint", size = bytes.len()).entered();

        let detected = image::guess_format(bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
        let decoded = decode(bytes, detected)?;

        let format = servable_format(detected)
            .filter(|format| self.allowlist.contains(format))
            .ok_or_else(|| EngineError::UnsupportedFormat(format!("{detected:?}")))?;

        let digest = pixel_digest(&decoded);
        let blob_reference = BlobReference::new(&digest, format)
            .ok_or_else(|| EngineError::Decode("digest is not lowercase hex".into()))?;
        debug!(blob_reference = %blob_reference, "fingerprinted upload");

        Ok(Fingerprint {
            blob_reference,
            format,
            width: decoded.width(),
            height: decoded.height(),
        })
    }
}

impl Default for ContentFingerprinter {
    fn default() -> Self {
        Self::new(ServableFormat::ALL, Span::none())
    }
}

fn decode(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage> {
    match catch_unwind(AssertUnwindSafe(|| {
        image::load_from_memory_with_format(bytes, format)
    })) {
        Ok(Ok(img)) => Ok(img),
        Ok(Err(err)) => Err(EngineError::Decode(err.to_string())),
        Err(_) => Err(EngineError::Decode(format!("{format:?} decoder panicked"))),
    }
}

fn servable_format(format: ImageFormat) -> Option<ServableFormat> {
    match format {
        ImageFormat::Png => Some(ServableFormat::Png),
        ImageFormat::Jpeg => Some(ServableFormat::Jpeg),
        ImageFormat::Gif => Some(ServableFormat::Gif),
        ImageFormat::WebP => Some(ServableFormat::Webp),
        ImageFormat::Bmp => Some(ServableFormat::Bmp),
        ImageFormat::Tiff => Some(ServableFormat::Tiff),
        ImageFormat::Ico => Some(ServableFormat::Ico),
        _ => None,
    }
}

fn pixel_digest(img: &DynamicImage) -> String {
    let rgba = img.to_rgba16();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"rgba16");
    hasher.update(&rgba.width().to_le_bytes());
    hasher.update(&rgba.height().to_le_bytes());
    let samples: Vec<u8> = rgba
        .as_raw()
        .iter()
        .flat_map(|channel| channel.to_le_bytes())
        .collect();
    hasher.update(&samples);
    hasher.finalize().to_hex().to_string()
}
