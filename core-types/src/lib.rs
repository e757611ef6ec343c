use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub i64);

/// Image container formats the store is willing to hand back to clients.
///
/// Each variant has a well-known MIME type; anything the decoder understands
/// that is not listed here is rejected at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServableFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
    Ico,
}

impl ServableFormat {
    pub const ALL: [ServableFormat; 7] = [
        ServableFormat::Png,
        ServableFormat::Jpeg,
        ServableFormat::Gif,
        ServableFormat::Webp,
        ServableFormat::Bmp,
        ServableFormat::Tiff,
        ServableFormat::Ico,
    ];

    /// Lowercased format name, used as the blob file extension.
    pub fn extension(self) -> &'static str {
        match self {
            ServableFormat::Png => "png",
            ServableFormat::Jpeg => "jpeg",
            ServableFormat::Gif => "gif",
            ServableFormat::Webp => "webp",
            ServableFormat::Bmp => "bmp",
            ServableFormat::Tiff => "tiff",
            ServableFormat::Ico => "ico",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ServableFormat::Png => "image/png",
            ServableFormat::Jpeg => "image/jpeg",
            ServableFormat::Gif => "image/gif",
            ServableFormat::Webp => "image/webp",
            ServableFormat::Bmp => "image/bmp",
            ServableFormat::Tiff => "image/tiff",
            ServableFormat::Ico => "image/x-icon",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.extension().eq_ignore_ascii_case(ext))
    }
}

impl fmt::Display for ServableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Canonical storage key of an image: `{hex_digest}.{extension}`.
///
/// Only references produced by the fingerprinter or accepted by [`BlobReference::parse`]
/// exist, so a reference can always be joined onto the media root safely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobReference(String);

impl BlobReference {
    pub fn new(hex_digest: &str, format: ServableFormat) -> Option<Self> {
        if !is_lower_hex(hex_digest) {
            return None;
        }
        Some(Self(format!("{hex_digest}.{}", format.extension())))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (digest, ext) = raw.rsplit_once('.')?;
        let format = ServableFormat::from_extension(ext)?;
        if ext != format.extension() {
            return None;
        }
        Self::new(digest, format)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn digest(&self) -> &str {
        self.0.rsplit_once('.').map(|(d, _)| d).unwrap_or(&self.0)
    }

    pub fn format(&self) -> Option<ServableFormat> {
        self.0
            .rsplit_once('.')
            .and_then(|(_, ext)| ServableFormat::from_extension(ext))
    }
}

fn is_lower_hex(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for BlobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobReference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid blob reference: {value}"))
    }
}

impl From<BlobReference> for String {
    fn from(value: BlobReference) -> Self {
        value.0
    }
}

/// Image as reported to the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: ImageId,
    pub blob_reference: BlobReference,
    pub image_url: String,
    pub updated_at: DateTime<Utc>,
    /// Tag names, sorted ascending.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSummary {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
