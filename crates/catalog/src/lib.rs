pub mod blobs;
pub mod db;
pub mod schema;
pub mod services;

pub use blobs::{BlobStore, FsBlobStore, PutOutcome};
pub use services::catalog_service::CatalogService;
pub use services::image_store::ImageStore;
pub use services::query::QueryEngine;
pub use services::tag_upsert::{parse_tag_text, TagUpsertEngine};

use core_types::BlobReference;
use engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Duplicate content: {blob_reference} is already stored")]
    DuplicateContent { blob_reference: BlobReference },

    #[error("Image not found: {blob_reference}")]
    NotFound { blob_reference: String },

    #[error("Ambiguous lookup: {matches} images are stored as {blob_reference}")]
    AmbiguousLookup {
        blob_reference: BlobReference,
        matches: usize,
    },

    #[error("Partial delete of {blob_reference}: {reason}")]
    PartialDelete {
        blob_reference: BlobReference,
        reason: String,
    },

    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// How a caller should treat a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client-caused; nothing was mutated.
    Input,
    /// The request contradicts stored state.
    Conflict,
    NotFound,
    /// Transient storage failure; the operation was rolled back.
    Persistence,
    /// Record and blob may disagree; needs operator attention.
    Integrity,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Decode(_) | StoreError::UnsupportedFormat(_) => ErrorKind::Input,
            StoreError::DuplicateContent { .. } | StoreError::AmbiguousLookup { .. } => {
                ErrorKind::Conflict
            }
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Persistence(_) => ErrorKind::Persistence,
            StoreError::PartialDelete { .. } => ErrorKind::Integrity,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Persistence
    }

    /// HTTP-style status the request layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Decode(_) | StoreError::UnsupportedFormat(_) => 400,
            StoreError::DuplicateContent { .. } => 409,
            StoreError::NotFound { .. } => 404,
            StoreError::AmbiguousLookup { .. } | StoreError::PartialDelete { .. } => 500,
            StoreError::Persistence(_) => 503,
        }
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Decode(msg) => StoreError::Decode(msg),
            EngineError::UnsupportedFormat(msg) => StoreError::UnsupportedFormat(msg),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Persistence(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ServableFormat;

    fn reference() -> BlobReference {
        BlobReference::new("ab", ServableFormat::Png).unwrap()
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (StoreError::Decode("bad".into()), 400, ErrorKind::Input),
            (StoreError::UnsupportedFormat("Pnm".into()), 400, ErrorKind::Input),
            (
                StoreError::DuplicateContent {
                    blob_reference: reference(),
                },
                409,
                ErrorKind::Conflict,
            ),
            (
                StoreError::NotFound {
                    blob_reference: "ab.png".into(),
                },
                404,
                ErrorKind::NotFound,
            ),
            (
                StoreError::AmbiguousLookup {
                    blob_reference: reference(),
                    matches: 2,
                },
                500,
                ErrorKind::Conflict,
            ),
            (
                StoreError::PartialDelete {
                    blob_reference: reference(),
                    reason: "disk".into(),
                },
                500,
                ErrorKind::Integrity,
            ),
            (
                StoreError::Persistence(anyhow::anyhow!("locked")),
                503,
                ErrorKind::Persistence,
            ),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status_code(), status, "{err}");
            assert_eq!(err.kind(), kind, "{err}");
            assert_eq!(err.is_retryable(), kind == ErrorKind::Persistence);
        }
    }

    #[test]
    fn engine_errors_are_input_errors() {
        let err: StoreError = EngineError::UnsupportedFormat("Pnm".into()).into();
        assert!(matches!(err, StoreError::UnsupportedFormat(ref f) if f == "Pnm"));
    }

    #[test]
    fn sqlite_errors_are_persistence_errors() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_retryable());
    }
}
