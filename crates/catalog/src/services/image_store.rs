use crate::blobs::{BlobStore, PutOutcome};
use crate::db::{is_constraint_violation, now, Image, ImageListing, ImageTag};
use crate::services::tag_upsert::{parse_tag_text, TagUpsertEngine};
use crate::services::{lock, SharedDb};
use crate::{Result, StoreError};
use anyhow::{anyhow, Context};
use core_types::BlobReference;
use engine::{ContentFingerprinter, Fingerprint};
use rusqlite::Transaction;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use tracing::{debug_span, info, warn, Span};

/// Write path of the store: upload, tag edit and delete.
///
/// Every operation runs in one `BEGIN IMMEDIATE` transaction. Upload blobs are
/// written before the record commits and while the write lock is held, so a
/// record never points at a missing blob and two uploads of the same picture
/// are serialised.
pub struct ImageStore {
    db: SharedDb,
    blobs: Arc<dyn BlobStore>,
    fingerprinter: ContentFingerprinter,
    tags: TagUpsertEngine,
    span: Span,
}

impl ImageStore {
    pub fn new(
        db: SharedDb,
        blobs: Arc<dyn BlobStore>,
        fingerprinter: ContentFingerprinter,
        tags: TagUpsertEngine,
        span: Span,
    ) -> Self {
        Self {
            db,
            blobs,
            fingerprinter,
            tags,
            span,
        }
    }

    /// Stores a never-seen picture and tags it.
    ///
    /// Content already recorded (same pixels, whatever the container) is rejected with
    /// [`StoreError::DuplicateContent`] and leaves the existing record untouched. A blob
    /// without a record is adopted.
    pub fn upload(&self, bytes: &[u8], tag_text: Option<&str>) -> Result<ImageListing> {
        let span = debug_span!(parent: &self.span, "upload", size = bytes.len());
        let _guard = span.enter();

        let fingerprint = self.fingerprinter.fingerprint(bytes)?;
        let names = parse_tag_text(tag_text);
        let blob_reference = &fingerprint.blob_reference;

        let mut db = lock(&self.db)?;
        let tx = db.write_transaction()?;

        if let Some(existing) = Image::find_by_digest(&tx, fingerprint.digest())?.into_iter().next()
        {
            info!(blob_reference = %existing.blob_reference, "rejecting duplicate upload");
            return Err(StoreError::DuplicateContent {
                blob_reference: existing.blob_reference,
            });
        }

        let outcome = self.blobs.put(blob_reference, bytes).map_err(|err| {
            StoreError::Persistence(
                anyhow::Error::new(err).context(format!("failed to store blob {blob_reference}")),
            )
        })?;
        // An adopted blob keeps its own bytes, which may be another encoding of the picture.
        let stored_size = match outcome {
            PutOutcome::Created => bytes.len() as u64,
            PutOutcome::AlreadyPresent => {
                warn!(blob_reference = %blob_reference, "adopting orphaned blob");
                std::fs::metadata(self.blobs.path_for(blob_reference))
                    .with_context(|| format!("failed to stat adopted blob {blob_reference}"))?
                    .len()
            }
        };

        // The blob of a failed upload is removed before the transaction rolls back, while
        // no other connection can adopt it.
        let listing = match self.record_upload(&tx, &fingerprint, stored_size, &names) {
            Ok(listing) => listing,
            Err(err) => {
                self.discard_blob(outcome, blob_reference);
                return Err(err);
            }
        };
        if let Err(err) = tx.commit() {
            self.discard_blob(outcome, blob_reference);
            return Err(err.into());
        }

        info!(blob_reference = %blob_reference, tags = listing.tags.len(), "image uploaded");
        Ok(listing)
    }

    fn discard_blob(&self, outcome: PutOutcome, blob_reference: &BlobReference) {
        if outcome != PutOutcome::Created {
            return;
        }
        if let Err(err) = self.blobs.delete(blob_reference) {
            warn!(blob_reference = %blob_reference, error = %err, "failed to remove blob of rolled back upload");
        }
    }

    fn record_upload(
        &self,
        tx: &Transaction<'_>,
        fingerprint: &Fingerprint,
        byte_size: u64,
        names: &BTreeSet<String>,
    ) -> Result<ImageListing> {
        let touched_at = now();
        let tags = self.tags.upsert(tx, names, touched_at)?;

        let mut image = Image {
            id: 0,
            blob_reference: fingerprint.blob_reference.clone(),
            content_digest: fingerprint.digest().to_string(),
            format: fingerprint.format,
            width: fingerprint.width,
            height: fingerprint.height,
            byte_size: i64::try_from(byte_size).context("blob too large")?,
            created_at: touched_at,
            updated_at: touched_at,
        };
        image.id = match image.insert(tx) {
            Ok(id) => id,
            Err(err) if is_constraint_violation(&err) => {
                return Err(StoreError::DuplicateContent {
                    blob_reference: image.blob_reference.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let tag_ids: Vec<i64> = tags.iter().map(|tag| tag.id).collect();
        ImageTag::replace_for_image(tx, image.id, &tag_ids)?;

        Ok(ImageListing {
            image,
            tags: tags.into_iter().map(|tag| tag.name).collect(),
        })
    }

    /// Replaces the image's tags with those in `tag_text` and bumps `updated_at`.
    /// Empty text clears every tag.
    pub fn edit(&self, blob_reference: &str, tag_text: Option<&str>) -> Result<ImageListing> {
        let span = debug_span!(parent: &self.span, "edit", blob_reference);
        let _guard = span.enter();

        let names = parse_tag_text(tag_text);
        let mut db = lock(&self.db)?;
        let tx = db.write_transaction()?;
        let mut image = lookup(&tx, blob_reference)?;

        let touched_at = now();
        let tags = self.tags.upsert(&tx, &names, touched_at)?;
        let tag_ids: Vec<i64> = tags.iter().map(|tag| tag.id).collect();
        ImageTag::replace_for_image(&tx, image.id, &tag_ids)?;
        Image::touch(&tx, image.id, touched_at)?;
        tx.commit()?;

        image.updated_at = touched_at;
        info!(blob_reference = %image.blob_reference, tags = tags.len(), "image tags replaced");
        Ok(ImageListing {
            image,
            tags: tags.into_iter().map(|tag| tag.name).collect(),
        })
    }

    /// Releases the blob, then removes the record and its tag associations. Tags stay.
    ///
    /// A blob that cannot be removed leaves the record in place. A record that cannot
    /// be removed once its blob is gone is reported as [`StoreError::PartialDelete`].
    pub fn delete(&self, blob_reference: &str) -> Result<()> {
        let span = debug_span!(parent: &self.span, "delete", blob_reference);
        let _guard = span.enter();

        let mut db = lock(&self.db)?;
        let tx = db.write_transaction()?;
        let image = lookup(&tx, blob_reference)?;
        let reference = image.blob_reference.clone();

        match self.blobs.delete(&reference) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(blob_reference = %reference, "blob already missing; removing record");
            }
            Err(err) => {
                warn!(blob_reference = %reference, error = %err, "blob delete failed; keeping record");
                return Err(StoreError::PartialDelete {
                    blob_reference: reference,
                    reason: format!("blob could not be removed: {err}"),
                });
            }
        }

        let removed = Image::delete(&tx, image.id).and_then(|()| Ok(tx.commit()?));
        if let Err(err) = removed {
            warn!(blob_reference = %reference, error = %err, "record delete failed after blob removal");
            return Err(StoreError::PartialDelete {
                blob_reference: reference,
                reason: format!("record could not be removed: {err:#}"),
            });
        }

        info!(blob_reference = %reference, "image deleted");
        Ok(())
    }
}

/// Resolves a client-supplied reference to exactly one image.
pub(crate) fn lookup(tx: &Transaction<'_>, raw: &str) -> Result<Image> {
    let not_found = || StoreError::NotFound {
        blob_reference: raw.to_string(),
    };
    let blob_reference = BlobReference::parse(raw).ok_or_else(not_found)?;

    let mut matches = Image::find_by_blob_reference(tx, &blob_reference)?;
    match matches.len() {
        0 => Err(not_found()),
        1 => matches
            .pop()
            .ok_or_else(|| StoreError::Persistence(anyhow!("lookup result vanished"))),
        n => Err(StoreError::AmbiguousLookup {
            blob_reference,
            matches: n,
        }),
    }
}
