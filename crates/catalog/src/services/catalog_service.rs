use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use app_settings::AppSettings;
use core_types::{BlobReference, ImageSummary, TagSummary};
use engine::ContentFingerprinter;
use tracing::{info, Span};

use crate::blobs::{BlobStore, FsBlobStore};
use crate::db::{CatalogDb, ImageListing, ImageRepository, RecordSet, Tag};
use crate::services::image_store::{lookup, ImageStore};
use crate::services::query::QueryEngine;
use crate::services::tag_upsert::TagUpsertEngine;
use crate::services::{lock, SharedDb};
use crate::{Result, StoreError};

/// Request-facing operations of the store, reporting images and tags as summaries.
pub struct CatalogService {
    db: SharedDb,
    blobs: Arc<dyn BlobStore>,
    images: ImageStore,
    queries: QueryEngine,
    settings: AppSettings,
}

impl CatalogService {
    /// Opens the database and blob root named by `settings`, creating both when missing.
    pub fn open(settings: &AppSettings, span: Span) -> Result<Self> {
        if let Some(parent) = settings.database_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create catalog directory {}", parent.display())
            })?;
        }
        let db = CatalogDb::open(
            &settings.database_path,
            Duration::from_millis(settings.busy_timeout_ms),
        )
        .with_context(|| format!("failed to open catalog {}", settings.database_path.display()))?;
        let blobs = FsBlobStore::open(&settings.media_root).with_context(|| {
            format!("failed to open media root {}", settings.media_root.display())
        })?;

        info!(
            database = %settings.database_path.display(),
            media_root = %settings.media_root.display(),
            "image store opened"
        );
        Ok(Self::new(db, Arc::new(blobs), settings, span))
    }

    pub fn new(db: CatalogDb, blobs: Arc<dyn BlobStore>, settings: &AppSettings, span: Span) -> Self {
        let db: SharedDb = Arc::new(Mutex::new(db));
        let fingerprinter =
            ContentFingerprinter::new(settings.servable_formats.iter().copied(), span.clone());
        let images = ImageStore::new(
            db.clone(),
            blobs.clone(),
            fingerprinter,
            TagUpsertEngine::new(span.clone()),
            span.clone(),
        );
        let queries = QueryEngine::new(db.clone(), span);
        Self {
            db,
            blobs,
            images,
            queries,
            settings: settings.clone(),
        }
    }

    pub fn upload(&self, bytes: &[u8], tag_text: Option<&str>) -> Result<ImageSummary> {
        let listing = self.images.upload(bytes, tag_text)?;
        Ok(self.summarize(&listing))
    }

    pub fn edit(&self, blob_reference: &str, tag_text: Option<&str>) -> Result<ImageSummary> {
        let listing = self.images.edit(blob_reference, tag_text)?;
        Ok(self.summarize(&listing))
    }

    pub fn delete(&self, blob_reference: &str) -> Result<()> {
        self.images.delete(blob_reference)
    }

    pub fn list_images(&self, required_tags: &BTreeSet<String>) -> Result<Vec<ImageSummary>> {
        Ok(self.summarize_all(&self.queries.list_images(required_tags)?))
    }

    pub fn search(&self, text: &str) -> Result<Vec<ImageSummary>> {
        Ok(self.summarize_all(&self.queries.search(text)?))
    }

    pub fn list_tagless_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.summarize_all(&self.queries.list_tagless_images()?))
    }

    pub fn list_tags(&self) -> Result<Vec<TagSummary>> {
        Ok(tag_summaries(&self.queries.list_tags()?))
    }

    pub fn list_imageless_tags(&self) -> Result<Vec<TagSummary>> {
        Ok(tag_summaries(&self.queries.list_imageless_tags()?))
    }

    /// Single image by reference, with its tags.
    pub fn find_image(&self, blob_reference: &str) -> Result<ImageSummary> {
        let mut db = lock(&self.db)?;
        let tx = db.transaction()?;
        let image = lookup(&tx, blob_reference)?;
        let listing = tx
            .find_by_blob_reference(&image.blob_reference)?
            .first()
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                blob_reference: blob_reference.to_string(),
            })?;
        tx.commit()?;
        Ok(self.summarize(&listing))
    }

    /// Stored bytes of an image and the MIME type to serve them with.
    pub fn read_blob(&self, blob_reference: &str) -> Result<(Vec<u8>, &'static str)> {
        let image = {
            let mut db = lock(&self.db)?;
            let tx = db.transaction()?;
            let image = lookup(&tx, blob_reference)?;
            tx.commit()?;
            image
        };
        let bytes = self.blobs.read(&image.blob_reference).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StoreError::Persistence(anyhow::anyhow!(
                    "blob {} is recorded but missing from media storage",
                    image.blob_reference
                ))
            } else {
                StoreError::Persistence(
                    anyhow::Error::new(err)
                        .context(format!("failed to read blob {}", image.blob_reference)),
                )
            }
        })?;
        Ok((bytes, image.format.mime_type()))
    }

    pub fn image_url(&self, blob_reference: &BlobReference) -> String {
        self.settings.image_url(blob_reference.as_str())
    }

    fn summarize(&self, listing: &ImageListing) -> ImageSummary {
        listing.to_summary(|reference| self.image_url(reference))
    }

    fn summarize_all(&self, rows: &RecordSet<ImageListing>) -> Vec<ImageSummary> {
        rows.iter().map(|listing| self.summarize(listing)).collect()
    }
}

fn tag_summaries(rows: &RecordSet<Tag>) -> Vec<TagSummary> {
    rows.iter().map(Tag::to_summary).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ServableFormat;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::thread;
    use tempfile::TempDir;

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn red_png() -> Vec<u8> {
        encode(
            DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]))),
            ImageFormat::Png,
        )
    }

    fn red_png_reencoded() -> Vec<u8> {
        encode(
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]))),
            ImageFormat::Png,
        )
    }

    fn settings_in(dir: &TempDir) -> AppSettings {
        AppSettings {
            media_root: dir.path().join("media"),
            database_path: dir.path().join("db").join("tagstore.sqlite3"),
            media_url: "https://cdn.example/media".to_string(),
            ..AppSettings::default()
        }
    }

    fn names(summaries: &[TagSummary]) -> Vec<&str> {
        summaries.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn upload_duplicate_delete_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let service = CatalogService::open(&settings_in(&dir), Span::none()).unwrap();

        let uploaded = service.upload(&red_png(), Some("red, small")).unwrap();
        assert_eq!(uploaded.tags, vec!["red", "small"]);
        assert_eq!(
            uploaded.image_url,
            format!("https://cdn.example/media/{}", uploaded.blob_reference)
        );

        let err = service.upload(&red_png_reencoded(), None).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateContent { .. }));
        assert_eq!(service.list_images(&BTreeSet::new()).unwrap().len(), 1);

        service.delete(uploaded.blob_reference.as_str()).unwrap();
        let err = service
            .find_image(uploaded.blob_reference.as_str())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(err.status_code(), 404);

        assert_eq!(names(&service.list_tags().unwrap()), vec!["red", "small"]);
        assert_eq!(
            names(&service.list_imageless_tags().unwrap()),
            vec!["red", "small"]
        );
    }

    #[test]
    fn read_blob_returns_bytes_and_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let service = CatalogService::open(&settings_in(&dir), Span::none()).unwrap();
        let bytes = red_png();
        let uploaded = service.upload(&bytes, None).unwrap();

        let (stored, mime) = service.read_blob(uploaded.blob_reference.as_str()).unwrap();
        assert_eq!(stored, bytes);
        assert_eq!(mime, "image/png");
        assert!(matches!(
            service.read_blob("ff.png").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn allowlist_comes_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            servable_formats: vec![ServableFormat::Jpeg],
            ..settings_in(&dir)
        };
        let service = CatalogService::open(&settings, Span::none()).unwrap();
        let err = service.upload(&red_png(), None).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedFormat(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);
        let uploaded = {
            let service = CatalogService::open(&settings, Span::none()).unwrap();
            service.upload(&red_png(), Some("kept")).unwrap()
        };

        let service = CatalogService::open(&settings, Span::none()).unwrap();
        let found = service.find_image(uploaded.blob_reference.as_str()).unwrap();
        assert_eq!(found.tags, vec!["kept"]);
        assert_eq!(found.updated_at, uploaded.updated_at);
    }

    #[test]
    fn concurrent_identical_uploads_yield_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);
        let services: Vec<CatalogService> = (0..2)
            .map(|_| CatalogService::open(&settings, Span::none()).unwrap())
            .collect();
        let bytes = red_png();

        let outcomes: Vec<Result<ImageSummary>> = thread::scope(|scope| {
            let handles: Vec<_> = services
                .iter()
                .map(|service| {
                    let bytes = &bytes;
                    scope.spawn(move || service.upload(bytes, Some("race")))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes.iter().filter(|o| o.is_ok()).count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, Err(StoreError::DuplicateContent { .. })))
            .count();
        assert_eq!((winners, duplicates), (1, 1));
        assert_eq!(services[0].list_images(&BTreeSet::new()).unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(&settings.media_root).unwrap().count(), 1);
    }
}
