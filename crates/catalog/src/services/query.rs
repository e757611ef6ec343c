use crate::db::{DbResult, ImageListing, ImageRepository, RecordSet, Tag};
use crate::services::tag_upsert::parse_tag_text;
use crate::services::{lock, SharedDb};
use crate::Result;
use rusqlite::Transaction;
use std::collections::BTreeSet;
use tracing::{debug, debug_span, Span};

/// Read path of the store. Each call reads one committed snapshot.
pub struct QueryEngine {
    db: SharedDb,
    span: Span,
}

impl QueryEngine {
    pub fn new(db: SharedDb, span: Span) -> Self {
        Self { db, span }
    }

    /// Images carrying every tag in `required_tags`, newest first. An empty set lists all images.
    pub fn list_images(&self, required_tags: &BTreeSet<String>) -> Result<RecordSet<ImageListing>> {
        self.read("list_images", |tx| tx.find_by_tags_superset(required_tags))
    }

    /// Tokenises `text` like tag text and lists the images carrying all of the tokens.
    pub fn search(&self, text: &str) -> Result<RecordSet<ImageListing>> {
        self.list_images(&parse_tag_text(Some(text)))
    }

    pub fn list_tagless_images(&self) -> Result<RecordSet<ImageListing>> {
        self.read("list_tagless_images", |tx| tx.find_tagless())
    }

    pub fn list_tags(&self) -> Result<RecordSet<Tag>> {
        self.read("list_tags", |tx| tx.find_all_tags())
    }

    pub fn list_imageless_tags(&self) -> Result<RecordSet<Tag>> {
        self.read("list_imageless_tags", |tx| tx.find_imageless())
    }

    fn read<T>(
        &self,
        operation: &'static str,
        query: impl FnOnce(&Transaction<'_>) -> DbResult<RecordSet<T>>,
    ) -> Result<RecordSet<T>> {
        let _guard = debug_span!(parent: &self.span, "query", operation).entered();
        let mut db = lock(&self.db)?;
        let tx = db.transaction()?;
        let rows = query(&tx)?;
        tx.commit()?;
        debug!(rows = rows.len(), "query answered");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::FsBlobStore;
    use crate::db::CatalogDb;
    use crate::services::image_store::ImageStore;
    use crate::services::tag_upsert::TagUpsertEngine;
    use engine::ContentFingerprinter;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn png(rgb: [u8; 3]) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb(rgb)))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn setup() -> (TempDir, ImageStore, QueryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db: SharedDb = Arc::new(Mutex::new(CatalogDb::in_memory().unwrap()));
        let store = ImageStore::new(
            db.clone(),
            Arc::new(FsBlobStore::open(dir.path()).unwrap()),
            ContentFingerprinter::default(),
            TagUpsertEngine::default(),
            Span::none(),
        );
        (dir, store, QueryEngine::new(db, Span::none()))
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn references(rows: &RecordSet<ImageListing>) -> Vec<String> {
        rows.iter()
            .map(|row| row.image.blob_reference.to_string())
            .collect()
    }

    #[test]
    fn intersection_returns_only_full_matches() {
        let (_dir, store, queries) = setup();
        let i1 = store.upload(&png([1, 0, 0]), Some("a b")).unwrap();
        store.upload(&png([2, 0, 0]), Some("a")).unwrap();
        store.upload(&png([3, 0, 0]), Some("b c")).unwrap();

        let rows = queries.list_images(&set(&["a", "b"])).unwrap();
        assert_eq!(references(&rows), vec![i1.image.blob_reference.to_string()]);
    }

    #[test]
    fn listing_is_newest_first_and_edit_moves_to_front() {
        let (_dir, store, queries) = setup();
        let first = store.upload(&png([1, 1, 0]), Some("x")).unwrap();
        let second = store.upload(&png([2, 2, 0]), Some("x")).unwrap();

        let rows = queries.list_images(&BTreeSet::new()).unwrap();
        assert_eq!(
            references(&rows),
            vec![
                second.image.blob_reference.to_string(),
                first.image.blob_reference.to_string()
            ]
        );

        std::thread::sleep(std::time::Duration::from_millis(2));
        store
            .edit(first.image.blob_reference.as_str(), Some("x y"))
            .unwrap();
        let rows = queries.list_images(&set(&["x"])).unwrap();
        assert_eq!(rows.first().unwrap().image.id, first.image.id);
        assert_eq!(rows.first().unwrap().tags, vec!["x", "y"]);
    }

    #[test]
    fn search_tokenises_like_tag_text() {
        let (_dir, store, queries) = setup();
        let both = store.upload(&png([5, 0, 0]), Some("sun sea")).unwrap();
        store.upload(&png([6, 0, 0]), Some("sun")).unwrap();

        let rows = queries.search("sea,  sun").unwrap();
        assert_eq!(references(&rows), vec![both.image.blob_reference.to_string()]);
        assert_eq!(queries.search("").unwrap().len(), 2);
    }

    #[test]
    fn tagless_and_imageless_listings() {
        let (_dir, store, queries) = setup();
        let bare = store.upload(&png([7, 0, 0]), None).unwrap();
        let tagged = store.upload(&png([8, 0, 0]), Some("b a")).unwrap();
        store
            .edit(tagged.image.blob_reference.as_str(), Some("a"))
            .unwrap();

        let tagless = queries.list_tagless_images().unwrap();
        assert_eq!(references(&tagless), vec![bare.image.blob_reference.to_string()]);
        assert!(tagless.first().unwrap().tags.is_empty());

        let all: Vec<String> = queries.list_tags().unwrap().iter().map(|t| t.name.clone()).collect();
        assert_eq!(all, vec!["a", "b"]);
        let orphaned: Vec<String> = queries
            .list_imageless_tags()
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(orphaned, vec!["b"]);
    }
}
