//! Read-side repository over images and tags.
//!
//! Every finder returns a [`RecordSet`]: the rows are fetched inside the caller's
//! transaction and can then be iterated any number of times after it ends.

use crate::db::images::IMAGE_COLUMNS;
use crate::db::{placeholders, query_all, DbHandle, DbResult, Image, ImageTag, Tag};
use anyhow::Context;
use core_types::{BlobReference, ImageId, ImageSummary};
use rusqlite::{params, params_from_iter, types::Value};
use std::collections::BTreeSet;
use std::sync::Arc;

const NEWEST_FIRST: &str = "ORDER BY i.updated_at DESC, i.id DESC";

/// Immutable, cheaply clonable result of a finder.
#[derive(Debug, Clone)]
pub struct RecordSet<T> {
    rows: Arc<[T]>,
}

impl<T> RecordSet<T> {
    fn new(rows: Vec<T>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.rows.first()
    }
}

impl<'a, T> IntoIterator for &'a RecordSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// An image row together with its current tag names (sorted ascending).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageListing {
    pub image: Image,
    pub tags: Vec<String>,
}

impl ImageListing {
    pub fn to_summary(&self, image_url: impl FnOnce(&BlobReference) -> String) -> ImageSummary {
        ImageSummary {
            id: ImageId(self.image.id),
            blob_reference: self.image.blob_reference.clone(),
            image_url: image_url(&self.image.blob_reference),
            updated_at: self.image.updated_at,
            tags: self.tags.clone(),
        }
    }
}

pub trait ImageRepository {
    /// All records stored under `blob_reference`. More than one row means the store is corrupt.
    fn find_by_blob_reference(
        &self,
        blob_reference: &BlobReference,
    ) -> DbResult<RecordSet<ImageListing>>;

    /// Images tagged with every name in `required`, newest first. An empty set matches all images.
    fn find_by_tags_superset(&self, required: &BTreeSet<String>)
        -> DbResult<RecordSet<ImageListing>>;

    /// Images with no tags, newest first.
    fn find_tagless(&self) -> DbResult<RecordSet<ImageListing>>;

    fn find_all_tags(&self) -> DbResult<RecordSet<Tag>>;

    /// Tags no image refers to, by name.
    fn find_imageless(&self) -> DbResult<RecordSet<Tag>>;
}

impl<H: DbHandle> ImageRepository for H {
    fn find_by_blob_reference(
        &self,
        blob_reference: &BlobReference,
    ) -> DbResult<RecordSet<ImageListing>> {
        let images = Image::find_by_blob_reference(self, blob_reference)?;
        with_tags(self, images).map(RecordSet::new)
    }

    fn find_by_tags_superset(
        &self,
        required: &BTreeSet<String>,
    ) -> DbResult<RecordSet<ImageListing>> {
        let images = if required.is_empty() {
            query_all(
                self,
                &format!("SELECT {IMAGE_COLUMNS} FROM images i {NEWEST_FIRST}"),
                [],
                Image::from_row,
            )
            .context("failed to list images")?
        } else {
            // Only existing tags are counted, so an unknown required name matches nothing.
            let sql = format!(
                "SELECT {IMAGE_COLUMNS} FROM images i
                 WHERE i.id IN (
                     SELECT it.image_id
                     FROM image_tags it
                     INNER JOIN tags t ON t.id = it.tag_id
                     WHERE t.name IN ({})
                     GROUP BY it.image_id
                     HAVING COUNT(DISTINCT t.id) = ?
                 )
                 {NEWEST_FIRST}",
                placeholders(required.len())
            );
            let params = required
                .iter()
                .map(|name| Value::Text(name.clone()))
                .chain(std::iter::once(Value::Integer(required.len() as i64)));
            query_all(self, &sql, params_from_iter(params), Image::from_row)
                .with_context(|| format!("failed to list images tagged {required:?}"))?
        };
        with_tags(self, images).map(RecordSet::new)
    }

    fn find_tagless(&self) -> DbResult<RecordSet<ImageListing>> {
        let images = query_all(
            self,
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images i
                 WHERE NOT EXISTS (SELECT 1 FROM image_tags it WHERE it.image_id = i.id)
                 {NEWEST_FIRST}"
            ),
            params![],
            Image::from_row,
        )
        .context("failed to list tagless images")?;
        Ok(RecordSet::new(
            images
                .into_iter()
                .map(|image| ImageListing {
                    image,
                    tags: Vec::new(),
                })
                .collect(),
        ))
    }

    fn find_all_tags(&self) -> DbResult<RecordSet<Tag>> {
        Tag::load_all(self)
            .context("failed to list tags")
            .map(RecordSet::new)
    }

    fn find_imageless(&self) -> DbResult<RecordSet<Tag>> {
        Tag::load_imageless(self)
            .context("failed to list imageless tags")
            .map(RecordSet::new)
    }
}

fn with_tags<H: DbHandle>(db: &H, images: Vec<Image>) -> DbResult<Vec<ImageListing>> {
    let ids: Vec<i64> = images.iter().map(|image| image.id).collect();
    let mut names = ImageTag::tag_names_for_images(db, &ids)?;
    Ok(images
        .into_iter()
        .map(|image| ImageListing {
            tags: names.remove(&image.id).unwrap_or_default(),
            image,
        })
        .collect())
}
