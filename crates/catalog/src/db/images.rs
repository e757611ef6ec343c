use crate::db::{parse_datetime, query_all, to_rfc3339, DbHandle, DbResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use core_types::{BlobReference, ServableFormat};
use rusqlite::params;

pub(crate) const IMAGE_COLUMNS: &str =
    "i.id, i.blob_reference, i.content_digest, i.format, i.width, i.height, i.byte_size, \
     i.created_at, i.updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub blob_reference: BlobReference,
    pub content_digest: String,
    pub format: ServableFormat,
    pub width: u32,
    pub height: u32,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Inserts the record. Fails with a constraint violation when the blob reference or
    /// content digest is already recorded.
    pub fn insert<H: DbHandle>(&self, db: &H) -> DbResult<i64> {
        db.execute(
            "INSERT INTO images (
                blob_reference, content_digest, format, width, height, byte_size,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.blob_reference.as_str(),
                self.content_digest,
                self.format.extension(),
                self.width,
                self.height,
                self.byte_size,
                to_rfc3339(self.created_at),
                to_rfc3339(self.updated_at)
            ],
        )
        .with_context(|| format!("failed to insert image {}", self.blob_reference))?;
        Ok(db.last_insert_rowid())
    }

    /// All records bound to `blob_reference`; at most two rows are read, which is enough
    /// to tell a unique match from an ambiguous one.
    pub fn find_by_blob_reference<H: DbHandle>(
        db: &H,
        blob_reference: &BlobReference,
    ) -> DbResult<Vec<Self>> {
        query_all(
            db,
            &format!("SELECT {IMAGE_COLUMNS} FROM images i WHERE i.blob_reference = ?1 LIMIT 2"),
            params![blob_reference.as_str()],
            Image::from_row,
        )
        .with_context(|| format!("failed to look up image {blob_reference}"))
    }

    /// Records holding the same picture, whatever container format they were stored as.
    pub fn find_by_digest<H: DbHandle>(db: &H, digest: &str) -> DbResult<Vec<Self>> {
        query_all(
            db,
            &format!("SELECT {IMAGE_COLUMNS} FROM images i WHERE i.content_digest = ?1"),
            params![digest],
            Image::from_row,
        )
        .with_context(|| format!("failed to look up digest {digest}"))
    }

    pub fn touch<H: DbHandle>(db: &H, id: i64, updated_at: DateTime<Utc>) -> DbResult<()> {
        db.execute(
            "UPDATE images SET updated_at = ?1 WHERE id = ?2",
            params![to_rfc3339(updated_at), id],
        )
        .with_context(|| format!("failed to touch image id={id}"))?;
        Ok(())
    }

    pub fn delete<H: DbHandle>(db: &H, id: i64) -> DbResult<()> {
        db.execute("DELETE FROM images WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete image id={id}"))?;
        Ok(())
    }

    pub fn count<H: DbHandle>(db: &H) -> DbResult<i64> {
        db.query_row("SELECT COUNT(*) FROM images", [], |row| Ok(row.get(0)?))
    }

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> DbResult<Self> {
        let raw_reference: String = row.get(1)?;
        let blob_reference = BlobReference::parse(&raw_reference)
            .with_context(|| format!("stored blob reference is malformed: {raw_reference}"))?;
        let raw_format: String = row.get(3)?;
        let format = ServableFormat::from_extension(&raw_format)
            .with_context(|| format!("stored image format is unknown: {raw_format}"))?;

        Ok(Self {
            id: row.get(0)?,
            blob_reference,
            content_digest: row.get(2)?,
            format,
            width: row.get(4)?,
            height: row.get(5)?,
            byte_size: row.get(6)?,
            created_at: parse_datetime(row.get::<_, String>(7)?, "created_at")?,
            updated_at: parse_datetime(row.get::<_, String>(8)?, "updated_at")?,
        })
    }
}
