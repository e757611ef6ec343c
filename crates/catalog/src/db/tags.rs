use crate::db::{
    parse_datetime, query_all, query_optional, to_rfc3339, DbHandle, DbResult, MAX_BATCH,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use core_types::TagSummary;
use rusqlite::{params, params_from_iter};
use std::collections::BTreeSet;

const TAG_COLUMNS: &str = "id, name, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tag {
    /// Insert-or-refresh every name in `names` and return the resulting rows sorted by name.
    ///
    /// New names get `created_at = updated_at = touched_at`; existing rows only have
    /// `updated_at` moved to `touched_at`. Each batch is one
    /// `INSERT .. ON CONFLICT(name) DO UPDATE .. RETURNING` statement, so two writers
    /// introducing the same name cannot lose an update.
    pub fn upsert_many<H: DbHandle>(
        db: &H,
        names: &BTreeSet<String>,
        touched_at: DateTime<Utc>,
    ) -> DbResult<Vec<Self>> {
        let touched = to_rfc3339(touched_at);
        let names: Vec<&String> = names.iter().collect();
        let mut tags = Vec::with_capacity(names.len());

        for chunk in names.chunks(MAX_BATCH) {
            let values = (0..chunk.len())
                .map(|i| format!("(?{}, ?1, ?1)", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO tags (name, created_at, updated_at) VALUES {values}
                 ON CONFLICT(name) DO UPDATE SET updated_at = excluded.updated_at
                 RETURNING {TAG_COLUMNS}"
            );
            let params = params_from_iter(std::iter::once(&touched).chain(chunk.iter().copied()));
            let batch = query_all(db, &sql, params, Tag::from_row)
                .with_context(|| format!("failed to upsert {} tags", chunk.len()))?;
            tags.extend(batch);
        }

        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    pub fn find_by_name<H: DbHandle>(db: &H, name: &str) -> DbResult<Option<Self>> {
        query_optional(
            db,
            &format!("SELECT {TAG_COLUMNS} FROM tags WHERE name = ?1"),
            params![name],
            Tag::from_row,
        )
        .with_context(|| format!("failed to load tag {name}"))
    }

    pub fn load_all<H: DbHandle>(db: &H) -> DbResult<Vec<Self>> {
        query_all(
            db,
            &format!("SELECT {TAG_COLUMNS} FROM tags ORDER BY name"),
            [],
            Tag::from_row,
        )
    }

    /// Tags no image refers to.
    pub fn load_imageless<H: DbHandle>(db: &H) -> DbResult<Vec<Self>> {
        query_all(
            db,
            "SELECT t.id, t.name, t.created_at, t.updated_at
             FROM tags t
             WHERE NOT EXISTS (SELECT 1 FROM image_tags it WHERE it.tag_id = t.id)
             ORDER BY t.name",
            [],
            Tag::from_row,
        )
    }

    pub fn count<H: DbHandle>(db: &H) -> DbResult<i64> {
        db.query_row("SELECT COUNT(*) FROM tags", [], |row| Ok(row.get(0)?))
    }

    pub fn to_summary(&self) -> TagSummary {
        TagSummary {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> DbResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: parse_datetime(row.get::<_, String>(2)?, "created_at")?,
            updated_at: parse_datetime(row.get::<_, String>(3)?, "updated_at")?,
        })
    }
}
