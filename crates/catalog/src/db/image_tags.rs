use crate::db::{placeholders, query_all, DbHandle, DbResult, MAX_BATCH};
use anyhow::Context;
use rusqlite::{params, params_from_iter};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageTag {
    pub image_id: i64,
    pub tag_id: i64,
}

impl ImageTag {
    /// Makes `tag_ids` the complete tag set of `image_id`. Repeated ids are ignored.
    pub fn replace_for_image<H: DbHandle>(db: &H, image_id: i64, tag_ids: &[i64]) -> DbResult<()> {
        db.execute("DELETE FROM image_tags WHERE image_id = ?1", params![image_id])
            .with_context(|| format!("failed to clear tags of image id={image_id}"))?;

        // Two parameters per row.
        for chunk in tag_ids.chunks(MAX_BATCH / 2) {
            let values = (0..chunk.len())
                .map(|_| "(?, ?)")
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("INSERT OR IGNORE INTO image_tags (image_id, tag_id) VALUES {values}");
            let params = chunk.iter().flat_map(|tag_id| [image_id, *tag_id]);
            db.execute(&sql, params_from_iter(params))
                .with_context(|| format!("failed to associate tags with image id={image_id}"))?;
        }
        Ok(())
    }

    pub fn load_for_image<H: DbHandle>(db: &H, image_id: i64) -> DbResult<Vec<Self>> {
        query_all(
            db,
            "SELECT image_id, tag_id FROM image_tags WHERE image_id = ?1 ORDER BY tag_id",
            params![image_id],
            ImageTag::from_row,
        )
        .with_context(|| format!("failed to load image_tags image_id={image_id}"))
    }

    /// Tag names per image, sorted ascending. Images without tags are absent from the map.
    pub fn tag_names_for_images<H: DbHandle>(
        db: &H,
        image_ids: &[i64],
    ) -> DbResult<HashMap<i64, Vec<String>>> {
        let mut names: HashMap<i64, Vec<String>> = HashMap::new();
        for chunk in image_ids.chunks(MAX_BATCH) {
            let sql = format!(
                "SELECT it.image_id, t.name
                 FROM image_tags it
                 INNER JOIN tags t ON t.id = it.tag_id
                 WHERE it.image_id IN ({})
                 ORDER BY it.image_id, t.name",
                placeholders(chunk.len())
            );
            let rows = query_all(db, &sql, params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to load tag names for images")?;
            for (image_id, name) in rows {
                names.entry(image_id).or_default().push(name);
            }
        }
        Ok(names)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> DbResult<Self> {
        Ok(Self {
            image_id: row.get(0)?,
            tag_id: row.get(1)?,
        })
    }
}
