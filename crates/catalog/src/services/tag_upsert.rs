use crate::db::{DbHandle, Tag};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, debug_span, Span};

/// Splits free-form tag text on runs of commas, semicolons and whitespace.
///
/// Empty tokens are dropped and repeats collapse; case is preserved. Absent text
/// yields the empty set.
pub fn parse_tag_text(text: Option<&str>) -> BTreeSet<String> {
    text.unwrap_or_default()
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Create-or-refresh of tag rows by name.
#[derive(Debug, Clone)]
pub struct TagUpsertEngine {
    span: Span,
}

impl TagUpsertEngine {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Upserts every name inside the caller's transaction and returns one row per name,
    /// sorted by name. Nothing is applied when any batch fails, as long as the caller
    /// rolls the transaction back.
    pub fn upsert<H: DbHandle>(
        &self,
        db: &H,
        names: &BTreeSet<String>,
        touched_at: DateTime<Utc>,
    ) -> Result<Vec<Tag>> {
        let _guard = debug_span!(parent: &self.span, "tag_upsert", count = names.len()).entered();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let tags = Tag::upsert_many(db, names, touched_at).context("tag upsert failed")?;
        debug!(resolved = tags.len(), "tags upserted");
        Ok(tags)
    }

    pub fn upsert_text<H: DbHandle>(
        &self,
        db: &H,
        text: Option<&str>,
        touched_at: DateTime<Utc>,
    ) -> Result<Vec<Tag>> {
        self.upsert(db, &parse_tag_text(text), touched_at)
    }
}

impl Default for TagUpsertEngine {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now, CatalogDb};
    use crate::StoreError;
    use chrono::Duration;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tokenizer_splits_on_any_separator_run() {
        assert_eq!(parse_tag_text(Some("red, small")), set(&["red", "small"]));
        assert_eq!(
            parse_tag_text(Some(" a;;b ,\tc\n\nd ")),
            set(&["a", "b", "c", "d"])
        );
    }

    #[test]
    fn tokenizer_drops_empties_and_repeats() {
        assert!(parse_tag_text(None).is_empty());
        assert!(parse_tag_text(Some("")).is_empty());
        assert!(parse_tag_text(Some(" ,; \t")).is_empty());
        assert_eq!(parse_tag_text(Some("x x,x;x")), set(&["x"]));
    }

    #[test]
    fn tokenizer_keeps_case() {
        assert_eq!(parse_tag_text(Some("Red red")), set(&["Red", "red"]));
    }

    #[test]
    fn upsert_twice_keeps_one_row_per_name() {
        let db = CatalogDb::in_memory().unwrap();
        let engine = TagUpsertEngine::default();
        let first = now();

        let created = engine.upsert(&db, &set(&["a", "b"]), first).unwrap();
        let refreshed = engine
            .upsert(&db, &set(&["a", "b"]), first + Duration::seconds(1))
            .unwrap();

        assert_eq!(Tag::count(&db).unwrap(), 2);
        for (before, after) in created.iter().zip(&refreshed) {
            assert_eq!(before.name, after.name);
            assert_eq!(before.created_at, after.created_at);
            assert!(after.updated_at > before.updated_at);
        }
    }

    #[test]
    fn upsert_text_resolves_every_name_once() {
        let db = CatalogDb::in_memory().unwrap();
        let engine = TagUpsertEngine::default();
        let tags = engine
            .upsert_text(&db, Some("sky sea sky;sea"), now())
            .unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["sea", "sky"]);
    }

    #[test]
    fn failed_upsert_applies_nothing() {
        let mut db = CatalogDb::in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON tags WHEN NEW.name = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'tag storage unavailable'); END;",
            )
            .unwrap();
        let engine = TagUpsertEngine::default();

        let tx = db.write_transaction().unwrap();
        let err = engine
            .upsert(&tx, &set(&["alpha", "boom"]), now())
            .unwrap_err();
        drop(tx);

        assert!(matches!(err, StoreError::Persistence(_)));
        assert_eq!(Tag::count(&db).unwrap(), 0);
    }
}
