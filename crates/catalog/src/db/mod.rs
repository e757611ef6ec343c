//! ORM-style bindings for the catalog SQLite schema.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, ErrorCode, Row, Transaction};

pub mod db;
pub mod image_tags;
pub mod images;
pub mod repository;
pub mod tags;

pub use db::CatalogDb;
pub use image_tags::ImageTag;
pub use images::Image;
pub use repository::{ImageListing, ImageRepository, RecordSet};
pub use tags::Tag;

pub type DbResult<T> = anyhow::Result<T>;

/// Upper bound on bound parameters per generated statement.
pub(crate) const MAX_BATCH: usize = 400;

/// Common trait allowing modules to operate over either a `Connection` or `Transaction`.
pub trait DbHandle {
    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<usize>;
    fn prepare<'a>(&'a self, sql: &str) -> rusqlite::Result<rusqlite::Statement<'a>>;
    fn last_insert_rowid(&self) -> i64;

    fn query_row<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        f: impl FnOnce(&Row) -> DbResult<T>,
    ) -> DbResult<T>
    where
        Self: Sized,
    {
        query_one(self, sql, params, f)
    }
}

impl DbHandle for Connection {
    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<usize> {
        Connection::execute(self, sql, params)
    }

    fn prepare<'a>(&'a self, sql: &str) -> rusqlite::Result<rusqlite::Statement<'a>> {
        Connection::prepare(self, sql)
    }

    fn last_insert_rowid(&self) -> i64 {
        Connection::last_insert_rowid(self)
    }
}

impl<'a> DbHandle for Transaction<'a> {
    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<usize> {
        (**self).execute(sql, params)
    }

    fn prepare<'a_stmt>(
        &'a_stmt self,
        sql: &str,
    ) -> rusqlite::Result<rusqlite::Statement<'a_stmt>> {
        (**self).prepare(sql)
    }

    fn last_insert_rowid(&self) -> i64 {
        (**self).last_insert_rowid()
    }
}

/// Map a single row result to a typed value, returning an error when no rows are present.
pub fn query_one<T, H, P, F>(db: &H, sql: &str, params: P, map: F) -> DbResult<T>
where
    H: DbHandle + ?Sized,
    P: rusqlite::Params,
    F: FnOnce(&Row) -> DbResult<T>,
{
    let mut stmt = db.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let row = rows.next()?.context("query returned no rows")?;
    map(row)
}

/// Map at most one row result to a typed value.
pub fn query_optional<T, H, P, F>(db: &H, sql: &str, params: P, mut map: F) -> DbResult<Option<T>>
where
    H: DbHandle + ?Sized,
    P: rusqlite::Params,
    F: FnMut(&Row) -> DbResult<T>,
{
    let mut stmt = db.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(map(row)?)),
        None => Ok(None),
    }
}

/// Collect all rows from a query into a vector.
pub fn query_all<T, H, P, F>(db: &H, sql: &str, params: P, mut map: F) -> DbResult<Vec<T>>
where
    H: DbHandle + ?Sized,
    P: rusqlite::Params,
    F: FnMut(&Row) -> DbResult<T>,
{
    let mut stmt = db.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map(row)?);
    }
    Ok(out)
}

/// `?, ?, ?` with `count` placeholders.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// True when the error chain contains a SQLite constraint violation.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation
        )
    })
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(raw: String, field: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field} timestamp: {raw}"))
}
