use crate::db::DbResult;
use crate::schema::initialize_schema;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::DbHandle;

#[derive(Debug)]
pub struct CatalogDb {
    conn: Connection,
}

impl CatalogDb {
    /// Opens (creating if needed) the catalog at `path`. Lock waits are bounded by `busy_timeout`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Deferred transaction; used for reads so a listing observes one snapshot.
    pub fn transaction(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.conn.transaction()
    }

    /// Takes the write lock up front so read-then-write sequences cannot fail on lock upgrade.
    pub fn write_transaction(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
    }
}

impl DbHandle for CatalogDb {
    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<usize> {
        self.conn.execute(sql, params)
    }

    fn prepare<'a>(&'a self, sql: &str) -> rusqlite::Result<rusqlite::Statement<'a>> {
        self.conn.prepare(sql)
    }

    fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}
