//! High-level store operations that sit above the raw row bindings.

pub mod catalog_service;
pub mod image_store;
pub mod query;
pub mod tag_upsert;

use crate::db::CatalogDb;
use crate::{Result, StoreError};
use std::sync::{Arc, Mutex, MutexGuard};

/// One SQLite connection shared by the components of a service.
pub type SharedDb = Arc<Mutex<CatalogDb>>;

pub(crate) fn lock(db: &SharedDb) -> Result<MutexGuard<'_, CatalogDb>> {
    db.lock()
        .map_err(|_| StoreError::Persistence(anyhow::anyhow!("catalog connection lock poisoned")))
}
