//! Persistence interface for cinemas, films, screenings and health baselines.
//!
//! The pipeline never assumes a storage engine. Two implementations ship
//! with the crate: [`InMemoryStore`] for tests and dry runs, and
//! [`JsonFileStore`] which persists the same state to a single JSON document.

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Cinema, Film, Screening, ScreeningKey, VenueBaseline};

#[async_trait]
pub trait ScreeningStore: Send + Sync {
    /// Creates the cinema if absent. Returns whether it was created.
    async fn ensure_cinema(&self, cinema: &Cinema) -> Result<bool, StoreError>;

    /// Creates the film if no film with its id exists. Returns whether it was
    /// created; an existing record is left as it is.
    async fn ensure_film(&self, film: &Film) -> Result<bool, StoreError>;

    async fn get_film(&self, id: &str) -> Result<Option<Film>, StoreError>;

    async fn list_films(&self) -> Result<Vec<Film>, StoreError>;

    async fn update_film(&self, film: &Film) -> Result<(), StoreError>;

    async fn find_screening(&self, key: &ScreeningKey) -> Result<Option<Screening>, StoreError>;

    async fn find_by_source(&self, venue_id: &str, source_id: &str) -> Result<Option<Screening>, StoreError>;

    /// Inserts or replaces the screening stored under its business key. The
    /// referenced cinema and film must exist.
    async fn upsert_screening(&self, screening: &Screening) -> Result<(), StoreError>;

    async fn delete_screening(&self, key: &ScreeningKey) -> Result<bool, StoreError>;

    /// All screenings, or one venue's, ordered by business key.
    async fn list_screenings(&self, venue_id: Option<&str>) -> Result<Vec<Screening>, StoreError>;

    /// Removes screenings starting before `cutoff`; returns how many went.
    async fn delete_screenings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn get_baseline(&self, venue_id: &str) -> Result<Option<VenueBaseline>, StoreError>;

    /// Compare-and-set write. `expected_version` is the version the caller
    /// read (`None` when there was no baseline). On success the stored record
    /// carries the next version and is returned.
    async fn set_baseline(
        &self,
        baseline: &VenueBaseline,
        expected_version: Option<u64>,
    ) -> Result<VenueBaseline, StoreError>;

    /// Opens a transaction scope covering one venue's screenings.
    async fn begin(&self, venue_id: &str) -> Result<(), StoreError>;

    async fn commit(&self, venue_id: &str) -> Result<(), StoreError>;

    /// Restores the venue's screenings to their state at `begin`. The scope
    /// is screenings only: cinemas and films are shared by every venue, so
    /// films created during the transaction stay in the catalog.
    async fn rollback(&self, venue_id: &str) -> Result<(), StoreError>;
}

/// Serialized form of a whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub cinemas: Vec<Cinema>,
    #[serde(default)]
    pub films: Vec<Film>,
    #[serde(default)]
    pub screenings: Vec<Screening>,
    #[serde(default)]
    pub baselines: Vec<VenueBaseline>,
}

/// Writes `contents` to a uniquely named sibling temp file, then renames it
/// over `path`. Readers see the old file or the new one, never a torn write.
pub(crate) fn write_atomically(path: &Path, contents: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            debug!(tmp = %tmp.display(), error = %cleanup, "stale temp file left behind");
        }
        return Err(e.into());
    }
    Ok(())
}
