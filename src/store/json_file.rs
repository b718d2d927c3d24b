use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{InMemoryStore, ScreeningStore, StoreDocument, write_atomically};
use crate::error::StoreError;
use crate::model::{Cinema, Film, Screening, ScreeningKey, VenueBaseline};

/// Store kept in memory and written back to one JSON file. Writes made inside
/// a venue transaction reach the disk on commit; everything else is flushed
/// immediately.
pub struct JsonFileStore {
    inner: InMemoryStore,
    path: PathBuf,
    /// Serializes flushes so the newest snapshot is always the last one renamed.
    flush_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<StoreDocument>(&content)?
        } else {
            StoreDocument::default()
        };
        info!(
            path = %path.display(),
            films = doc.films.len(),
            screenings = doc.screenings.len(),
            "store opened"
        );
        Ok(Self {
            inner: InMemoryStore::from_document(doc),
            path,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the whole document through a uniquely named temp file and a
    /// rename, off the async worker threads.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.flush_lock.lock().await;
        let json = serde_json::to_string_pretty(&self.inner.to_document())?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(std::io::Error::other)??;
        debug!(path = %self.path.display(), "store flushed");
        Ok(())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        if self.inner.has_open_transactions() {
            return Ok(());
        }
        self.flush().await
    }
}

#[async_trait]
impl ScreeningStore for JsonFileStore {
    async fn ensure_cinema(&self, cinema: &Cinema) -> Result<bool, StoreError> {
        let created = self.inner.ensure_cinema(cinema).await?;
        if created {
            self.persist().await?;
        }
        Ok(created)
    }

    async fn ensure_film(&self, film: &Film) -> Result<bool, StoreError> {
        let created = self.inner.ensure_film(film).await?;
        if created {
            self.persist().await?;
        }
        Ok(created)
    }

    async fn get_film(&self, id: &str) -> Result<Option<Film>, StoreError> {
        self.inner.get_film(id).await
    }

    async fn list_films(&self) -> Result<Vec<Film>, StoreError> {
        self.inner.list_films().await
    }

    async fn update_film(&self, film: &Film) -> Result<(), StoreError> {
        self.inner.update_film(film).await?;
        self.persist().await
    }

    async fn find_screening(&self, key: &ScreeningKey) -> Result<Option<Screening>, StoreError> {
        self.inner.find_screening(key).await
    }

    async fn find_by_source(&self, venue_id: &str, source_id: &str) -> Result<Option<Screening>, StoreError> {
        self.inner.find_by_source(venue_id, source_id).await
    }

    async fn upsert_screening(&self, screening: &Screening) -> Result<(), StoreError> {
        self.inner.upsert_screening(screening).await?;
        self.persist().await
    }

    async fn delete_screening(&self, key: &ScreeningKey) -> Result<bool, StoreError> {
        let removed = self.inner.delete_screening(key).await?;
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn list_screenings(&self, venue_id: Option<&str>) -> Result<Vec<Screening>, StoreError> {
        self.inner.list_screenings(venue_id).await
    }

    async fn delete_screenings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.inner.delete_screenings_before(cutoff).await?;
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn get_baseline(&self, venue_id: &str) -> Result<Option<VenueBaseline>, StoreError> {
        self.inner.get_baseline(venue_id).await
    }

    async fn set_baseline(
        &self,
        baseline: &VenueBaseline,
        expected_version: Option<u64>,
    ) -> Result<VenueBaseline, StoreError> {
        let stored = self.inner.set_baseline(baseline, expected_version).await?;
        self.persist().await?;
        Ok(stored)
    }

    async fn begin(&self, venue_id: &str) -> Result<(), StoreError> {
        self.inner.begin(venue_id).await
    }

    async fn commit(&self, venue_id: &str) -> Result<(), StoreError> {
        self.inner.commit(venue_id).await?;
        self.persist().await
    }

    async fn rollback(&self, venue_id: &str) -> Result<(), StoreError> {
        self.inner.rollback(venue_id).await?;
        self.persist().await
    }
}
