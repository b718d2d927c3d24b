use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{ScreeningStore, StoreDocument};
use crate::error::StoreError;
use crate::model::{Cinema, Film, Screening, ScreeningKey, VenueBaseline};

#[derive(Debug, Default)]
struct State {
    cinemas: HashMap<String, Cinema>,
    films: HashMap<String, Film>,
    screenings: BTreeMap<ScreeningKey, Screening>,
    baselines: HashMap<String, VenueBaseline>,
    /// Per-venue snapshots taken at `begin`.
    open: HashMap<String, Vec<Screening>>,
}

/// In-memory storage for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
    reject_commit: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: StoreDocument) -> Self {
        let state = State {
            cinemas: doc.cinemas.into_iter().map(|c| (c.id.clone(), c)).collect(),
            films: doc.films.into_iter().map(|f| (f.id.clone(), f)).collect(),
            screenings: doc.screenings.into_iter().map(|s| (s.key(), s)).collect(),
            baselines: doc
                .baselines
                .into_iter()
                .map(|b| (b.venue_id.clone(), b))
                .collect(),
            open: HashMap::new(),
        };
        Self {
            state: Mutex::new(state),
            offline: AtomicBool::new(false),
            reject_commit: AtomicBool::new(false),
        }
    }

    pub fn to_document(&self) -> StoreDocument {
        let state = self.lock();
        let mut cinemas: Vec<Cinema> = state.cinemas.values().cloned().collect();
        cinemas.sort_by(|a, b| a.id.cmp(&b.id));
        let mut films: Vec<Film> = state.films.values().cloned().collect();
        films.sort_by(|a, b| a.id.cmp(&b.id));
        let mut baselines: Vec<VenueBaseline> = state.baselines.values().cloned().collect();
        baselines.sort_by(|a, b| a.venue_id.cmp(&b.venue_id));
        StoreDocument {
            cinemas,
            films,
            screenings: state.screenings.values().cloned().collect(),
            baselines,
        }
    }

    /// Simulates an outage: while set, every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `commit` fail as if the store dropped the connection.
    /// The transaction stays open, as it would on a real backend.
    pub fn reject_next_commit(&self) {
        self.reject_commit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_open_transactions(&self) -> bool {
        !self.lock().open.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(self.lock())
    }
}

#[async_trait]
impl ScreeningStore for InMemoryStore {
    async fn ensure_cinema(&self, cinema: &Cinema) -> Result<bool, StoreError> {
        let mut state = self.online()?;
        if state.cinemas.contains_key(&cinema.id) {
            return Ok(false);
        }
        state.cinemas.insert(cinema.id.clone(), cinema.clone());
        debug!(cinema = %cinema.id, "created cinema");
        Ok(true)
    }

    async fn ensure_film(&self, film: &Film) -> Result<bool, StoreError> {
        if film.id.trim().is_empty() || film.title.trim().is_empty() {
            return Err(StoreError::Invalid("film needs an id and a title".to_string()));
        }
        let mut state = self.online()?;
        if state.films.contains_key(&film.id) {
            return Ok(false);
        }
        state.films.insert(film.id.clone(), film.clone());
        debug!(film = %film.id, title = %film.title, "created film");
        Ok(true)
    }

    async fn get_film(&self, id: &str) -> Result<Option<Film>, StoreError> {
        Ok(self.online()?.films.get(id).cloned())
    }

    async fn list_films(&self) -> Result<Vec<Film>, StoreError> {
        let mut films: Vec<Film> = self.online()?.films.values().cloned().collect();
        films.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(films)
    }

    async fn update_film(&self, film: &Film) -> Result<(), StoreError> {
        let mut state = self.online()?;
        match state.films.get_mut(&film.id) {
            Some(existing) => {
                *existing = film.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("film {}", film.id))),
        }
    }

    async fn find_screening(&self, key: &ScreeningKey) -> Result<Option<Screening>, StoreError> {
        Ok(self.online()?.screenings.get(key).cloned())
    }

    async fn find_by_source(&self, venue_id: &str, source_id: &str) -> Result<Option<Screening>, StoreError> {
        Ok(self
            .online()?
            .screenings
            .values()
            .find(|s| s.venue_id == venue_id && s.source_id == source_id)
            .cloned())
    }

    async fn upsert_screening(&self, screening: &Screening) -> Result<(), StoreError> {
        if screening.booking_url.trim().is_empty() {
            return Err(StoreError::Invalid(format!("screening {} has no booking url", screening.key())));
        }
        let mut state = self.online()?;
        if !state.cinemas.contains_key(&screening.venue_id) {
            return Err(StoreError::Invalid(format!("unknown cinema {}", screening.venue_id)));
        }
        if !state.films.contains_key(&screening.film_id) {
            return Err(StoreError::Invalid(format!("unknown film {}", screening.film_id)));
        }
        state.screenings.insert(screening.key(), screening.clone());
        Ok(())
    }

    async fn delete_screening(&self, key: &ScreeningKey) -> Result<bool, StoreError> {
        Ok(self.online()?.screenings.remove(key).is_some())
    }

    async fn list_screenings(&self, venue_id: Option<&str>) -> Result<Vec<Screening>, StoreError> {
        Ok(self
            .online()?
            .screenings
            .values()
            .filter(|s| venue_id.is_none_or(|v| s.venue_id == v))
            .cloned()
            .collect())
    }

    async fn delete_screenings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.online()?;
        let before = state.screenings.len();
        state.screenings.retain(|_, s| s.start >= cutoff);
        Ok(before - state.screenings.len())
    }

    async fn get_baseline(&self, venue_id: &str) -> Result<Option<VenueBaseline>, StoreError> {
        Ok(self.online()?.baselines.get(venue_id).cloned())
    }

    async fn set_baseline(
        &self,
        baseline: &VenueBaseline,
        expected_version: Option<u64>,
    ) -> Result<VenueBaseline, StoreError> {
        let mut state = self.online()?;
        let found = state.baselines.get(&baseline.venue_id).map(|b| b.version);
        if found != expected_version {
            return Err(StoreError::VersionConflict {
                key: baseline.venue_id.clone(),
                expected: expected_version,
                found,
            });
        }
        let stored = VenueBaseline {
            version: found.map_or(1, |v| v + 1),
            ..baseline.clone()
        };
        state.baselines.insert(stored.venue_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn begin(&self, venue_id: &str) -> Result<(), StoreError> {
        let mut state = self.online()?;
        if state.open.contains_key(venue_id) {
            return Err(StoreError::Transaction(format!("transaction already open for {venue_id}")));
        }
        let snapshot: Vec<Screening> = state
            .screenings
            .values()
            .filter(|s| s.venue_id == venue_id)
            .cloned()
            .collect();
        state.open.insert(venue_id.to_string(), snapshot);
        Ok(())
    }

    async fn commit(&self, venue_id: &str) -> Result<(), StoreError> {
        let mut state = self.online()?;
        if self.reject_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("commit for {venue_id} was not acknowledged")));
        }
        state
            .open
            .remove(venue_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction(format!("no open transaction for {venue_id}")))
    }

    async fn rollback(&self, venue_id: &str) -> Result<(), StoreError> {
        // Rollback must work during an outage too, so it skips the online check.
        let mut state = self.lock();
        let snapshot = state
            .open
            .remove(venue_id)
            .ok_or_else(|| StoreError::Transaction(format!("no open transaction for {venue_id}")))?;
        state.screenings.retain(|_, s| s.venue_id != venue_id);
        for screening in snapshot {
            state.screenings.insert(screening.key(), screening);
        }
        debug!(venue = venue_id, "rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Availability;
    use crate::venues::test_support::utc;

    fn cinema(id: &str) -> Cinema {
        Cinema {
            id: id.to_string(),
            name: id.to_uppercase(),
            website: format!("https://{id}.example"),
            address: None,
            features: Vec::new(),
        }
    }

    fn film(id: &str) -> Film {
        Film {
            id: id.to_string(),
            title: format!("Film {id}"),
            ..Film::default()
        }
    }

    fn screening(venue: &str, film: &str, start: &str) -> Screening {
        let start = utc(start);
        Screening {
            venue_id: venue.to_string(),
            film_id: film.to_string(),
            start,
            screen: None,
            format: None,
            event_type: None,
            event_description: None,
            booking_url: "https://b/1".to_string(),
            availability: Availability::Unknown,
            source_id: format!("{venue}-{}", start.timestamp()),
            manually_edited: false,
            edited_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = InMemoryStore::new();
        assert!(store.ensure_cinema(&cinema("ica")).await.unwrap());
        assert!(!store.ensure_cinema(&cinema("ica")).await.unwrap());
        assert!(store.ensure_film(&film("f1")).await.unwrap());

        let mut renamed = film("f1");
        renamed.title = "Other".into();
        assert!(!store.ensure_film(&renamed).await.unwrap());
        assert_eq!(store.get_film("f1").await.unwrap().unwrap().title, "Film f1");
    }

    #[tokio::test]
    async fn screenings_need_their_cinema_and_film() {
        let store = InMemoryStore::new();
        let s = screening("ica", "f1", "2025-01-06T19:00:00Z");
        assert!(matches!(store.upsert_screening(&s).await, Err(StoreError::Invalid(_))));

        store.ensure_cinema(&cinema("ica")).await.unwrap();
        store.ensure_film(&film("f1")).await.unwrap();
        store.upsert_screening(&s).await.unwrap();
        store.upsert_screening(&s).await.unwrap();
        assert_eq!(store.list_screenings(Some("ica")).await.unwrap().len(), 1);
        assert!(store.find_by_source("ica", &s.source_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn baseline_writes_are_versioned() {
        let store = InMemoryStore::new();
        let baseline = VenueBaseline {
            venue_id: "ica".into(),
            weekday_avg: 40.0,
            weekend_avg: 40.0,
            samples: 1,
            tolerance_percent: None,
            manual_override: false,
            version: 0,
            updated_at: utc("2025-01-06T19:00:00Z"),
        };
        let v1 = store.set_baseline(&baseline, None).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = store.set_baseline(&v1, Some(1)).await.unwrap();
        assert_eq!(v2.version, 2);

        // A writer still holding version 1 loses.
        let stale = store.set_baseline(&v1, Some(1)).await;
        assert!(matches!(
            stale,
            Err(StoreError::VersionConflict {
                expected: Some(1),
                found: Some(2),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn rollback_restores_only_that_venue() {
        let store = InMemoryStore::new();
        for c in ["ica", "rio"] {
            store.ensure_cinema(&cinema(c)).await.unwrap();
        }
        store.ensure_film(&film("f1")).await.unwrap();
        let kept = screening("ica", "f1", "2025-01-06T19:00:00Z");
        store.upsert_screening(&kept).await.unwrap();

        store.begin("ica").await.unwrap();
        assert!(store.begin("ica").await.is_err());
        store
            .upsert_screening(&screening("ica", "f1", "2025-01-07T19:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_screening(&screening("rio", "f1", "2025-01-07T19:00:00Z"))
            .await
            .unwrap();
        store.rollback("ica").await.unwrap();

        assert_eq!(store.list_screenings(Some("ica")).await.unwrap(), vec![kept]);
        assert_eq!(store.list_screenings(Some("rio")).await.unwrap().len(), 1);
        assert!(!store.has_open_transactions());
    }

    #[tokio::test]
    async fn films_created_in_a_rolled_back_transaction_stay() {
        let store = InMemoryStore::new();
        store.ensure_cinema(&cinema("ica")).await.unwrap();
        store.begin("ica").await.unwrap();
        store.ensure_film(&film("f9")).await.unwrap();
        store
            .upsert_screening(&screening("ica", "f9", "2025-01-07T19:00:00Z"))
            .await
            .unwrap();
        store.rollback("ica").await.unwrap();

        assert!(store.list_screenings(Some("ica")).await.unwrap().is_empty());
        assert!(store.get_film("f9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn offline_store_fails_fast() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.ensure_cinema(&cinema("ica")).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
