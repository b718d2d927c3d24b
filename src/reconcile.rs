//! Merges one venue's resolved screenings into the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::model::{Cinema, ResolvedFilm, Screening, ScreeningKey, VenueDefinition};
use crate::normalize::NormalizedScreening;
use crate::store::ScreeningStore;

/// A normalized screening whose film resolution cleared auto-apply.
#[derive(Debug, Clone)]
pub struct MatchedScreening {
    pub screening: NormalizedScreening,
    pub film: ResolvedFilm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Manually edited screenings where the scrape disagreed on a protected
    /// field.
    pub protected: usize,
    pub failed: usize,
    /// Upcoming screenings of this venue that the run no longer lists. They
    /// are reported, not deleted.
    pub stale: usize,
}

enum Change {
    Added,
    Updated,
    Unchanged,
    Protected { updated: bool },
}

pub struct Reconciler {
    store: Arc<dyn ScreeningStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ScreeningStore>) -> Self {
        Self { store }
    }

    /// Applies `items` inside a transaction scoped to the venue. Rejected
    /// records are counted in `failed`; a store failure rolls the venue back
    /// and is returned.
    pub async fn reconcile(
        &self,
        venue: &VenueDefinition,
        items: &[MatchedScreening],
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.store.begin(&venue.id).await?;
        match self.apply(venue, items, now).await {
            Ok(outcome) => {
                if let Err(e) = self.store.commit(&venue.id).await {
                    self.abandon(&venue.id).await;
                    return Err(e);
                }
                info!(
                    venue = %venue.id,
                    added = outcome.added,
                    updated = outcome.updated,
                    unchanged = outcome.unchanged,
                    protected = outcome.protected,
                    failed = outcome.failed,
                    stale = outcome.stale,
                    "reconciled"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.abandon(&venue.id).await;
                Err(e)
            }
        }
    }

    /// Best-effort rollback; the venue must not be left with an open scope.
    async fn abandon(&self, venue_id: &str) {
        if let Err(rollback) = self.store.rollback(venue_id).await {
            warn!(venue = venue_id, error = %rollback, "rollback failed");
        }
    }

    async fn apply(
        &self,
        venue: &VenueDefinition,
        items: &[MatchedScreening],
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.store.ensure_cinema(&Cinema::from(venue)).await?;

        let mut outcome = ReconcileOutcome::default();
        let mut seen: HashSet<ScreeningKey> = HashSet::new();
        for item in items {
            match self.apply_one(venue, item, now).await {
                Ok((change, key)) => {
                    seen.insert(key);
                    match change {
                        Change::Added => outcome.added += 1,
                        Change::Updated => outcome.updated += 1,
                        Change::Unchanged => outcome.unchanged += 1,
                        Change::Protected { updated } => {
                            outcome.protected += 1;
                            if updated {
                                outcome.updated += 1;
                            } else {
                                outcome.unchanged += 1;
                            }
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        venue = %venue.id,
                        title = %item.screening.raw.title,
                        error = %e,
                        "screening rejected"
                    );
                    outcome.failed += 1;
                }
            }
        }

        let stale: Vec<Screening> = self
            .store
            .list_screenings(Some(&venue.id))
            .await?
            .into_iter()
            .filter(|s| s.start > now && !seen.contains(&s.key()))
            .collect();
        for s in &stale {
            debug!(venue = %venue.id, key = %s.key(), "no longer listed");
        }
        outcome.stale = stale.len();
        Ok(outcome)
    }

    async fn apply_one(
        &self,
        venue: &VenueDefinition,
        item: &MatchedScreening,
        now: DateTime<Utc>,
    ) -> Result<(Change, ScreeningKey), StoreError> {
        if let Some(film) = &item.film.new_film {
            self.store.ensure_film(film).await?;
        }

        let incoming = incoming_screening(venue, item, now);
        let key = incoming.key();
        let existing = match self.store.find_screening(&key).await? {
            Some(found) => Some(found),
            // Same listing under a new start time.
            None => {
                self.store
                    .find_by_source(&venue.id, &incoming.source_id)
                    .await?
            }
        };

        let Some(current) = existing else {
            self.store.upsert_screening(&incoming).await?;
            return Ok((Change::Added, key));
        };

        if current.manually_edited {
            return self.merge_protected(current, &incoming).await;
        }

        if current.key() == key && same_content(&current, &incoming) {
            return Ok((Change::Unchanged, key));
        }
        let next = Screening {
            created_at: current.created_at,
            ..incoming
        };
        if current.key() != key {
            debug!(from = %current.key(), to = %key, "screening re-timed");
            self.store.delete_screening(&current.key()).await?;
        }
        self.store.upsert_screening(&next).await?;
        Ok((Change::Updated, key))
    }

    /// Only availability, booking link and description follow the scrape.
    async fn merge_protected(
        &self,
        current: Screening,
        incoming: &Screening,
    ) -> Result<(Change, ScreeningKey), StoreError> {
        let key = current.key();
        let conflicts = current.start != incoming.start
            || current.screen != incoming.screen
            || current.format != incoming.format
            || current.event_type != incoming.event_type;
        if conflicts {
            info!(
                key = %key,
                scraped_start = %incoming.start,
                scraped_screen = ?incoming.screen,
                "manually edited screening, protected fields kept"
            );
        }

        let changed = current.availability != incoming.availability
            || current.booking_url != incoming.booking_url
            || current.event_description != incoming.event_description;
        if changed {
            let next = Screening {
                availability: incoming.availability,
                booking_url: incoming.booking_url.clone(),
                event_description: incoming.event_description.clone(),
                updated_at: incoming.updated_at,
                ..current
            };
            self.store.upsert_screening(&next).await?;
        }

        let change = if conflicts {
            Change::Protected { updated: changed }
        } else if changed {
            Change::Updated
        } else {
            Change::Unchanged
        };
        Ok((change, key))
    }
}

fn incoming_screening(venue: &VenueDefinition, item: &MatchedScreening, now: DateTime<Utc>) -> Screening {
    let s = &item.screening;
    Screening {
        venue_id: venue.id.clone(),
        film_id: item.film.film_id.clone(),
        start: s.raw.start,
        screen: s.raw.screen.clone(),
        format: s.format.clone(),
        event_type: s.event_type.or(item.film.event_hint),
        event_description: s.event_description.clone(),
        booking_url: s.raw.booking_url.clone(),
        availability: s.raw.availability,
        source_id: s.raw.source_id.clone(),
        manually_edited: false,
        edited_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Equal in everything a scrape can set.
fn same_content(a: &Screening, b: &Screening) -> bool {
    a.screen == b.screen
        && a.format == b.format
        && a.event_type == b.event_type
        && a.event_description == b.event_description
        && a.booking_url == b.booking_url
        && a.availability == b.availability
        && a.source_id == b.source_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, Film, MatchStrategy, RawScreening};
    use crate::normalize::{Normalizer, default_patterns};
    use crate::store::InMemoryStore;
    use crate::venues::ScraperKind;
    use crate::venues::test_support::{utc, venue};

    fn now() -> DateTime<Utc> {
        utc("2025-01-05T12:00:00Z")
    }

    fn film(id: &str, title: &str) -> Film {
        Film {
            id: id.to_string(),
            title: title.to_string(),
            ..Film::default()
        }
    }

    fn item(film_id: &str, start: &str, source_id: &str, screen: &str) -> MatchedScreening {
        let mut raw = RawScreening::new("ica", "Casablanca", utc(start), "https://www.ica.art/book/1");
        raw.source_id = source_id.to_string();
        raw.screen = Some(screen.to_string());
        raw.availability = Availability::Available;
        let normalizer = Normalizer::new(&default_patterns()).unwrap();
        MatchedScreening {
            screening: normalizer.normalize(raw),
            film: ResolvedFilm {
                film_id: film_id.to_string(),
                canonical_title: "Casablanca".into(),
                year: Some(1942),
                confidence: 1.0,
                strategy: MatchStrategy::Exact,
                auto_apply: true,
                new_film: None,
                event_hint: None,
            },
        }
    }

    async fn setup() -> (Arc<InMemoryStore>, Reconciler, VenueDefinition) {
        let store = Arc::new(InMemoryStore::new());
        store.ensure_film(&film("f1", "Casablanca")).await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        (store, reconciler, venue("ica", ScraperKind::Ica, "https://www.ica.art"))
    }

    #[tokio::test]
    async fn second_identical_run_changes_nothing() {
        let (store, reconciler, venue) = setup().await;
        let items = vec![
            item("f1", "2025-01-06T19:00:00Z", "a", "Cinema 1"),
            item("f1", "2025-01-07T19:00:00Z", "b", "Cinema 1"),
        ];

        let first = reconciler.reconcile(&venue, &items, now()).await.unwrap();
        assert_eq!(first.added, 2);

        let second = reconciler.reconcile(&venue, &items, now()).await.unwrap();
        assert_eq!((second.added, second.updated, second.unchanged), (0, 0, 2));
        assert_eq!(store.list_screenings(Some("ica")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn manual_screen_edit_survives() {
        let (store, reconciler, venue) = setup().await;
        let original = item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1");
        reconciler.reconcile(&venue, &[original], now()).await.unwrap();

        let key = ScreeningKey {
            venue_id: "ica".into(),
            film_id: "f1".into(),
            start: utc("2025-01-06T19:00:00Z"),
        };
        let mut edited = store.find_screening(&key).await.unwrap().unwrap();
        edited.manually_edited = true;
        edited.edited_at = Some(now());
        store.upsert_screening(&edited).await.unwrap();

        let mut proposal = item("f1", "2025-01-06T19:00:00Z", "a", "Screen 2");
        proposal.screening.raw.availability = Availability::SoldOut;
        let outcome = reconciler.reconcile(&venue, &[proposal], now()).await.unwrap();

        let stored = store.find_screening(&key).await.unwrap().unwrap();
        assert_eq!(stored.screen.as_deref(), Some("Screen 1"));
        assert_eq!(stored.availability, Availability::SoldOut);
        assert_eq!((outcome.protected, outcome.updated), (1, 1));
    }

    #[tokio::test]
    async fn manual_start_is_not_moved_by_a_retimed_listing() {
        let (store, reconciler, venue) = setup().await;
        reconciler
            .reconcile(&venue, &[item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1")], now())
            .await
            .unwrap();
        let mut edited = store.find_by_source("ica", "a").await.unwrap().unwrap();
        edited.manually_edited = true;
        store.upsert_screening(&edited).await.unwrap();

        let outcome = reconciler
            .reconcile(&venue, &[item("f1", "2025-01-06T20:30:00Z", "a", "Screen 1")], now())
            .await
            .unwrap();
        let all = store.list_screenings(Some("ica")).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].start, utc("2025-01-06T19:00:00Z"));
        assert_eq!(outcome.protected, 1);
        assert_eq!(outcome.added, 0);
    }

    #[tokio::test]
    async fn unedited_retime_moves_the_screening() {
        let (store, reconciler, venue) = setup().await;
        reconciler
            .reconcile(&venue, &[item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1")], now())
            .await
            .unwrap();
        let outcome = reconciler
            .reconcile(&venue, &[item("f1", "2025-01-06T20:30:00Z", "a", "Screen 1")], now())
            .await
            .unwrap();

        let all = store.list_screenings(Some("ica")).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].start, utc("2025-01-06T20:30:00Z"));
        assert_eq!((outcome.added, outcome.updated, outcome.stale), (0, 1, 0));
    }

    #[tokio::test]
    async fn new_films_are_created_and_bad_rows_counted() {
        let (store, reconciler, venue) = setup().await;
        let mut fresh = item("tmdb-653", "2025-01-06T21:00:00Z", "b", "Screen 2");
        fresh.film.new_film = Some(film("tmdb-653", "Nosferatu"));
        let orphan = item("missing", "2025-01-06T22:00:00Z", "c", "Screen 2");
        let items = vec![item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1"), fresh, orphan];

        let outcome = reconciler.reconcile(&venue, &items, now()).await.unwrap();
        assert_eq!((outcome.added, outcome.failed), (2, 1));
        assert!(store.get_film("tmdb-653").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn vanished_listings_are_reported_not_deleted() {
        let (store, reconciler, venue) = setup().await;
        let items = vec![
            item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1"),
            item("f1", "2025-01-07T19:00:00Z", "b", "Screen 1"),
        ];
        reconciler.reconcile(&venue, &items, now()).await.unwrap();
        let outcome = reconciler.reconcile(&venue, &items[..1], now()).await.unwrap();
        assert_eq!(outcome.stale, 1);
        assert_eq!(store.list_screenings(Some("ica")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_is_fatal() {
        let (store, reconciler, venue) = setup().await;
        store.set_offline(true);
        let result = reconciler
            .reconcile(&venue, &[item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1")], now())
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_frees_the_venue() {
        let (store, reconciler, venue) = setup().await;
        let items = vec![item("f1", "2025-01-06T19:00:00Z", "a", "Screen 1")];

        store.reject_next_commit();
        let failed = reconciler.reconcile(&venue, &items, now()).await;
        assert!(matches!(failed, Err(StoreError::Unavailable(_))));
        assert!(store.list_screenings(Some("ica")).await.unwrap().is_empty());

        let retried = reconciler.reconcile(&venue, &items, now()).await.unwrap();
        assert_eq!(retried.added, 1);
        assert_eq!(store.list_screenings(Some("ica")).await.unwrap().len(), 1);
    }
}
