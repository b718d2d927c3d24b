//! Fallback metadata enrichment for films created with partial records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MatchError, StoreError};
use crate::matching::MetadataProvider;
use crate::matching::similarity::normalize_for_match;
use crate::model::Film;
use crate::store::ScreeningStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub examined: usize,
    pub enriched: usize,
    pub failed: usize,
}

/// Fills missing poster, year, directors, genres and external ids for up to
/// `limit` films. Fields that already hold a value are never replaced.
/// Provider failures are counted per film; only store failures abort.
///
/// Films never checked go first, then the ones checked longest ago. Every
/// examined film is stamped with `now`, so films the provider cannot help
/// with move to the back instead of starving the rest.
pub async fn enrich_missing_metadata(
    store: &dyn ScreeningStore,
    provider: &dyn MetadataProvider,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<EnrichReport, StoreError> {
    let mut candidates: Vec<Film> = store
        .list_films()
        .await?
        .into_iter()
        .filter(|f| f.tmdb_id.is_none() || f.needs_enrichment())
        .collect();
    // None sorts first; the sort is stable so ties keep id order.
    candidates.sort_by_key(|f| f.metadata_checked_at);
    candidates.truncate(limit);

    let mut report = EnrichReport::default();
    for film in candidates {
        report.examined += 1;
        let mut next = match enrich_one(provider, &film).await {
            Ok(Some(enriched)) if enriched != film => {
                debug!(film = %film.id, "enriched");
                report.enriched += 1;
                enriched
            }
            Ok(_) => film.clone(),
            Err(e) => {
                warn!(film = %film.id, title = %film.title, error = %e, "enrichment failed");
                report.failed += 1;
                film.clone()
            }
        };
        next.metadata_checked_at = Some(now);
        store.update_film(&next).await?;
    }
    info!(
        examined = report.examined,
        enriched = report.enriched,
        failed = report.failed,
        "enrichment finished"
    );
    Ok(report)
}

async fn enrich_one(provider: &dyn MetadataProvider, film: &Film) -> Result<Option<Film>, MatchError> {
    let tmdb_id = match film.tmdb_id {
        Some(id) => id,
        None => match find_tmdb_id(provider, film).await? {
            Some(id) => id,
            None => return Ok(None),
        },
    };

    let details = provider.get_film_details(tmdb_id).await?;
    let mut directors = details.film.directors.clone();
    if directors.is_empty() {
        for person_id in &details.director_ids {
            match provider.get_person_details(*person_id).await {
                Ok(person) => directors.push(person.name),
                Err(e) => debug!(person_id, error = %e, "director lookup failed"),
            }
        }
    }

    let source = details.film;
    let mut next = film.clone();
    next.tmdb_id = Some(tmdb_id);
    next.year = next.year.or(source.year);
    next.poster_url = next.poster_url.or(source.poster_url);
    next.backdrop_url = next.backdrop_url.or(source.backdrop_url);
    next.synopsis = next.synopsis.or(source.synopsis);
    next.runtime_minutes = next.runtime_minutes.or(source.runtime_minutes);
    next.imdb_id = next.imdb_id.or(source.imdb_id);
    if next.directors.is_empty() {
        next.directors = directors;
    }
    if next.genres.is_empty() {
        next.genres = source.genres;
    }
    Ok(Some(next))
}

/// Provider id for a film created without one: only an unambiguous
/// same-title, same-year candidate is accepted.
async fn find_tmdb_id(provider: &dyn MetadataProvider, film: &Film) -> Result<Option<u64>, MatchError> {
    let wanted = normalize_for_match(&film.title);
    let hits: Vec<u64> = provider
        .search_films(&film.title, film.year)
        .await?
        .into_iter()
        .filter(|c| normalize_for_match(&c.title) == wanted)
        .filter(|c| film.year.is_none() || c.year == film.year)
        .filter_map(|c| c.tmdb_id)
        .collect();
    Ok(match hits.as_slice() {
        [only] => Some(*only),
        _ => None,
    })
}
