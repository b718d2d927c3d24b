//! Title resolution: maps a cleaned listing title onto a catalog film.
//!
//! Tiers run strictly in order and the first success wins: exact, then
//! normalized, then fuzzy, first against films already in the store and then
//! against provider candidates. Titles the normalizer flagged as noisy get a
//! second chance through the [`TitleExtractor`].

pub mod extractor;
pub mod similarity;
pub mod tmdb;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MatchingConfig;
use crate::model::{Film, MatchStrategy, ResolvedFilm};
use crate::normalize::{NormalizedScreening, Normalizer};

pub use extractor::{ExtractedTitle, LlmExtractor, TitleCache, TitleExtractor};
pub use similarity::{normalize_for_match, token_sort_ratio};
pub use tmdb::{MetadataProvider, TmdbClient};

/// Outcome for one screening.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched(ResolvedFilm),
    /// Nothing cleared its auto-apply threshold. The screening is neither
    /// linked nor created until someone looks at it.
    NeedsReview {
        reason: String,
        best: Option<ResolvedFilm>,
    },
}

struct Query<'a> {
    title: &'a str,
    year: Option<i32>,
    director: Option<&'a str>,
}

struct TierMatch {
    index: usize,
    confidence: f64,
    strategy: MatchStrategy,
}

pub struct TitleResolver {
    config: MatchingConfig,
    normalizer: Arc<Normalizer>,
    provider: Option<Arc<dyn MetadataProvider>>,
    extractor: Option<Arc<dyn TitleExtractor>>,
    cache: Arc<TitleCache>,
}

impl TitleResolver {
    pub fn new(config: MatchingConfig, normalizer: Arc<Normalizer>) -> Self {
        Self {
            config,
            normalizer,
            provider: None,
            extractor: None,
            cache: Arc::new(TitleCache::in_memory()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TitleExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_cache(mut self, cache: Arc<TitleCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<TitleCache> {
        &self.cache
    }

    pub async fn resolve(&self, screening: &NormalizedScreening, catalog: &[Film]) -> Resolution {
        let query = Query {
            title: &screening.title,
            year: screening.year_hint,
            director: screening.director_hint.as_deref(),
        };
        let mechanical = self.resolve_title(&query, catalog).await;

        // A noisy title only short-circuits on an exact or normalized hit.
        if let Some(found) = &mechanical
            && found.auto_apply
            && (screening.likely_clean || found.strategy != MatchStrategy::Fuzzy)
        {
            return Resolution::Matched(found.clone());
        }

        if !screening.likely_clean {
            // The assisted result decides for noisy titles, even when it is
            // only the low-confidence fallback.
            let assisted = self.resolve_with_extractor(screening, catalog, mechanical.as_ref()).await;
            return match assisted {
                Some(found) if found.auto_apply => Resolution::Matched(found),
                Some(found) => review(Some(found)),
                None => review(mechanical),
            };
        }

        review(mechanical)
    }

    /// Tiers 1-3 against the local catalog, then against provider candidates.
    async fn resolve_title(&self, query: &Query<'_>, catalog: &[Film]) -> Option<ResolvedFilm> {
        let local = self
            .match_tiers(query, catalog)
            .map(|m| self.resolved(&catalog[m.index], m, None));
        // Only a title-equality hit settles it locally; a fuzzy near-namesake
        // must not hide an exact provider match.
        if let Some(found) = &local
            && found.strategy != MatchStrategy::Fuzzy
        {
            return local;
        }

        let Some(provider) = &self.provider else {
            return local;
        };
        let mut candidates = match provider.search_films(query.title, query.year).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(title = query.title, error = %e, "metadata provider unavailable, local matching only");
                return local;
            }
        };
        candidates.truncate(self.config.max_provider_candidates);
        let remote = self.match_tiers(query, &candidates).map(|m| {
            let candidate = &candidates[m.index];
            // Already in the catalog under the same provider id: link, don't create.
            match catalog
                .iter()
                .find(|f| f.tmdb_id.is_some() && f.tmdb_id == candidate.tmdb_id)
            {
                Some(existing) => self.resolved(existing, m, None),
                None => self.resolved(candidate, m, Some(candidate.clone())),
            }
        });

        match (local, remote) {
            (Some(l), Some(r)) if outranks(&r, &l) => Some(r),
            (Some(l), _) => Some(l),
            (None, r) => r,
        }
    }

    async fn resolve_with_extractor(
        &self,
        screening: &NormalizedScreening,
        catalog: &[Film],
        mechanical: Option<&ResolvedFilm>,
    ) -> Option<ResolvedFilm> {
        let raw = screening.raw.title.as_str();
        let (title, ceiling, event) = match self.extract_cached(raw).await {
            Some(extracted) => (extracted.title, extracted.confidence, extracted.event),
            None => (
                self.normalizer.clean_title(raw).title,
                self.config.fallback_confidence,
                None,
            ),
        };

        let found = if title == screening.title {
            mechanical.cloned()
        } else {
            let query = Query {
                title: &title,
                year: screening.year_hint,
                director: screening.director_hint.as_deref(),
            };
            self.resolve_title(&query, catalog).await
        }?;

        let confidence = found.confidence.min(ceiling);
        debug!(raw, extracted = %title, confidence, "extractor-assisted match");
        Some(ResolvedFilm {
            confidence,
            strategy: MatchStrategy::Ai,
            auto_apply: confidence >= self.config.ai_auto_apply,
            event_hint: event.or(found.event_hint),
            ..found
        })
    }

    /// Cached extraction; `None` when there is no extractor or it failed.
    async fn extract_cached(&self, raw: &str) -> Option<ExtractedTitle> {
        if let Some(hit) = self.cache.get(raw) {
            return Some(hit);
        }
        let extractor = self.extractor.as_ref()?;
        match extractor.extract(raw).await {
            Ok(extracted) => {
                self.cache.insert(raw, extracted.clone());
                Some(extracted)
            }
            Err(e) => {
                warn!(raw, error = %e, "title extraction failed, using mechanical cleanup");
                None
            }
        }
    }

    fn match_tiers(&self, query: &Query<'_>, films: &[Film]) -> Option<TierMatch> {
        let eligible: Vec<usize> = films
            .iter()
            .enumerate()
            .filter(|(_, f)| years_compatible(query.year, f.year, self.config.year_tolerance))
            .map(|(i, _)| i)
            .collect();

        let exact: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&i| films[i].title == query.title)
            .collect();
        if !exact.is_empty() {
            return Some(TierMatch {
                index: prefer_director(&exact, films, query.director),
                confidence: 1.0,
                strategy: MatchStrategy::Exact,
            });
        }

        let wanted = normalize_for_match(query.title);
        if wanted.is_empty() {
            return None;
        }
        let normalized: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&i| normalize_for_match(&films[i].title) == wanted)
            .collect();
        if !normalized.is_empty() {
            return Some(TierMatch {
                index: prefer_director(&normalized, films, query.director),
                confidence: self.config.normalized_confidence,
                strategy: MatchStrategy::Normalized,
            });
        }

        let scored: Vec<(usize, f64)> = eligible
            .iter()
            .map(|&i| (i, token_sort_ratio(query.title, &films[i].title)))
            .filter(|(_, score)| *score >= self.config.fuzzy_floor)
            .collect();
        let best = scored.iter().map(|(_, s)| *s).fold(f64::NAN, f64::max);
        if best.is_nan() {
            return None;
        }
        let tied: Vec<usize> = scored
            .iter()
            .filter(|(_, s)| (best - *s).abs() < 1e-9)
            .map(|(i, _)| *i)
            .collect();
        Some(TierMatch {
            index: prefer_director(&tied, films, query.director),
            confidence: best,
            strategy: MatchStrategy::Fuzzy,
        })
    }

    fn resolved(&self, film: &Film, m: TierMatch, new_film: Option<Film>) -> ResolvedFilm {
        let auto_apply = match m.strategy {
            MatchStrategy::Exact | MatchStrategy::Normalized => true,
            MatchStrategy::Fuzzy => m.confidence >= self.config.fuzzy_auto_apply,
            MatchStrategy::Ai => m.confidence >= self.config.ai_auto_apply,
        };
        ResolvedFilm {
            film_id: film.id.clone(),
            canonical_title: film.title.clone(),
            year: film.year,
            confidence: m.confidence,
            strategy: m.strategy,
            auto_apply,
            new_film,
            event_hint: None,
        }
    }
}

fn review(best: Option<ResolvedFilm>) -> Resolution {
    let reason = match &best {
        Some(found) => format!(
            "{} match on \"{}\" at {:.2} is below the auto-apply threshold",
            found.strategy.as_str(),
            found.canonical_title,
            found.confidence
        ),
        None => "no catalog or provider match".to_string(),
    };
    Resolution::NeedsReview { reason, best }
}

/// Earlier tiers beat later ones; confidence only decides within a tier.
fn outranks(a: &ResolvedFilm, b: &ResolvedFilm) -> bool {
    fn tier(strategy: MatchStrategy) -> u8 {
        match strategy {
            MatchStrategy::Exact => 0,
            MatchStrategy::Normalized => 1,
            MatchStrategy::Fuzzy => 2,
            MatchStrategy::Ai => 3,
        }
    }
    match tier(a.strategy).cmp(&tier(b.strategy)) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a.confidence > b.confidence,
    }
}

fn years_compatible(hint: Option<i32>, film: Option<i32>, tolerance: i32) -> bool {
    match (hint, film) {
        (Some(a), Some(b)) => (a - b).abs() <= tolerance,
        _ => true,
    }
}

/// Among equally good candidates, the one whose director matches the hint.
fn prefer_director(candidates: &[usize], films: &[Film], director: Option<&str>) -> usize {
    if let Some(hint) = director
        && let Some(&i) = candidates
            .iter()
            .find(|&&i| films[i].directors.iter().any(|d| similarity::same_person(hint, d)))
    {
        return i;
    }
    candidates[0]
}
