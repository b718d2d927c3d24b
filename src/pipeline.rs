//! Per-venue runs and the bounded concurrent batch.
//!
//! A run goes scrape → validate → normalize → resolve → health check →
//! reconcile → baseline update. Any failure ends that venue's run with
//! `success = false`; the batch carries on with the others.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::browser::BrowserLauncher;
use crate::browser::playwright::PlaywrightLauncher;
use crate::config::Config;
use crate::error::{MatchError, PipelineError};
use crate::health::{HealthAssessment, HealthMonitor};
use crate::http::PoliteClient;
use crate::matching::{LlmExtractor, Resolution, TitleCache, TitleResolver, TmdbClient};
use crate::model::{Film, ResolvedFilm, ScrapeStrategy};
use crate::normalize::{NormalizedScreening, Normalizer};
use crate::reconcile::{MatchedScreening, Reconciler};
use crate::store::ScreeningStore;
use crate::venues::validate_screenings;
use crate::{ScrapeContext, VenueScraper};

/// A screening held back because its title could not be matched with
/// enough confidence.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub raw_title: String,
    pub cleaned_title: String,
    pub start: DateTime<Utc>,
    pub booking_url: String,
    pub reason: String,
    pub best: Option<ResolvedFilm>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub venue_id: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub scraped: usize,
    pub valid: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub protected: usize,
    pub failed: usize,
    pub stale: usize,
    pub needs_review: Vec<ReviewItem>,
    /// The health monitor held the run; nothing was reconciled.
    pub blocked: bool,
    /// Matched screenings not applied because the run was blocked.
    pub held: usize,
    pub anomaly: bool,
    pub health: Option<HealthAssessment>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RunResult {
    fn new(venue_id: &str, triggered_by: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            venue_id: venue_id.to_string(),
            triggered_by: triggered_by.to_string(),
            started_at,
            success: false,
            scraped: 0,
            valid: 0,
            added: 0,
            updated: 0,
            unchanged: 0,
            protected: 0,
            failed: 0,
            stale: 0,
            needs_review: Vec::new(),
            blocked: false,
            held: 0,
            anomaly: false,
            health: None,
            duration_ms: 0,
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    http: Arc<PoliteClient>,
    browser: Arc<dyn BrowserLauncher>,
    store: Arc<dyn ScreeningStore>,
    normalizer: Arc<Normalizer>,
    resolver: Arc<TitleResolver>,
    reconciler: Arc<Reconciler>,
    health: Arc<HealthMonitor>,
    scrapers: HashMap<String, Arc<dyn VenueScraper>>,
    venue_slots: Arc<Semaphore>,
    browser_slots: Arc<Semaphore>,
    clock: fn() -> DateTime<Utc>,
}

impl Pipeline {
    /// Wires the production collaborators. Missing provider or extractor
    /// credentials are logged and matching runs without them.
    pub fn new(config: Config, store: Arc<dyn ScreeningStore>) -> Result<Self, PipelineError> {
        let normalizer = Arc::new(Normalizer::from_config(&config.normalize)?);

        let mut resolver = TitleResolver::new(config.matching.clone(), normalizer.clone());
        match TmdbClient::from_config(&config.tmdb) {
            Ok(client) => resolver = resolver.with_provider(Arc::new(client)),
            Err(e) => warn!(error = %e, "metadata provider disabled"),
        }
        match LlmExtractor::from_config(&config.ai) {
            Ok(extractor) => resolver = resolver.with_extractor(Arc::new(extractor)),
            Err(MatchError::NotConfigured(what)) => info!("{what} not configured, mechanical fallback only"),
            Err(e) => warn!(error = %e, "title extractor disabled"),
        }
        if let Some(path) = &config.ai.cache_path {
            match TitleCache::load(path) {
                Ok(cache) => resolver = resolver.with_cache(Arc::new(cache)),
                Err(e) => warn!(path, error = %e, "title cache unreadable, starting empty"),
            }
        }

        let http = Arc::new(PoliteClient::new(&config.scrape)?);
        let browser: Arc<dyn BrowserLauncher> = Arc::new(PlaywrightLauncher::from_config(&config.browser));
        let health = HealthMonitor::new(store.clone(), config.health.clone());
        Ok(Self::assemble(config, store, http, browser, normalizer, resolver, health))
    }

    pub fn assemble(
        config: Config,
        store: Arc<dyn ScreeningStore>,
        http: Arc<PoliteClient>,
        browser: Arc<dyn BrowserLauncher>,
        normalizer: Arc<Normalizer>,
        resolver: TitleResolver,
        health: HealthMonitor,
    ) -> Self {
        let scrapers: HashMap<String, Arc<dyn VenueScraper>> = config
            .venues
            .iter()
            .map(|v| (v.id.clone(), Arc::<dyn VenueScraper>::from(v.scraper.build(v.clone()))))
            .collect();
        Self {
            venue_slots: Arc::new(Semaphore::new(config.pipeline.max_concurrent_venues)),
            browser_slots: Arc::new(Semaphore::new(config.pipeline.max_concurrent_browsers)),
            config: Arc::new(config),
            http,
            browser,
            reconciler: Arc::new(Reconciler::new(store.clone())),
            store,
            normalizer,
            resolver: Arc::new(resolver),
            health: Arc::new(health),
            scrapers,
            clock: Utc::now,
        }
    }

    /// Replaces the scraper registered for a venue.
    pub fn with_scraper(mut self, venue_id: &str, scraper: Arc<dyn VenueScraper>) -> Self {
        self.scrapers.insert(venue_id.to_string(), scraper);
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ScreeningStore> {
        &self.store
    }

    pub fn context(&self, now: DateTime<Utc>) -> ScrapeContext {
        ScrapeContext {
            http: self.http.clone(),
            browser: self.browser.clone(),
            scrape: self.config.scrape.clone(),
            browser_config: self.config.browser.clone(),
            now,
        }
    }

    pub fn scraper(&self, venue_id: &str) -> Result<Arc<dyn VenueScraper>, PipelineError> {
        self.scrapers
            .get(venue_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownVenue(venue_id.to_string()))
    }

    /// Checks a venue's site is reachable without scraping it.
    pub async fn health_check(&self, venue_id: &str) -> Result<bool, PipelineError> {
        let scraper = self.scraper(venue_id)?;
        Ok(scraper.health_check(&self.context((self.clock)())).await)
    }

    pub async fn run_venue(&self, venue_id: &str, triggered_by: &str) -> RunResult {
        let started = Instant::now();
        let now = (self.clock)();
        let mut result = RunResult::new(venue_id, triggered_by, now);
        let span = info_span!("venue_run", venue = venue_id, run = %result.run_id, triggered_by);

        match self.execute(venue_id, now, &mut result).instrument(span).await {
            Ok(()) => result.success = true,
            Err(e) => {
                error!(venue = venue_id, error = %e, "venue run failed");
                self.health.report_failure(venue_id, &e.to_string(), now).await;
                result.error = Some(e.to_string());
            }
        }
        let cache = self.resolver.cache().clone();
        match tokio::task::spawn_blocking(move || cache.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "title cache not saved"),
            Err(e) => warn!(error = %e, "title cache save task failed"),
        }
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    /// Runs venues concurrently, at most `max_concurrent_venues` at a time
    /// and at most `max_concurrent_browsers` browser venues among them.
    /// Results come back in input order.
    pub async fn run_batch(&self, venue_ids: &[String], triggered_by: &str) -> Vec<RunResult> {
        let mut handles = Vec::new();
        for venue_id in venue_ids {
            let pipeline = self.clone();
            let venue_id = venue_id.clone();
            let triggered_by = triggered_by.to_string();
            let slots = self.venue_slots.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    let mut result = RunResult::new(&venue_id, &triggered_by, (pipeline.clock)());
                    result.error = Some(PipelineError::Shutdown.to_string());
                    return result;
                };
                pipeline.run_venue(&venue_id, &triggered_by).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, venue_id) in handles.into_iter().zip(venue_ids) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(venue = %venue_id, error = %e, "venue task panicked");
                    let mut result = RunResult::new(venue_id, triggered_by, (self.clock)());
                    result.error = Some(format!("task panicked: {e}"));
                    results.push(result);
                }
            }
        }
        let ok = results.iter().filter(|r| r.success).count();
        info!(venues = results.len(), ok, failed = results.len() - ok, "batch finished");
        results
    }

    /// Ids of every enabled venue, in configuration order.
    pub fn enabled_venues(&self) -> Vec<String> {
        self.config
            .venues
            .iter()
            .filter(|v| v.enabled)
            .map(|v| v.id.clone())
            .collect()
    }

    async fn execute(
        &self,
        venue_id: &str,
        now: DateTime<Utc>,
        result: &mut RunResult,
    ) -> Result<(), PipelineError> {
        let venue = self
            .config
            .venue(venue_id)
            .ok_or_else(|| PipelineError::UnknownVenue(venue_id.to_string()))?;
        if !venue.enabled {
            return Err(PipelineError::Disabled(venue_id.to_string()));
        }
        let scraper = self.scraper(venue_id)?;

        // One browser context per browser venue, capped separately.
        let _browser_permit = match venue.strategy {
            ScrapeStrategy::Browser => Some(
                self.browser_slots
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Shutdown)?,
            ),
            ScrapeStrategy::Static => None,
        };

        let ctx = self.context(now);
        let budget = self.config.pipeline.venue_timeout_secs;
        let raw = tokio::time::timeout(Duration::from_secs(budget), async {
            if let Err(e) = scraper.warm_up(&ctx).await {
                warn!(error = %e, "warm-up failed, scraping anyway");
            }
            scraper.scrape(&ctx).await
        })
        .await
        .map_err(|_| PipelineError::Timeout(budget))??;
        result.scraped = raw.len();

        let valid = validate_screenings(raw, now);
        result.valid = valid.len();
        let normalized: Vec<NormalizedScreening> =
            valid.into_iter().map(|r| self.normalizer.normalize(r)).collect();

        let matched = self.resolve_all(normalized, result).await?;

        let assessment = self.health.assess(venue, result.valid, now).await?;
        self.health.report(&assessment, now).await;
        result.anomaly = assessment.anomaly_detected;
        result.blocked = assessment.should_block;
        let blocked = assessment.should_block;
        result.health = Some(assessment);
        if blocked {
            result.held = matched.len();
            warn!(held = result.held, "run held for review, nothing applied");
            return Ok(());
        }

        let outcome = self.reconciler.reconcile(venue, &matched, now).await?;
        result.added = outcome.added;
        result.updated = outcome.updated;
        result.unchanged = outcome.unchanged;
        result.protected = outcome.protected;
        result.failed = outcome.failed;
        result.stale = outcome.stale;

        if let Err(e) = self.health.record(&venue.id, result.valid, now).await {
            warn!(error = %e, "baseline not updated");
        }
        info!(
            scraped = result.scraped,
            valid = result.valid,
            added = result.added,
            updated = result.updated,
            review = result.needs_review.len(),
            "venue run complete"
        );
        Ok(())
    }

    /// Resolves titles one at a time. Films created by earlier matches join
    /// the catalog, and repeated listings of one title are resolved once.
    async fn resolve_all(
        &self,
        normalized: Vec<NormalizedScreening>,
        result: &mut RunResult,
    ) -> Result<Vec<MatchedScreening>, PipelineError> {
        let mut catalog: Vec<Film> = self.store.list_films().await?;
        let mut seen: HashMap<(String, Option<i32>, Option<String>), Resolution> = HashMap::new();
        let mut matched = Vec::new();

        for screening in normalized {
            let memo_key = (
                screening.raw.title.clone(),
                screening.year_hint,
                screening.director_hint.clone(),
            );
            let resolution = match seen.get(&memo_key) {
                Some(known) => known.clone(),
                None => {
                    let fresh = self.resolver.resolve(&screening, &catalog).await;
                    seen.insert(memo_key, fresh.clone());
                    fresh
                }
            };

            // Conflicting event markers: keep the film guess but let a human pick the event.
            let resolution = match resolution {
                Resolution::Matched(film) if screening.ambiguous => Resolution::NeedsReview {
                    reason: format!(
                        "several event patterns matched \"{}\", event type needs confirmation",
                        screening.raw.title
                    ),
                    best: Some(film),
                },
                other => other,
            };

            match resolution {
                Resolution::Matched(film) => {
                    if let Some(new_film) = &film.new_film
                        && !catalog.iter().any(|f| f.id == new_film.id)
                    {
                        catalog.push(new_film.clone());
                    }
                    matched.push(MatchedScreening { screening, film });
                }
                Resolution::NeedsReview { reason, best } => {
                    result.needs_review.push(ReviewItem {
                        raw_title: screening.raw.title.clone(),
                        cleaned_title: screening.title.clone(),
                        start: screening.raw.start,
                        booking_url: screening.raw.booking_url.clone(),
                        reason,
                        best,
                    });
                }
            }
        }
        Ok(matched)
    }
}
