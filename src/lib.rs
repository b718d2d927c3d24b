pub mod browser;
pub mod cleanup;
pub mod config;
pub mod enrich;
pub mod error;
pub mod health;
pub mod http;
pub mod logging;
pub mod matching;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod venues;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::browser::BrowserLauncher;
use crate::config::{BrowserConfig, ScrapeConfig};
use crate::error::ScrapeError;
use crate::http::PoliteClient;
pub use crate::model::{RawScreening, VenueDefinition};

/// Everything a scraper may touch during one run.
#[derive(Clone)]
pub struct ScrapeContext {
    pub http: Arc<PoliteClient>,
    pub browser: Arc<dyn BrowserLauncher>,
    pub scrape: ScrapeConfig,
    pub browser_config: BrowserConfig,
    /// Reference instant for "past screening" checks and year inference.
    pub now: DateTime<Utc>,
}

/// Trait that all venue scrapers implement.
#[async_trait::async_trait]
pub trait VenueScraper: Send + Sync {
    fn venue(&self) -> &VenueDefinition;

    /// Fetch and parse the venue's listings. Output is unvalidated; the
    /// pipeline runs [`venues::validate_screenings`] over it.
    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError>;

    /// Optional: warm-up request to get cookies/session (default: no-op)
    async fn warm_up(&self, _ctx: &ScrapeContext) -> Result<(), ScrapeError> {
        Ok(())
    }

    /// Text that a healthy homepage is expected to contain.
    fn health_marker(&self) -> &str {
        &self.venue().name
    }

    /// Lightweight reachability check, independent of a full scrape.
    async fn health_check(&self, ctx: &ScrapeContext) -> bool {
        let venue = self.venue();
        match ctx.http.get_text(&venue.base_url).await {
            Ok(body) => {
                let healthy = body.to_lowercase().contains(&self.health_marker().to_lowercase());
                debug!(venue = %venue.id, healthy, "health check");
                healthy
            }
            Err(e) => {
                warn!(venue = %venue.id, error = %e, "health check failed");
                false
            }
        }
    }
}
