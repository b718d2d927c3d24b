//! Domain records shared by every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matching::normalize_for_match;
use crate::venues::ScraperKind;

/// How a venue's listings have to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStrategy {
    /// Plain HTTP fetch and markup parsing.
    Static,
    /// Full browser automation for JS-rendered or bot-protected sites.
    Browser,
}

/// Static venue configuration, loaded once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueDefinition {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub extra_urls: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub strategy: ScrapeStrategy,
    pub scraper: ScraperKind,
    /// Site code for venues served from a chain's shared ticketing API.
    #[serde(default)]
    pub site_code: Option<String>,
    /// Overrides the health monitor's default tolerance band for this venue.
    #[serde(default)]
    pub tolerance_percent: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    SellingFast,
    SoldOut,
    #[default]
    Unknown,
}

/// Structured event classification attached to a screening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    KidsScreening,
    Premiere,
    Preview,
    QAndA,
    Intro,
    Discussion,
    SingAlong,
    DoubleBill,
    Marathon,
    Festival,
    Classic,
}

impl EventType {
    pub fn label(&self) -> &'static str {
        match self {
            EventType::KidsScreening => "kids screening",
            EventType::Premiere => "premiere",
            EventType::Preview => "preview",
            EventType::QAndA => "q&a",
            EventType::Intro => "intro",
            EventType::Discussion => "discussion",
            EventType::SingAlong => "sing-along",
            EventType::DoubleBill => "double bill",
            EventType::Marathon => "marathon",
            EventType::Festival => "festival",
            EventType::Classic => "classic",
        }
    }

    /// Lenient parse of free-text hints ("Q&A", "premiere", "kids").
    pub fn from_hint(hint: &str) -> Option<Self> {
        let h = hint.trim().to_lowercase();
        let event = match h.as_str() {
            "kids" | "kids screening" | "kids club" | "family" => EventType::KidsScreening,
            "premiere" | "uk premiere" | "world premiere" | "european premiere" => {
                EventType::Premiere
            }
            "preview" | "preview screening" => EventType::Preview,
            "q&a" | "qa" | "q & a" => EventType::QAndA,
            "intro" | "introduction" => EventType::Intro,
            "discussion" | "panel" | "talk" => EventType::Discussion,
            "sing-along" | "singalong" | "sing along" => EventType::SingAlong,
            "double bill" | "double-bill" => EventType::DoubleBill,
            "marathon" | "all-nighter" => EventType::Marathon,
            "festival" => EventType::Festival,
            "classic" | "revival" => EventType::Classic,
            _ => return None,
        };
        Some(event)
    }
}

/// Unvalidated listing row produced by a venue scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScreening {
    pub venue_id: String,
    pub title: String,
    /// Venue-local wall time converted to an absolute instant.
    pub start: DateTime<Utc>,
    pub screen: Option<String>,
    pub format: Option<String>,
    pub event_type: Option<EventType>,
    pub event_description: Option<String>,
    pub booking_url: String,
    pub year: Option<i32>,
    pub director: Option<String>,
    pub festival_slug: Option<String>,
    pub availability: Availability,
    /// Free text around the listing (credits line, blurb) scanned for hints.
    pub listing_text: Option<String>,
    /// Stable id within one run, used for deduplication.
    pub source_id: String,
}

impl RawScreening {
    pub fn new(
        venue_id: &str,
        title: impl Into<String>,
        start: DateTime<Utc>,
        booking_url: impl Into<String>,
    ) -> Self {
        let booking_url = booking_url.into();
        let title = title.into();
        // Scrapers with a performance id overwrite this.
        let source_id = format!(
            "{}-{}-{}",
            venue_id,
            start.timestamp(),
            normalize_for_match(&title).replace(' ', "-")
        );
        Self {
            venue_id: venue_id.to_string(),
            title,
            start,
            screen: None,
            format: None,
            event_type: None,
            event_description: None,
            source_id,
            booking_url,
            year: None,
            director: None,
            festival_slug: None,
            availability: Availability::Unknown,
            listing_text: None,
        }
    }
}

/// Canonical film record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Film {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    #[serde(default)]
    pub directors: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub synopsis: Option<String>,
    pub runtime_minutes: Option<u32>,
    pub tmdb_id: Option<u64>,
    pub imdb_id: Option<String>,
    /// Last time fallback enrichment looked at this film, whatever the result.
    #[serde(default)]
    pub metadata_checked_at: Option<DateTime<Utc>>,
}

impl Film {
    /// True when any field the fallback enrichment can fill is missing.
    pub fn needs_enrichment(&self) -> bool {
        self.tmdb_id.is_some()
            && (self.poster_url.is_none()
                || self.year.is_none()
                || self.directors.is_empty()
                || self.genres.is_empty()
                || self.imdb_id.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cinema {
    pub id: String,
    pub name: String,
    pub website: String,
    pub address: Option<String>,
    pub features: Vec<String>,
}

impl From<&VenueDefinition> for Cinema {
    fn from(def: &VenueDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            website: def.base_url.clone(),
            address: def.address.clone(),
            features: def.features.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Normalized,
    Fuzzy,
    Ai,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Normalized => "normalized",
            MatchStrategy::Fuzzy => "fuzzy",
            MatchStrategy::Ai => "ai",
        }
    }
}

/// Result of title resolution for one screening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFilm {
    pub film_id: String,
    pub canonical_title: String,
    pub year: Option<i32>,
    pub confidence: f64,
    pub strategy: MatchStrategy,
    /// Confidence cleared the auto-apply threshold for this strategy.
    pub auto_apply: bool,
    /// Set when the film came from the metadata provider and does not exist yet.
    pub new_film: Option<Film>,
    /// Event classification reported by the title extractor, if any.
    #[serde(default)]
    pub event_hint: Option<EventType>,
}

/// Business key of a persisted screening.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScreeningKey {
    pub venue_id: String,
    pub film_id: String,
    pub start: DateTime<Utc>,
}

impl std::fmt::Display for ScreeningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.venue_id, self.film_id, self.start.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screening {
    pub venue_id: String,
    pub film_id: String,
    pub start: DateTime<Utc>,
    pub screen: Option<String>,
    pub format: Option<String>,
    pub event_type: Option<EventType>,
    pub event_description: Option<String>,
    pub booking_url: String,
    pub availability: Availability,
    pub source_id: String,
    pub manually_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Screening {
    pub fn key(&self) -> ScreeningKey {
        ScreeningKey {
            venue_id: self.venue_id.clone(),
            film_id: self.film_id.clone(),
            start: self.start,
        }
    }
}

/// Rolling screening-count baseline kept by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueBaseline {
    pub venue_id: String,
    pub weekday_avg: f64,
    pub weekend_avg: f64,
    pub samples: u32,
    pub tolerance_percent: Option<f64>,
    /// Operator-pinned baseline; automatic updates leave the averages alone.
    pub manual_override: bool,
    /// Optimistic concurrency token, bumped on every write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}
