//! Scraper for the Rio Cinema (Dalston).
//! Listing: https://riocinema.org.uk/Rio.dll/WhatsOn
//! The page is rendered client-side from a JSON object assigned in an inline
//! script (`var Events = {...}`); we lift that object out of the raw HTML.

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::debug;

use super::{london_to_utc, parse_clock};
use crate::error::ScrapeError;
use crate::http::absolute_url;
use crate::model::{Availability, EventType, RawScreening, VenueDefinition};
use crate::{ScrapeContext, VenueScraper};

const WHATS_ON_PATH: &str = "/Rio.dll/WhatsOn";
const EVENTS_NEEDLE: &str = "var Events =";

/// Extract the JSON object assigned after `needle` (balanced braces, quote aware).
fn extract_embedded_json(html: &str, needle: &str) -> Option<serde_json::Value> {
    let start = html.find(needle)?;
    let after = &html[start + needle.len()..];
    let obj_start = after.find('{')?;
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escape = false;
    let mut quote = 0u8;
    let bytes = &after.as_bytes()[obj_start..];
    let mut end = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            if b == b'\\' {
                escape = true;
            } else if b == quote {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => {
                in_string = true;
                quote = b;
            }
            b'{' => depth += 1,
            b'}' => {
                if depth == 1 {
                    end = i + 1;
                    break;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    if end == 0 {
        return None;
    }
    let json_str = &after[obj_start..obj_start + end];
    serde_json::from_str(json_str).ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RioEvents {
    events: Vec<RioEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RioEvent {
    #[serde(rename = "ID")]
    id: String,
    title: String,
    #[serde(default)]
    director: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    strapline: String,
    #[serde(default)]
    season: String,
    #[serde(default)]
    performances: Vec<RioPerformance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RioPerformance {
    #[serde(rename = "ID")]
    id: String,
    start_date: String,
    start_time: String,
    #[serde(default)]
    is_sold_out: String,
    #[serde(default)]
    auditorium_name: String,
    #[serde(default)]
    notes: String,
    #[serde(default, rename = "URL")]
    url: String,
}

pub struct RioScraper {
    venue: VenueDefinition,
}

impl RioScraper {
    pub fn new(venue: VenueDefinition) -> Self {
        Self { venue }
    }
}

#[async_trait::async_trait]
impl VenueScraper for RioScraper {
    fn venue(&self) -> &VenueDefinition {
        &self.venue
    }

    fn health_marker(&self) -> &str {
        "Rio Cinema"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError> {
        let url = absolute_url(&self.venue.base_url, WHATS_ON_PATH);
        let body = ctx.http.get_text(&url).await?;
        parse_whats_on(&body, &self.venue)
    }
}

fn parse_whats_on(html: &str, venue: &VenueDefinition) -> Result<Vec<RawScreening>, ScrapeError> {
    // A page without the blob parses to zero rows; the health monitor catches that.
    let Some(value) = extract_embedded_json(html, EVENTS_NEEDLE) else {
        debug!(venue = %venue.id, "no embedded events object");
        return Ok(Vec::new());
    };
    let events: RioEvents = serde_json::from_value(value)?;
    let booking_base = format!("{}/Rio.dll/", venue.base_url.trim_end_matches('/'));

    let mut screenings = Vec::new();
    for event in events.events {
        let title = event.title.trim().to_string();
        if title.is_empty() {
            continue;
        }
        for perf in &event.performances {
            let Ok(date) = NaiveDate::parse_from_str(perf.start_date.trim(), "%Y-%m-%d") else {
                continue;
            };
            let Some(time) = parse_performance_time(&perf.start_time) else {
                continue;
            };
            let Some(start) = london_to_utc(date.and_time(time)) else {
                continue;
            };
            let booking_url = if perf.url.trim().is_empty() {
                String::new()
            } else {
                absolute_url(&booking_base, &perf.url)
            };

            let mut screening = RawScreening::new(&venue.id, title.clone(), start, booking_url);
            screening.screen = Some(perf.auditorium_name.trim().to_string()).filter(|s| !s.is_empty());
            screening.availability = if perf.is_sold_out.eq_ignore_ascii_case("y") {
                Availability::SoldOut
            } else {
                Availability::Available
            };
            screening.year = event.year.trim().parse().ok();
            screening.director = Some(event.director.trim().to_string()).filter(|s| !s.is_empty());
            let notes = perf.notes.trim();
            if !notes.is_empty() {
                screening.event_description = Some(notes.to_string());
                screening.event_type = notes
                    .trim_start_matches('+')
                    .split(['+', ','])
                    .find_map(EventType::from_hint);
            }
            screening.festival_slug = Some(slugify(&event.season)).filter(|s| !s.is_empty());
            screening.listing_text = Some(event.strapline.trim().to_string()).filter(|s| !s.is_empty());
            screening.source_id = format!("rio-{}-{}", event.id, perf.id);
            screenings.push(screening);
        }
    }
    Ok(screenings)
}

/// Rio writes times as "1900"; tolerate "19:00" too.
fn parse_performance_time(text: &str) -> Option<NaiveTime> {
    parse_clock(text)
}

fn slugify(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
