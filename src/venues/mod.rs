//! Venue scrapers and the postprocessing every scrape shares.

pub mod bfi_southbank;
pub mod curzon;
pub mod ica;
pub mod prince_charles;
pub mod rio;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::London;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::error::ScrapeError;
use crate::model::{RawScreening, ScrapeStrategy, VenueDefinition};
use crate::VenueScraper;

/// The closed set of implemented venue scrapers. Configuration names one of
/// these per venue; anything else is rejected when the config is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperKind {
    Ica,
    PrinceCharles,
    Rio,
    Curzon,
    BfiSouthbank,
}

impl ScraperKind {
    pub fn strategy(&self) -> ScrapeStrategy {
        match self {
            ScraperKind::Ica | ScraperKind::PrinceCharles | ScraperKind::Rio | ScraperKind::Curzon => {
                ScrapeStrategy::Static
            }
            ScraperKind::BfiSouthbank => ScrapeStrategy::Browser,
        }
    }

    pub fn build(&self, venue: VenueDefinition) -> Box<dyn VenueScraper> {
        match self {
            ScraperKind::Ica => Box::new(ica::IcaScraper::new(venue)),
            ScraperKind::PrinceCharles => Box::new(prince_charles::PrinceCharlesScraper::new(venue)),
            ScraperKind::Rio => Box::new(rio::RioScraper::new(venue)),
            ScraperKind::Curzon => Box::new(curzon::CurzonScraper::new(venue)),
            ScraperKind::BfiSouthbank => Box::new(bfi_southbank::BfiSouthbankScraper::new(venue)),
        }
    }
}

/// Drops rows with an empty title, a start in the past or no booking link,
/// and keeps only the first row per `source_id`. Input order is preserved.
pub fn validate_screenings(raw: Vec<RawScreening>, now: DateTime<Utc>) -> Vec<RawScreening> {
    let total = raw.len();
    let mut seen = HashSet::new();
    let valid: Vec<RawScreening> = raw
        .into_iter()
        .filter(|s| !s.title.trim().is_empty())
        .filter(|s| s.start > now)
        .filter(|s| !s.booking_url.trim().is_empty())
        .filter(|s| seen.insert(s.source_id.clone()))
        .collect();
    debug!(total, valid = valid.len(), "validated screenings");
    valid
}

/// Converts a London wall-clock time to an absolute instant. Ambiguous
/// times (autumn clock change) take the earlier offset; times skipped by
/// the spring change are rejected.
pub fn london_to_utc(local: NaiveDateTime) -> Option<DateTime<Utc>> {
    London
        .from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Picks the year for a day/month printed without one: the nearest
/// occurrence that is not more than a week in the past.
pub fn infer_year(month: u32, day: u32, now: DateTime<Utc>) -> Option<NaiveDate> {
    let today = now.with_timezone(&London).date_naive();
    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day);
    match this_year {
        Some(date) if date >= today - chrono::Duration::days(7) => Some(date),
        _ => NaiveDate::from_ymd_opt(today.year() + 1, month, day),
    }
}

/// Parses "7:00 pm", "19:00", "7pm", "1900".
pub fn parse_clock(text: &str) -> Option<NaiveTime> {
    let t = text.trim().to_lowercase().replace('.', ":");
    let (body, pm, am) = if let Some(b) = t.strip_suffix("pm") {
        (b.trim().to_string(), true, false)
    } else if let Some(b) = t.strip_suffix("am") {
        (b.trim().to_string(), false, true)
    } else {
        (t.clone(), false, false)
    };
    let (h, m) = if let Some((h, m)) = body.split_once(':') {
        (h.trim().parse::<u32>().ok()?, m.trim().parse::<u32>().ok()?)
    } else if body.len() == 4 && body.chars().all(|c| c.is_ascii_digit()) {
        (body[..2].parse().ok()?, body[2..].parse().ok()?)
    } else {
        (body.parse::<u32>().ok()?, 0)
    };
    let h = match (h, pm, am) {
        (12, false, true) => 0,
        (h, true, _) if h < 12 => h + 12,
        (h, _, _) => h,
    };
    NaiveTime::from_hms_opt(h, m, 0)
}

/// Month number from an English month name or abbreviation.
pub fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.trim().to_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}

pub(crate) fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|_| ScrapeError::Selector(css.to_string()))
}

/// Whitespace-collapsed text content of an element.
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn first_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel).next().map(text_of).filter(|t| !t.is_empty())
}


#[cfg(test)]
mod tests {
    use super::test_support::utc;
    use super::*;

    fn raw(title: &str, start: &str, booking: &str, source: &str) -> RawScreening {
        let mut r = RawScreening::new("ica", title, utc(start), booking);
        r.source_id = source.to_string();
        r
    }

    #[test]
    fn validation_drops_incomplete_and_past_rows() {
        let now = utc("2025-01-05T12:00:00Z");
        let rows = vec![
            raw("", "2025-01-06T19:00:00Z", "https://b/1", "a"),
            raw("Past", "2025-01-04T19:00:00Z", "https://b/2", "b"),
            raw("No link", "2025-01-06T19:00:00Z", "  ", "c"),
            raw("Good", "2025-01-06T19:00:00Z", "https://b/3", "d"),
        ];
        let valid = validate_screenings(rows, now);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].title, "Good");
    }

    #[test]
    fn validation_dedups_by_source_id() {
        let now = utc("2025-01-05T12:00:00Z");
        let rows = vec![
            raw("Nosferatu", "2025-01-06T19:00:00Z", "https://b/1", "ica-1"),
            raw("Nosferatu", "2025-01-06T19:00:00Z", "https://b/1", "ica-1"),
            raw("Nosferatu", "2025-01-07T19:00:00Z", "https://b/2", "ica-2"),
        ];
        let valid = validate_screenings(rows, now);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].source_id, "ica-1");
        assert_eq!(valid[1].source_id, "ica-2");
    }

    #[test]
    fn rows_without_performance_id_keep_distinct_films_apart() {
        let now = utc("2025-01-05T12:00:00Z");
        let start = utc("2025-01-06T18:00:00Z");
        let rows = vec![
            RawScreening::new("bfi-southbank", "Vertigo", start, "https://whatson.bfi.org.uk/"),
            RawScreening::new("bfi-southbank", "Rear Window", start, "https://whatson.bfi.org.uk/"),
            RawScreening::new("bfi-southbank", "Vertigo", start, "https://whatson.bfi.org.uk/"),
        ];
        let valid = validate_screenings(rows, now);
        let titles: Vec<&str> = valid.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["Vertigo", "Rear Window"]);
        assert_ne!(valid[0].source_id, valid[1].source_id);
    }

    #[test]
    fn london_wall_time_respects_bst() {
        let winter = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap().and_hms_opt(19, 0, 0).unwrap();
        assert_eq!(london_to_utc(winter).unwrap(), utc("2025-01-06T19:00:00Z"));
        let summer = NaiveDate::from_ymd_opt(2025, 7, 6).unwrap().and_hms_opt(19, 0, 0).unwrap();
        assert_eq!(london_to_utc(summer).unwrap(), utc("2025-07-06T18:00:00Z"));
        let skipped = NaiveDate::from_ymd_opt(2025, 3, 30).unwrap().and_hms_opt(1, 30, 0).unwrap();
        assert!(london_to_utc(skipped).is_none());
    }

    #[test]
    fn year_inference_rolls_over_new_year() {
        let now = utc("2024-12-20T12:00:00Z");
        assert_eq!(infer_year(1, 6, now), NaiveDate::from_ymd_opt(2025, 1, 6));
        assert_eq!(infer_year(12, 28, now), NaiveDate::from_ymd_opt(2024, 12, 28));
        assert_eq!(infer_year(12, 17, now), NaiveDate::from_ymd_opt(2024, 12, 17));
    }

    #[test]
    fn clock_formats() {
        assert_eq!(parse_clock("7:00 pm"), NaiveTime::from_hms_opt(19, 0, 0));
        assert_eq!(parse_clock("12:30pm"), NaiveTime::from_hms_opt(12, 30, 0));
        assert_eq!(parse_clock("12:15 am"), NaiveTime::from_hms_opt(0, 15, 0));
        assert_eq!(parse_clock("1900"), NaiveTime::from_hms_opt(19, 0, 0));
        assert_eq!(parse_clock("11am"), NaiveTime::from_hms_opt(11, 0, 0));
        assert_eq!(parse_clock("18.20"), NaiveTime::from_hms_opt(18, 20, 0));
        assert_eq!(parse_clock("late"), None);
    }

    #[test]
    fn month_names() {
        assert_eq!(month_number("January"), Some(1));
        assert_eq!(month_number("sept"), Some(9));
        assert_eq!(month_number("Dec"), Some(12));
        assert_eq!(month_number("xx"), None);
    }

    #[test]
    fn registry_strategies() {
        assert_eq!(ScraperKind::BfiSouthbank.strategy(), ScrapeStrategy::Browser);
        assert_eq!(ScraperKind::Rio.strategy(), ScrapeStrategy::Static);
    }
}
