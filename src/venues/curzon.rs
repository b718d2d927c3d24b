//! Scraper for Curzon cinemas (shared Vista ticketing API).
//! Showtimes: https://www.curzon.com/api/showtimes/by-business-date/<YYYY-MM-DD>?siteIds=<site>
//! The API only answers once the homepage has set its session cookies, so
//! `warm_up` fetches the homepage first.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Europe::London;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::ScrapeError;
use crate::http::absolute_url;
use crate::model::{Availability, EventType, RawScreening, VenueDefinition};
use crate::{ScrapeContext, VenueScraper};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShowtimesResponse {
    #[serde(default)]
    showtimes: Vec<ApiShowtime>,
    #[serde(default)]
    related_data: RelatedData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiShowtime {
    id: String,
    film_id: String,
    schedule: ApiSchedule,
    #[serde(default)]
    screen_name: Option<String>,
    #[serde(default)]
    is_sold_out: bool,
    #[serde(default)]
    attribute_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSchedule {
    starts_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelatedData {
    #[serde(default)]
    films: Vec<ApiFilm>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFilm {
    id: String,
    title: ApiText,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    synopsis: Option<ApiText>,
}

#[derive(Debug, Deserialize)]
struct ApiText {
    text: String,
}

pub struct CurzonScraper {
    venue: VenueDefinition,
}

impl CurzonScraper {
    pub fn new(venue: VenueDefinition) -> Self {
        Self { venue }
    }

    fn showtimes_url(&self, date: NaiveDate) -> String {
        absolute_url(
            &self.venue.base_url,
            &format!("/api/showtimes/by-business-date/{}", date.format("%Y-%m-%d")),
        )
    }
}

#[async_trait::async_trait]
impl VenueScraper for CurzonScraper {
    fn venue(&self) -> &VenueDefinition {
        &self.venue
    }

    fn health_marker(&self) -> &str {
        "Curzon"
    }

    async fn warm_up(&self, ctx: &ScrapeContext) -> Result<(), ScrapeError> {
        // Fresh cookies/tokens for the API.
        ctx.http.get_text(&self.venue.base_url).await?;
        Ok(())
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError> {
        let site = self.venue.site_code.as_deref().ok_or_else(|| {
            ScrapeError::Misconfigured(format!("venue {} has no site_code", self.venue.id))
        })?;
        let today = ctx.now.with_timezone(&London).date_naive();

        let mut screenings = Vec::new();
        for offset in 0..ctx.scrape.horizon_days {
            let date = today + Duration::days(offset as i64);
            let url = self.showtimes_url(date);
            let body = match ctx
                .http
                .get_text_with(&url, &[("siteIds", site)], Some("application/json"))
                .await
            {
                Ok(b) => b,
                Err(e) => {
                    warn!(venue = %self.venue.id, %date, error = %e, "showtimes request failed");
                    tokio::time::sleep(ctx.scrape.unit_backoff()).await;
                    continue;
                }
            };
            match parse_showtimes(&body, &self.venue) {
                Ok(mut found) => {
                    debug!(venue = %self.venue.id, %date, count = found.len(), "showtimes parsed");
                    screenings.append(&mut found);
                }
                Err(e) => warn!(venue = %self.venue.id, %date, error = %e, "showtimes unparseable"),
            }
        }
        Ok(screenings)
    }
}

fn parse_showtimes(body: &str, venue: &VenueDefinition) -> Result<Vec<RawScreening>, ScrapeError> {
    let parsed: ShowtimesResponse = serde_json::from_str(body)?;
    let films: HashMap<&str, &ApiFilm> = parsed
        .related_data
        .films
        .iter()
        .map(|f| (f.id.as_str(), f))
        .collect();

    let mut screenings = Vec::new();
    for show in &parsed.showtimes {
        let Some(film) = films.get(show.film_id.as_str()) else {
            debug!(showtime = %show.id, film = %show.film_id, "showtime for unknown film");
            continue;
        };
        let Ok(start) = DateTime::parse_from_rfc3339(&show.schedule.starts_at) else {
            continue;
        };
        let booking_url = absolute_url(&venue.base_url, &format!("/ticketing/seats/{}/", show.id));

        let mut screening = RawScreening::new(
            &venue.id,
            film.title.text.trim(),
            start.with_timezone(&Utc),
            booking_url,
        );
        screening.screen = show.screen_name.clone().filter(|s| !s.trim().is_empty());
        screening.availability = if show.is_sold_out {
            Availability::SoldOut
        } else {
            Availability::Available
        };
        screening.year = film
            .release_date
            .as_deref()
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok());
        screening.listing_text = film.synopsis.as_ref().map(|s| s.text.trim().to_string());
        for attr in &show.attribute_ids {
            let attr = attr.to_lowercase();
            if screening.format.is_none() && (attr.ends_with("mm") || attr == "imax") {
                screening.format = Some(attr.clone());
            }
            if screening.event_type.is_none() {
                screening.event_type = attribute_event(&attr);
            }
        }
        screening.source_id = format!("curzon-{}", show.id);
        screenings.push(screening);
    }
    Ok(screenings)
}

/// Curzon attribute codes differ from the wording on other sites.
fn attribute_event(attr: &str) -> Option<EventType> {
    match attr {
        "qa" | "q-and-a" => Some(EventType::QAndA),
        "preview" | "previews" => Some(EventType::Preview),
        "kids" | "kids-club" => Some(EventType::KidsScreening),
        other => EventType::from_hint(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::ScraperKind;
    use crate::venues::test_support::{utc, venue};

    const BODY: &str = r#"{
      "showtimes": [
        {"id": "SOH1-12345", "filmId": "HO0001", "schedule": {"startsAt": "2025-07-06T19:00:00+01:00"},
         "screenName": "Screen 2", "isSoldOut": false, "attributeIds": ["35MM", "QA"]},
        {"id": "SOH1-12346", "filmId": "HO0001", "schedule": {"startsAt": "2025-07-06T21:30:00+01:00"},
         "isSoldOut": true, "attributeIds": []},
        {"id": "SOH1-99999", "filmId": "HO9999", "schedule": {"startsAt": "2025-07-06T21:30:00+01:00"}}
      ],
      "relatedData": {
        "films": [
          {"id": "HO0001", "title": {"text": "Nosferatu "}, "releaseDate": "2024-12-25T00:00:00",
           "synopsis": {"text": "A gothic tale."}}
        ]
      }
    }"#;

    #[test]
    fn joins_showtimes_to_films() {
        let venue = venue("curzon-soho", ScraperKind::Curzon, "https://www.curzon.com");
        let rows = parse_showtimes(BODY, &venue).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].title, "Nosferatu");
        assert_eq!(rows[0].start, utc("2025-07-06T18:00:00Z"));
        assert_eq!(rows[0].format.as_deref(), Some("35mm"));
        assert_eq!(rows[0].event_type, Some(EventType::QAndA));
        assert_eq!(rows[0].year, Some(2024));
        assert_eq!(rows[0].booking_url, "https://www.curzon.com/ticketing/seats/SOH1-12345/");
        assert_eq!(rows[0].source_id, "curzon-SOH1-12345");
        assert_eq!(rows[1].availability, Availability::SoldOut);
        assert_eq!(rows[1].screen, None);
    }

    #[test]
    fn empty_day_is_empty() {
        let venue = venue("curzon-soho", ScraperKind::Curzon, "https://www.curzon.com");
        assert!(parse_showtimes(r#"{"showtimes": []}"#, &venue).unwrap().is_empty());
    }

    #[test]
    fn malformed_body_is_json_error() {
        let venue = venue("curzon-soho", ScraperKind::Curzon, "https://www.curzon.com");
        assert!(matches!(parse_showtimes("<html>", &venue), Err(ScrapeError::Json(_))));
    }
}
