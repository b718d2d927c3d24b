//! Scraper for the ICA cinema (Institute of Contemporary Arts, The Mall).
//! Listing: https://www.ica.art/films
//! Film page: https://www.ica.art/films/<slug>, one `li.performance` per screening.

use chrono::NaiveDate;
use scraper::Html;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{first_text, london_to_utc, parse_clock, selector, text_of};
use crate::error::ScrapeError;
use crate::http::absolute_url;
use crate::model::{Availability, RawScreening, VenueDefinition};
use crate::{ScrapeContext, VenueScraper};

/// Canonical key for a film page: drops query strings, fragments and the
/// trailing slash so the same film linked twice is fetched once.
fn canonical_film_key(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    url.trim_end_matches('/').to_string()
}

pub struct IcaScraper {
    venue: VenueDefinition,
}

impl IcaScraper {
    pub fn new(venue: VenueDefinition) -> Self {
        Self { venue }
    }

    fn listing_url(&self) -> String {
        self.venue
            .extra_urls
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{}/films", self.venue.base_url.trim_end_matches('/')))
    }
}

#[async_trait::async_trait]
impl VenueScraper for IcaScraper {
    fn venue(&self) -> &VenueDefinition {
        &self.venue
    }

    fn health_marker(&self) -> &str {
        "Institute of Contemporary Arts"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError> {
        let body = ctx.http.get_text(&self.listing_url()).await?;
        let film_urls = parse_listing(&body, &self.venue.base_url)?;
        debug!(venue = %self.venue.id, films = film_urls.len(), "listing parsed");

        let mut screenings = Vec::new();
        for url in film_urls {
            // One bad film page must not sink the venue.
            let page = match ctx.http.get_text(&url).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(venue = %self.venue.id, url = %url, error = %e, "film page failed");
                    tokio::time::sleep(ctx.scrape.unit_backoff()).await;
                    continue;
                }
            };
            match parse_film_page(&page, &url, &self.venue) {
                Ok(mut found) => screenings.append(&mut found),
                Err(e) => warn!(venue = %self.venue.id, url = %url, error = %e, "film page unparseable"),
            }
        }
        Ok(screenings)
    }
}

fn parse_listing(html: &str, base_url: &str) -> Result<Vec<String>, ScrapeError> {
    let document = Html::parse_document(html);
    let link_selector = selector("a[href*=\"/films/\"]")?;
    let mut urls = Vec::new();
    let mut seen = HashSet::new();

    for a in document.select(&link_selector) {
        let href = match a.value().attr("href") {
            Some(h) => h.trim(),
            None => continue,
        };
        if href.is_empty() {
            continue;
        }
        let full_url = absolute_url(base_url, href);
        let key = canonical_film_key(&full_url);
        // "/films" itself and season pages are not film pages.
        if key.ends_with("/films") || key.contains("/films/season/") {
            continue;
        }
        if seen.insert(key.clone()) {
            urls.push(key);
        }
    }
    Ok(urls)
}

fn parse_film_page(
    html: &str,
    page_url: &str,
    venue: &VenueDefinition,
) -> Result<Vec<RawScreening>, ScrapeError> {
    let doc = Html::parse_document(html);
    let title_sel = selector("#title-container h1.title, h1.title")?;
    let subtitle_sel = selector("#title-container .sub-title, .sub-title")?;
    let perf_sel = selector("li.performance")?;
    let date_sel = selector(".date")?;
    let time_sel = selector(".time")?;
    let screen_sel = selector(".screen")?;
    let link_sel = selector("a.book-link")?;
    let tag_sel = selector(".tag")?;

    let title = match doc.select(&title_sel).next().map(text_of) {
        Some(t) if !t.is_empty() => t,
        _ => return Err(ScrapeError::Markup(format!("no title on {page_url}"))),
    };
    let subtitle = doc.select(&subtitle_sel).next().map(text_of);

    let mut screenings = Vec::new();
    for perf in doc.select(&perf_sel) {
        let date = first_text(perf, &date_sel).and_then(|d| parse_ica_date(&d));
        let time = first_text(perf, &time_sel).and_then(|t| parse_clock(&t));
        let start = match (date, time) {
            (Some(d), Some(t)) => match london_to_utc(d.and_time(t)) {
                Some(s) => s,
                None => continue,
            },
            _ => continue,
        };
        let booking_url = perf
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|h| absolute_url(&venue.base_url, h))
            .unwrap_or_default();

        let classes: Vec<&str> = perf.value().classes().collect();
        let availability = if classes.contains(&"sold-out") {
            Availability::SoldOut
        } else if classes.contains(&"limited") {
            Availability::SellingFast
        } else {
            Availability::Available
        };

        let tags: Vec<String> = perf.select(&tag_sel).map(text_of).collect();
        let mut screening = RawScreening::new(&venue.id, title.clone(), start, booking_url);
        screening.screen = first_text(perf, &screen_sel);
        screening.availability = availability;
        screening.listing_text = subtitle.clone();
        screening.event_type = tags.iter().find_map(|t| crate::model::EventType::from_hint(t));
        screening.format = tags
            .iter()
            .find(|t| t.ends_with("mm") || t.eq_ignore_ascii_case("digital"))
            .cloned();
        screening.source_id = match perf.value().attr("data-performance-id") {
            Some(id) => format!("ica-{}", id.trim()),
            None => format!("ica-{}-{}", canonical_film_key(page_url), start.timestamp()),
        };
        screenings.push(screening);
    }
    Ok(screenings)
}

/// "Mon 6 Jan 2025" or "Monday 6 January 2025".
fn parse_ica_date(text: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    let [_, day, month, year] = parts.as_slice() else {
        return None;
    };
    let day: u32 = day.trim_end_matches(|c: char| c.is_ascii_alphabetic()).parse().ok()?;
    let month = super::month_number(month)?;
    let year: i32 = year.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::ScraperKind;
    use crate::venues::test_support::{utc, venue};

    const LISTING: &str = r#"
        <nav><a href="/films">Films</a><a href="/films/season/winter">Season</a></nav>
        <div class="item"><a href="/films/nosferatu?ref=home">Nosferatu</a></div>
        <div class="item"><a href="https://www.ica.art/films/nosferatu/">Nosferatu</a></div>
        <div class="item"><a href="/films/saturday-morning-picture-club-muppets">Muppets</a></div>
    "#;

    const FILM: &str = r#"
        <div id="title-container">
          <h1 class="title">Nosferatu + Q&amp;A</h1>
          <div class="sub-title">Dir. F. W. Murnau, Germany 1922, 94 mins</div>
        </div>
        <ul class="performance-list">
          <li class="performance" data-performance-id="8812">
            <span class="date">Mon 6 Jan 2025</span><span class="time">19:00</span>
            <span class="screen">Cinema 1</span><span class="tag">35mm</span>
            <a class="book-link" href="https://tickets.ica.art/8812">Book</a>
          </li>
          <li class="performance sold-out" data-performance-id="8813">
            <span class="date">Tue 7 Jan 2025</span><span class="time">6:30 pm</span>
            <span class="screen">Cinema 2</span><span class="tag">Q&amp;A</span>
            <a class="book-link" href="/tickets/8813">Book</a>
          </li>
          <li class="performance"><span class="date">TBC</span></li>
        </ul>
    "#;

    #[test]
    fn listing_dedups_film_links() {
        let urls = parse_listing(LISTING, "https://www.ica.art").unwrap();
        assert_eq!(
            urls,
            vec![
                "https://www.ica.art/films/nosferatu".to_string(),
                "https://www.ica.art/films/saturday-morning-picture-club-muppets".to_string(),
            ]
        );
    }

    #[test]
    fn film_page_yields_one_row_per_performance() {
        let venue = venue("ica", ScraperKind::Ica, "https://www.ica.art");
        let rows = parse_film_page(FILM, "https://www.ica.art/films/nosferatu", &venue).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.title, "Nosferatu + Q&A");
        assert_eq!(first.start, utc("2025-01-06T19:00:00Z"));
        assert_eq!(first.screen.as_deref(), Some("Cinema 1"));
        assert_eq!(first.format.as_deref(), Some("35mm"));
        assert_eq!(first.source_id, "ica-8812");
        assert_eq!(
            first.listing_text.as_deref(),
            Some("Dir. F. W. Murnau, Germany 1922, 94 mins")
        );

        let second = &rows[1];
        assert_eq!(second.start, utc("2025-01-07T18:30:00Z"));
        assert_eq!(second.availability, Availability::SoldOut);
        assert_eq!(second.booking_url, "https://www.ica.art/tickets/8813");
        assert_eq!(second.event_type, Some(crate::model::EventType::QAndA));
    }

    #[test]
    fn page_without_title_is_markup_error() {
        let venue = venue("ica", ScraperKind::Ica, "https://www.ica.art");
        assert!(parse_film_page("<html></html>", "https://www.ica.art/films/x", &venue).is_err());
    }

    #[test]
    fn parses_long_and_short_dates() {
        assert_eq!(parse_ica_date("Mon 6 Jan 2025"), NaiveDate::from_ymd_opt(2025, 1, 6));
        assert_eq!(parse_ica_date("Friday 21st March 2025"), NaiveDate::from_ymd_opt(2025, 3, 21));
        assert_eq!(parse_ica_date("TBC"), None);
    }
}
