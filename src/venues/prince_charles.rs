//! Scraper for the Prince Charles Cinema (Leicester Square).
//! Schedule: https://princecharlescinema.com/whats-on/
//! The whole programme is one page: a `div.film_list-item` per film, with
//! day headings interleaved with performance rows. Dates carry no year.

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html};

use super::{first_text, infer_year, london_to_utc, month_number, parse_clock, selector, text_of};
use crate::error::ScrapeError;
use crate::http::absolute_url;
use crate::model::{Availability, RawScreening, VenueDefinition};
use crate::{ScrapeContext, VenueScraper};

const SCHEDULE_PATH: &str = "/whats-on/";

pub struct PrinceCharlesScraper {
    venue: VenueDefinition,
}

impl PrinceCharlesScraper {
    pub fn new(venue: VenueDefinition) -> Self {
        Self { venue }
    }
}

#[async_trait::async_trait]
impl VenueScraper for PrinceCharlesScraper {
    fn venue(&self) -> &VenueDefinition {
        &self.venue
    }

    fn health_marker(&self) -> &str {
        "Prince Charles Cinema"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError> {
        let url = absolute_url(&self.venue.base_url, SCHEDULE_PATH);
        let body = ctx.http.get_text(&url).await?;
        parse_schedule(&body, &self.venue, ctx.now)
    }
}

fn parse_schedule(
    html: &str,
    venue: &VenueDefinition,
    now: DateTime<Utc>,
) -> Result<Vec<RawScreening>, ScrapeError> {
    let doc = Html::parse_document(html);
    let card_sel = selector("div.film_list-item")?;
    let title_sel = selector("a.liveeventtitle")?;
    let info_sel = selector("div.running_time")?;
    let list_sel = selector("ul.performance-list-items")?;
    let time_sel = selector("span.time")?;
    let book_sel = selector("a.film_book_button")?;
    let tags_sel = selector("span.tags")?;

    let mut screenings = Vec::new();
    for card in doc.select(&card_sel) {
        let title = match first_text(card, &title_sel) {
            Some(t) => t,
            None => continue,
        };
        let info = first_text(card, &info_sel);
        let Some(list) = card.select(&list_sel).next() else {
            continue;
        };

        // Headings and rows are siblings; each row belongs to the last heading seen.
        let mut current_day: Option<NaiveDate> = None;
        for child in list.children().filter_map(ElementRef::wrap) {
            let el = child.value();
            if el.classes().any(|c| c == "heading") {
                current_day = parse_day_heading(&text_of(child), now);
                continue;
            }
            if el.name() != "li" {
                continue;
            }
            let Some(day) = current_day else { continue };
            let Some(time) = first_text(child, &time_sel).and_then(|t| parse_clock(&t)) else {
                continue;
            };
            let Some(start) = london_to_utc(day.and_time(time)) else {
                continue;
            };
            let button = child.select(&book_sel).next();
            let booking_url = button
                .and_then(|a| a.value().attr("href"))
                .map(|h| absolute_url(&venue.base_url, h))
                .unwrap_or_default();
            let availability = match button {
                Some(b) if b.value().classes().any(|c| c == "soldfilm_book_button") => Availability::SoldOut,
                Some(_) => Availability::Available,
                None => Availability::Unknown,
            };

            let mut screening = RawScreening::new(&venue.id, title.clone(), start, booking_url.clone());
            screening.availability = availability;
            screening.listing_text = info.clone();
            screening.format = first_text(child, &tags_sel)
                .filter(|t| t.to_lowercase().contains("mm") || t.to_lowercase().contains("imax"));
            screening.source_id = booking_id(&booking_url)
                .map(|id| format!("pcc-{id}"))
                .unwrap_or_else(|| format!("pcc-{}-{}", title, start.timestamp()));
            screenings.push(screening);
        }
    }
    Ok(screenings)
}

/// "Saturday 21st December" → date with an inferred year.
fn parse_day_heading(text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    let mut day = None;
    let mut month = None;
    for word in text.split_whitespace() {
        let digits: String = word.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            day = digits.parse::<u32>().ok();
        } else if let Some(m) = month_number(word) {
            month = Some(m);
        }
    }
    infer_year(month?, day?, now)
}

/// Numeric booking id from ".../book/4567" style links.
fn booking_id(url: &str) -> Option<&str> {
    let last = url.trim_end_matches('/').rsplit('/').next()?;
    (!last.is_empty() && last.chars().all(|c| c.is_ascii_digit())).then_some(last)
}
