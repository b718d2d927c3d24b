//! Scraper for BFI Southbank.
//! Listing: https://whatson.bfi.org.uk/Online/default.asp
//! The site sits behind a bot challenge and renders the calendar client-side,
//! so it is driven through a real browser: open the listing, then click each
//! day of the horizon in turn and read the results panel it renders.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Europe::London;
use scraper::Html;
use tracing::{debug, info, warn};

use super::{first_text, london_to_utc, selector};
use crate::browser::{BrowserPage, LaunchOptions, NavAction, NavigationPolicy, Navigator};
use crate::error::ScrapeError;
use crate::http::absolute_url;
use crate::model::{Availability, RawScreening, VenueDefinition};
use crate::{ScrapeContext, VenueScraper};

const LISTING_PATH: &str = "/Online/default.asp";
const NEXT_MONTH: &str = "button.calendar-next";

fn day_selector(date: NaiveDate) -> String {
    format!("[data-date='{}']", date.format("%Y-%m-%d"))
}

pub struct BfiSouthbankScraper {
    venue: VenueDefinition,
}

impl BfiSouthbankScraper {
    pub fn new(venue: VenueDefinition) -> Self {
        Self { venue }
    }

    fn listing_url(&self) -> String {
        self.venue
            .extra_urls
            .first()
            .cloned()
            .unwrap_or_else(|| absolute_url(&self.venue.base_url, LISTING_PATH))
    }

    async fn open_page(&self, ctx: &ScrapeContext) -> Result<Box<dyn BrowserPage>, ScrapeError> {
        let options = LaunchOptions::from_config(&ctx.browser_config, &ctx.scrape.user_agent);
        Ok(ctx.browser.launch(&options).await?)
    }
}

#[async_trait::async_trait]
impl VenueScraper for BfiSouthbankScraper {
    fn venue(&self) -> &VenueDefinition {
        &self.venue
    }

    fn health_marker(&self) -> &str {
        "BFI"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawScreening>, ScrapeError> {
        let mut page = self.open_page(ctx).await?;
        let today = ctx.now.with_timezone(&London).date_naive();
        let dates: Vec<NaiveDate> = (0..ctx.scrape.horizon_days)
            .map(|offset| today + Duration::days(offset as i64))
            .collect();

        let result = walk_calendar(
            page.as_mut(),
            NavigationPolicy::from_config(&ctx.browser_config),
            &self.venue,
            &self.listing_url(),
            &dates,
            ctx.scrape.unit_backoff(),
        )
        .await;

        if let Err(e) = page.close().await {
            warn!(venue = %self.venue.id, error = %e, "closing browser page failed");
        }
        result
    }

    /// The plain HTTP check only ever sees the challenge page, so the check
    /// goes through the browser as well.
    async fn health_check(&self, ctx: &ScrapeContext) -> bool {
        let mut page = match self.open_page(ctx).await {
            Ok(p) => p,
            Err(e) => {
                warn!(venue = %self.venue.id, error = %e, "health check: browser launch failed");
                return false;
            }
        };
        let url = self.venue.base_url.clone();
        let outcome = Navigator::new(page.as_mut(), NavigationPolicy::from_config(&ctx.browser_config))
            .settle(NavAction::Goto(&url))
            .await;
        if let Err(e) = page.close().await {
            debug!(venue = %self.venue.id, error = %e, "closing health check page failed");
        }
        match outcome {
            Ok(html) => {
                let healthy = html.to_lowercase().contains(&self.health_marker().to_lowercase());
                debug!(venue = %self.venue.id, healthy, "health check");
                healthy
            }
            Err(e) => {
                warn!(venue = %self.venue.id, error = %e, "health check failed");
                false
            }
        }
    }
}

/// Opens the listing and clicks through `dates`. A failed day is logged and
/// skipped after `unit_backoff`; only failing to open the listing is fatal.
async fn walk_calendar(
    page: &mut dyn BrowserPage,
    policy: NavigationPolicy,
    venue: &VenueDefinition,
    listing_url: &str,
    dates: &[NaiveDate],
    unit_backoff: std::time::Duration,
) -> Result<Vec<RawScreening>, ScrapeError> {
    let mut nav = Navigator::new(page, policy);
    nav.settle(NavAction::Goto(listing_url)).await?;
    info!(venue = %venue.id, days = dates.len(), "listing open, walking calendar");

    let mut screenings = Vec::new();
    for &date in dates {
        match scrape_day(&mut nav, venue, date).await {
            Ok(Some(mut found)) => {
                debug!(venue = %venue.id, %date, count = found.len(), "day parsed");
                screenings.append(&mut found);
            }
            Ok(None) => debug!(venue = %venue.id, %date, "no calendar cell for day"),
            Err(e) => {
                warn!(venue = %venue.id, %date, error = %e, "day failed");
                tokio::time::sleep(unit_backoff).await;
            }
        }
    }
    Ok(screenings)
}

async fn scrape_day(
    nav: &mut Navigator<'_>,
    venue: &VenueDefinition,
    date: NaiveDate,
) -> Result<Option<Vec<RawScreening>>, ScrapeError> {
    let cell = day_selector(date);
    if !nav.page().exists(&cell).await? {
        // The calendar shows one month at a time.
        if date.day() <= 7 && nav.page().exists(NEXT_MONTH).await? {
            nav.settle(NavAction::Click(NEXT_MONTH)).await?;
        }
        if !nav.page().exists(&cell).await? {
            return Ok(None);
        }
    }
    let html = nav.settle(NavAction::Click(&cell)).await?;
    parse_results(&html, venue).map(Some)
}

fn parse_results(html: &str, venue: &VenueDefinition) -> Result<Vec<RawScreening>, ScrapeError> {
    let doc = Html::parse_document(html);
    let item_sel = selector("div.result-box-item")?;
    let name_sel = selector(".item-name a")?;
    let date_sel = selector(".start-date")?;
    let screen_sel = selector(".item-venue")?;
    let desc_sel = selector(".item-description")?;

    let mut screenings = Vec::new();
    for item in doc.select(&item_sel) {
        let Some(link) = item.select(&name_sel).next() else {
            continue;
        };
        let title = super::text_of(link);
        let Some(start) = first_text(item, &date_sel).and_then(|t| parse_start(&t)) else {
            continue;
        };
        let booking_url = link
            .value()
            .attr("href")
            .map(|h| absolute_url(&venue.base_url, h))
            .unwrap_or_default();

        let classes: Vec<&str> = item.value().classes().collect();
        let mut screening = RawScreening::new(&venue.id, title, start, booking_url.clone());
        screening.screen = first_text(item, &screen_sel);
        screening.listing_text = first_text(item, &desc_sel);
        screening.availability = if classes.contains(&"sold-out") {
            Availability::SoldOut
        } else if classes.contains(&"few-left") {
            Availability::SellingFast
        } else {
            Availability::Available
        };
        if let Some(id) = performance_id(&booking_url) {
            screening.source_id = format!("bfi-{id}");
        }
        screenings.push(screening);
    }
    Ok(screenings)
}

/// "Monday 06 January 2025 18:20"
fn parse_start(text: &str) -> Option<DateTime<Utc>> {
    let local = NaiveDateTime::parse_from_str(text.trim(), "%A %d %B %Y %H:%M").ok()?;
    london_to_utc(local)
}

/// `BOparam::WScontent::loadArticle::permalink=...&sToken=1,2,3` style links
/// carry the performance id as the `sToken` query value.
fn performance_id(url: &str) -> Option<&str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("sToken="))
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{ScriptedLauncher, ScriptedPage, fast_policy};
    use crate::config::{BrowserConfig, ScrapeConfig};
    use crate::http::PoliteClient;
    use std::sync::Arc;
    use crate::error::BrowserError;
    use crate::venues::ScraperKind;
    use crate::venues::test_support::{utc, venue};

    const CALENDAR: &str = r#"<main><div class="calendar"><td data-date="2025-01-06">6</td></div></main>"#;

    const DAY: &str = r#"
      <div class="results">
        <div class="result-box-item">
          <span class="item-name"><a href="/Online/default.asp?BOparam::WScontent::loadArticle&amp;sToken=1,2,77">Nosferatu + intro</a></span>
          <span class="start-date">Monday 06 January 2025 18:20</span>
          <span class="item-venue">NFT1</span>
          <span class="item-description">Restored print, introduced by the curator.</span>
        </div>
        <div class="result-box-item sold-out">
          <span class="item-name"><a href="/Online/default.asp?sToken=1,2,78">Playtime</a></span>
          <span class="start-date">Monday 06 January 2025 20:45</span>
          <span class="item-venue">NFT3</span>
        </div>
        <div class="result-box-item"><span class="item-name"><a>Broken</a></span></div>
      </div>
    "#;

    fn dates() -> Vec<NaiveDate> {
        vec![
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        ]
    }

    #[test]
    fn results_panel_parses() {
        let venue = venue("bfi-southbank", ScraperKind::BfiSouthbank, "https://whatson.bfi.org.uk");
        let rows = parse_results(DAY, &venue).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "Nosferatu + intro");
        assert_eq!(rows[0].start, utc("2025-01-06T18:20:00Z"));
        assert_eq!(rows[0].screen.as_deref(), Some("NFT1"));
        assert_eq!(rows[0].source_id, "bfi-1,2,77");
        assert_eq!(rows[1].availability, Availability::SoldOut);
    }

    #[tokio::test]
    async fn walks_days_through_challenge() {
        let venue = venue("bfi-southbank", ScraperKind::BfiSouthbank, "https://whatson.bfi.org.uk");
        let mut page = ScriptedPage::default();
        page.push_challenge_then(2, "What's On | BFI", CALENDAR);
        page.push_page("What's On | BFI", DAY);
        page.present = vec![day_selector(dates()[0])];

        let rows = walk_calendar(
            &mut page,
            fast_policy(),
            &venue,
            "https://whatson.bfi.org.uk/Online/default.asp",
            &dates(),
            std::time::Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(page.visited, vec!["https://whatson.bfi.org.uk/Online/default.asp"]);
        // The 7th has no cell and there is no next-month button: skipped, no click.
        assert_eq!(page.clicked, vec!["[data-date='2025-01-06']"]);
    }

    #[tokio::test]
    async fn failed_day_does_not_sink_the_run() {
        let venue = venue("bfi-southbank", ScraperKind::BfiSouthbank, "https://whatson.bfi.org.uk");
        let mut page = ScriptedPage::default();
        page.push_page("What's On | BFI", CALENDAR);
        // The click on the 6th dies with a permanent protocol error.
        page.present = vec![day_selector(dates()[0]), day_selector(dates()[1])];
        page.loads.push_back(Err(BrowserError::Protocol("page crashed".into())));
        page.push_page("What's On | BFI", DAY);

        let rows = walk_calendar(
            &mut page,
            fast_policy(),
            &venue,
            "https://whatson.bfi.org.uk/Online/default.asp",
            &dates(),
            std::time::Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(page.clicked.len(), 2);
    }

    #[tokio::test]
    async fn listing_that_never_loads_is_fatal() {
        let venue = venue("bfi-southbank", ScraperKind::BfiSouthbank, "https://whatson.bfi.org.uk");
        let mut page = ScriptedPage::default();
        page.loads.push_back(Err(BrowserError::Launch("no chromium".into())));
        let result = walk_calendar(
            &mut page,
            fast_policy(),
            &venue,
            "https://whatson.bfi.org.uk/Online/default.asp",
            &dates(),
            std::time::Duration::ZERO,
        )
        .await;
        assert!(matches!(result, Err(ScrapeError::Browser(BrowserError::Launch(_)))));
    }

    #[tokio::test]
    async fn health_check_survives_a_failing_page_close() {
        let mut page = ScriptedPage::default();
        page.push_page("What's On | BFI", "<main>BFI Southbank</main>");
        page.close_error = Some(BrowserError::Protocol("bridge already gone".into()));
        let scrape = ScrapeConfig::default();
        let ctx = ScrapeContext {
            http: Arc::new(PoliteClient::new(&scrape).unwrap()),
            browser: Arc::new(ScriptedLauncher::new(page)),
            scrape,
            browser_config: BrowserConfig::default(),
            now: utc("2025-01-05T12:00:00Z"),
        };
        let scraper = BfiSouthbankScraper::new(venue(
            "bfi-southbank",
            ScraperKind::BfiSouthbank,
            "https://whatson.bfi.org.uk",
        ));
        assert!(scraper.health_check(&ctx).await);
    }
}
