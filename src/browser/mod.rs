//! Browser automation for JS-rendered and bot-protected venue sites.
//!
//! One [`BrowserPage`] is owned by one scraper and driven strictly
//! sequentially. Navigation runs through [`NavState`], an explicit state
//! machine whose timeouts and retries all come from [`NavigationPolicy`].

pub mod playwright;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::BrowserError;
use crate::retry::RetryPolicy;

pub use playwright::PlaywrightLauncher;

/// Anti-fingerprinting options applied when the browser context is created.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
    pub headless: bool,
    pub user_agent: String,
    pub locale: String,
    pub timezone_id: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Mask `navigator.webdriver` and the usual automation giveaways.
    pub stealth: bool,
}

impl LaunchOptions {
    pub fn from_config(config: &BrowserConfig, user_agent: &str) -> Self {
        Self {
            headless: config.headless,
            user_agent: user_agent.to_string(),
            locale: config.locale.clone(),
            timezone_id: config.timezone.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            stealth: true,
        }
    }
}

#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError>;
    async fn title(&mut self) -> Result<String, BrowserError>;
    async fn content(&mut self) -> Result<String, BrowserError>;
    /// Resolves `selector` afresh and clicks the first match.
    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;
    /// Whether `selector` matches anything right now.
    async fn exists(&mut self, selector: &str) -> Result<bool, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

#[derive(Debug, Clone)]
pub struct NavigationPolicy {
    pub page_load_timeout: Duration,
    pub challenge_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl NavigationPolicy {
    pub fn from_config(config: &BrowserConfig) -> Self {
        Self {
            page_load_timeout: Duration::from_secs(config.page_load_timeout_secs),
            challenge_timeout: Duration::from_secs(config.challenge_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry: RetryPolicy::fixed(
                config.max_attempts,
                config.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            ),
        }
    }
}

/// Recognises bot-challenge interstitials by title and markup.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    pub title_markers: Vec<String>,
    pub body_markers: Vec<String>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            title_markers: [
                "just a moment",
                "attention required",
                "please wait",
                "checking your browser",
                "ddos-guard",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            body_markers: [
                "cf-browser-verification",
                "challenge-platform",
                "cf_chl_opt",
                "cf-turnstile",
                "checking your browser before accessing",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ChallengeDetector {
    pub fn is_challenge(&self, title: &str, html: &str) -> bool {
        let title = title.to_lowercase();
        if self.title_markers.iter().any(|m| title.contains(m.as_str())) {
            return true;
        }
        // Only the head of the document; real pages can mention these strings deep in scripts.
        let head: String = html.chars().take(20_000).collect::<String>().to_lowercase();
        self.body_markers.iter().any(|m| head.contains(m.as_str()))
    }
}

#[derive(Debug)]
pub enum NavState {
    Navigating { attempt: u32 },
    AwaitingChallenge { attempt: u32, waited: Duration },
    Ready,
    Failed(BrowserError),
}

#[derive(Debug)]
pub enum NavEvent {
    Loaded,
    LoadFailed(BrowserError),
    ChallengePresent { waited: Duration },
    ChallengeCleared,
}

impl NavState {
    /// Pure transition function; the driver performs the side effects.
    pub fn on(self, event: NavEvent, policy: &NavigationPolicy) -> NavState {
        match (self, event) {
            (NavState::Navigating { attempt }, NavEvent::Loaded) => NavState::AwaitingChallenge {
                attempt,
                waited: Duration::ZERO,
            },
            (NavState::Navigating { attempt }, NavEvent::LoadFailed(e))
            | (NavState::AwaitingChallenge { attempt, .. }, NavEvent::LoadFailed(e)) => {
                retry_or_fail(attempt, e, policy)
            }
            (NavState::AwaitingChallenge { .. }, NavEvent::ChallengeCleared) => NavState::Ready,
            (NavState::AwaitingChallenge { attempt, .. }, NavEvent::ChallengePresent { waited }) => {
                if waited >= policy.challenge_timeout {
                    let e = BrowserError::ChallengeTimeout(policy.challenge_timeout.as_secs());
                    retry_or_fail(attempt, e, policy)
                } else {
                    NavState::AwaitingChallenge { attempt, waited }
                }
            }
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NavState::Ready | NavState::Failed(_))
    }
}

fn retry_or_fail(attempt: u32, error: BrowserError, policy: &NavigationPolicy) -> NavState {
    if error.is_transient() && attempt < policy.retry.max_attempts {
        NavState::Navigating { attempt: attempt + 1 }
    } else {
        NavState::Failed(error)
    }
}

/// How a navigation step is triggered.
#[derive(Debug, Clone, Copy)]
pub enum NavAction<'a> {
    Goto(&'a str),
    Click(&'a str),
}

/// Drives one page through the navigation state machine.
pub struct Navigator<'p> {
    page: &'p mut dyn BrowserPage,
    policy: NavigationPolicy,
    detector: ChallengeDetector,
}

impl<'p> Navigator<'p> {
    pub fn new(page: &'p mut dyn BrowserPage, policy: NavigationPolicy) -> Self {
        Self {
            page,
            policy,
            detector: ChallengeDetector::default(),
        }
    }

    pub fn page(&mut self) -> &mut dyn BrowserPage {
        &mut *self.page
    }

    /// Performs `action` and returns the settled page HTML once any
    /// challenge has cleared.
    pub async fn settle(&mut self, action: NavAction<'_>) -> Result<String, BrowserError> {
        let mut state = NavState::Navigating { attempt: 1 };
        let mut html = String::new();
        loop {
            state = match state {
                NavState::Navigating { attempt } => {
                    if attempt > 1 {
                        let delay = self.policy.retry.delay_for(attempt - 1);
                        debug!(?action, attempt, delay_ms = delay.as_millis() as u64, "navigation backoff");
                        tokio::time::sleep(delay).await;
                    }
                    let outcome = self.perform(action).await;
                    let event = match outcome {
                        Ok(()) => NavEvent::Loaded,
                        Err(e) => {
                            warn!(?action, attempt, error = %e, "navigation failed");
                            NavEvent::LoadFailed(e)
                        }
                    };
                    NavState::Navigating { attempt }.on(event, &self.policy)
                }
                NavState::AwaitingChallenge { attempt, waited } => {
                    let event = match self.snapshot().await {
                        Ok((title, body)) => {
                            if self.detector.is_challenge(&title, &body) {
                                if waited.is_zero() {
                                    info!(?action, "bot challenge detected, waiting for clearance");
                                }
                                tokio::time::sleep(self.policy.poll_interval).await;
                                NavEvent::ChallengePresent {
                                    waited: waited + self.policy.poll_interval,
                                }
                            } else {
                                html = body;
                                NavEvent::ChallengeCleared
                            }
                        }
                        Err(e) => NavEvent::LoadFailed(e),
                    };
                    NavState::AwaitingChallenge { attempt, waited }.on(event, &self.policy)
                }
                NavState::Ready => return Ok(html),
                NavState::Failed(e) => return Err(e),
            };
        }
    }

    async fn perform(&mut self, action: NavAction<'_>) -> Result<(), BrowserError> {
        let timeout = self.policy.page_load_timeout;
        let step = async {
            match action {
                NavAction::Goto(url) => self.page.goto(url, timeout).await,
                NavAction::Click(selector) => self.page.click(selector, timeout).await,
            }
        };
        // Hard ceiling in case the page implementation ignores its own timeout.
        match tokio::time::timeout(timeout + Duration::from_secs(5), step).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::StepTimeout(timeout.as_millis() as u64)),
        }
    }

    async fn snapshot(&mut self) -> Result<(String, String), BrowserError> {
        let title = self.page.title().await?;
        let content = self.page.content().await?;
        Ok((title, content))
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{ScriptedPage, fast_policy};
    use super::*;

    #[test]
    fn detector_matches_cloudflare_interstitial() {
        let detector = ChallengeDetector::default();
        assert!(detector.is_challenge("Just a moment...", ""));
        assert!(detector.is_challenge("BFI", "<div id=\"challenge-platform\"></div>"));
        assert!(!detector.is_challenge("BFI Southbank | Whats on", "<main>Films</main>"));
    }

    #[test]
    fn transitions_follow_policy() {
        let policy = fast_policy();
        let state = NavState::Navigating { attempt: 1 }.on(NavEvent::Loaded, &policy);
        assert!(matches!(state, NavState::AwaitingChallenge { attempt: 1, .. }));

        let state = state.on(
            NavEvent::ChallengePresent {
                waited: Duration::from_millis(10),
            },
            &policy,
        );
        assert!(matches!(state, NavState::AwaitingChallenge { attempt: 1, .. }));

        // Challenge outlives its budget: retry once, then fail.
        let state = state.on(
            NavEvent::ChallengePresent {
                waited: Duration::from_millis(30),
            },
            &policy,
        );
        assert!(matches!(state, NavState::Navigating { attempt: 2 }));
        let state = NavState::AwaitingChallenge {
            attempt: 2,
            waited: Duration::ZERO,
        }
        .on(
            NavEvent::ChallengePresent {
                waited: Duration::from_secs(1),
            },
            &policy,
        );
        assert!(matches!(state, NavState::Failed(BrowserError::ChallengeTimeout(_))));
    }

    #[test]
    fn terminal_states_absorb_events() {
        let policy = fast_policy();
        let state = NavState::Ready.on(NavEvent::LoadFailed(BrowserError::StepTimeout(1)), &policy);
        assert!(state.is_terminal());
        assert!(matches!(state, NavState::Ready));
    }

    #[test]
    fn permanent_errors_fail_immediately() {
        let policy = fast_policy();
        let state = NavState::Navigating { attempt: 1 }.on(
            NavEvent::LoadFailed(BrowserError::Launch("no chromium".into())),
            &policy,
        );
        assert!(matches!(state, NavState::Failed(BrowserError::Launch(_))));
    }

    #[tokio::test]
    async fn waits_for_challenge_to_clear() {
        let mut page = ScriptedPage::default();
        page.push_challenge_then(3, "What's On", "<main>listings</main>");
        let mut nav = Navigator::new(&mut page, fast_policy());
        let html = nav.settle(NavAction::Goto("https://whatson.bfi.org.uk")).await.unwrap();
        assert_eq!(html, "<main>listings</main>");
    }

    #[tokio::test]
    async fn retries_navigation_after_failure() {
        let mut page = ScriptedPage::default();
        page.loads.push_back(Err(BrowserError::Navigation {
            url: "https://whatson.bfi.org.uk".into(),
            message: "net::ERR_TIMED_OUT".into(),
        }));
        page.push_page("What's On", "<main>ok</main>");
        let html = Navigator::new(&mut page, fast_policy())
            .settle(NavAction::Goto("https://whatson.bfi.org.uk"))
            .await
            .unwrap();
        assert_eq!(html, "<main>ok</main>");
        assert_eq!(page.visited.len(), 2);
    }

    #[tokio::test]
    async fn challenge_that_never_clears_fails() {
        let mut page = ScriptedPage::default();
        page.push_challenge_then(1_000, "never", "");
        page.push_challenge_then(1_000, "never", "");
        let err = Navigator::new(&mut page, fast_policy())
            .settle(NavAction::Click("td[data-date='2025-01-06']"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::ChallengeTimeout(_)));
        assert_eq!(page.clicked.len(), 2);
    }
}
