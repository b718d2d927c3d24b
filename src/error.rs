use thiserror::Error;

/// Errors raised while fetching or parsing a venue's listings.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid selector `{0}`")]
    Selector(String),

    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("unexpected markup: {0}")]
    Markup(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("scraper misconfigured: {0}")]
    Misconfigured(String),
}

impl ScrapeError {
    /// Whether retrying the same unit of work could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ScrapeError::Http(e) => crate::retry::is_retryable_http(e),
            ScrapeError::Timeout(_) => true,
            ScrapeError::Browser(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("bot challenge did not clear within {0}s")]
    ChallengeTimeout(u64),

    #[error("element `{0}` not found")]
    ElementNotFound(String),

    #[error("browser bridge protocol error: {0}")]
    Protocol(String),

    #[error("browser step timed out after {0}ms")]
    StepTimeout(u64),

    #[error("I/O error talking to browser bridge: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrowserError::Navigation { .. }
                | BrowserError::ChallengeTimeout(_)
                | BrowserError::StepTimeout(_)
                | BrowserError::ElementNotFound(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// The store itself is unusable, as opposed to one record being rejected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Io(_) | StoreError::Json(_) | StoreError::Transaction(_)
        )
    }
}

/// Failures of the external matching collaborators. These never abort a run;
/// the resolver degrades to a weaker strategy instead.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("metadata provider request failed: {0}")]
    Provider(#[from] reqwest::Error),

    #[error("metadata provider returned {status}: {message}")]
    ProviderStatus { status: u16, message: String },

    #[error("extractor reply could not be parsed: {0}")]
    Parse(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("store error during matching: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that abort a single venue run. They are reported back to the
/// caller as `success = false`, never propagated as a panic.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown venue `{0}`")]
    UnknownVenue(String),

    #[error("venue `{0}` is disabled")]
    Disabled(String),

    #[error("scrape failed: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("storage failed: {0}")]
    Store(#[from] StoreError),

    #[error("venue run exceeded its {0}s budget")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline is shutting down")]
    Shutdown,
}

pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;
