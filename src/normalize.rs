//! Title cleanup, event classification and metadata hints for raw listings.
//!
//! Everything is driven by a table of [`PatternSpec`] rows so the rule set
//! can be replaced from configuration without touching control flow.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NormalizeConfig;
use crate::error::ConfigError;
use crate::model::{EventType, RawScreening};

/// One row of the pattern table. `pattern` is a case-insensitive regex tried
/// against the title while it is being cleaned; anchor it with `^` or `$` to
/// pin it to a prefix or suffix.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternSpec {
    pub pattern: String,
    #[serde(default)]
    pub event: Option<EventType>,
    #[serde(default)]
    pub format: Option<String>,
    /// Remove the matched text from the title.
    #[serde(default = "default_strip")]
    pub strip: bool,
}

fn default_strip() -> bool {
    true
}

impl PatternSpec {
    fn event(pattern: &str, event: EventType) -> Self {
        Self {
            pattern: pattern.to_string(),
            event: Some(event),
            format: None,
            strip: true,
        }
    }

    fn format(pattern: String, format: &str) -> Self {
        Self {
            pattern,
            event: None,
            format: Some(format.to_string()),
            strip: true,
        }
    }
}

/// The built-in table. Earlier rows win when several event rows match.
pub fn default_patterns() -> Vec<PatternSpec> {
    const SEP: &str = r"\s*[:\-–|]\s*";
    let mut rows = vec![
        PatternSpec::event(
            &format!(
                r"^(?:saturday morning picture club|kids'? club|family film club|toddler time|parent (?:and|&) baby){SEP}"
            ),
            EventType::KidsScreening,
        ),
        PatternSpec::event(
            r"^(?:(?:uk|world|european|london)\s+)?premiere\s*[:\-–|]?\s*",
            EventType::Premiere,
        ),
        PatternSpec::event(
            &format!(r"^(?:sneak\s+)?preview(?:\s+screening)?{SEP}"),
            EventType::Preview,
        ),
        PatternSpec::event(r"^sing[\s\-]?a[\s\-]?long\s*[:\-–|]?\s*", EventType::SingAlong),
        PatternSpec::event(r"\s*[:\-–]?\s*\bsing[\s\-]?a[\s\-]?long\s*$", EventType::SingAlong),
        PatternSpec::event(&format!(r"^double\s+bill{SEP}"), EventType::DoubleBill),
        PatternSpec::event(&format!(r"^(?:all[\s\-]nighter|marathon){SEP}"), EventType::Marathon),
        PatternSpec::event(r"\s*\+\s*(?:q\s*&\s*a|q\s+and\s+a|qa)\b.*$", EventType::QAndA),
        PatternSpec::event(r"\s*\+\s*intro(?:duction|duced)?\b.*$", EventType::Intro),
        PatternSpec::event(r"\s*\+\s*(?:discussion|panel|talk)\b.*$", EventType::Discussion),
    ];
    for (token, label) in [("35mm", "35mm"), ("70mm", "70mm"), ("16mm", "16mm"), ("imax", "IMAX")] {
        rows.push(PatternSpec::format(format!(r"^{token}{SEP}"), label));
        rows.push(PatternSpec::format(
            format!(r"\s*(?:[\-–:]\s*|[\(\[]\s*)(?:on\s+|in\s+)?{token}\s*[\)\]]?\s*$"),
            label,
        ));
    }
    rows
}

const SERIES_KEYWORDS: &[&str] = &[
    "club", "presents", "season", "series", "festival", "classics", "weekender", "late", "kids",
    "screening", "cinema", "retrospective",
];

#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    event: Option<EventType>,
    format: Option<String>,
    strip: bool,
}

/// Result of [`Normalizer::clean_title`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanedTitle {
    pub title: String,
    pub event_type: Option<EventType>,
    /// Text removed by the winning event row, e.g. "Q&A with the director".
    pub event_text: Option<String>,
    pub format: Option<String>,
    pub year: Option<i32>,
    /// More than one distinct event row matched.
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataHints {
    pub director: Option<String>,
    pub year: Option<i32>,
}

/// A raw screening after title cleanup and classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedScreening {
    pub raw: RawScreening,
    pub title: String,
    pub event_type: Option<EventType>,
    pub event_description: Option<String>,
    pub format: Option<String>,
    pub year_hint: Option<i32>,
    pub director_hint: Option<String>,
    /// The raw title looked like a bare film title.
    pub likely_clean: bool,
    pub ambiguous: bool,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    patterns: Vec<Pattern>,
    certificate: Regex,
    trailing_year: Regex,
    colon_prefix: Regex,
    director: Regex,
    year: Regex,
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("bad pattern `{pattern}`: {e}")))
}

impl Normalizer {
    pub fn new(specs: &[PatternSpec]) -> Result<Self, ConfigError> {
        let patterns = specs
            .iter()
            .map(|spec| {
                Ok(Pattern {
                    regex: compile(&spec.pattern)?,
                    event: spec.event,
                    format: spec.format.clone(),
                    strip: spec.strip,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        // An initial ("F.") or a capitalised word.
        let name = r"(?:\p{Lu}\.|\p{Lu}[\p{L}'’\-]+)";
        let director = Regex::new(&format!(
            r"(?i:\bdir(?:\.|:)|\bdirector:?|\bdirected\s+by)\s*({name}(?:\s+{name}){{0,3}})"
        ))
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            patterns,
            certificate: compile(r"\s*[\(\[]\s*(?:u|pg|12a?|15|18|r18|c?tbc)\s*\*?\s*[\)\]]")?,
            trailing_year: compile(r"\s*\((\d{4})\)\s*$")?,
            colon_prefix: compile(r"^([^:]{1,30}):\s*\S")?,
            director,
            year: compile(r"\b((?:19|20)\d{2})\b")?,
        })
    }

    pub fn from_config(config: &NormalizeConfig) -> Result<Self, ConfigError> {
        match &config.patterns {
            Some(specs) => Self::new(specs),
            None => Self::new(&default_patterns()),
        }
    }

    /// Strips event and format cruft, certificates and a trailing year.
    pub fn clean_title(&self, raw: &str) -> CleanedTitle {
        let mut title = raw.trim().to_string();
        let mut events: Vec<EventType> = Vec::new();
        let mut event_text = None;
        let mut format = None;

        // Repeat until nothing strips so stacked prefixes ("35mm: Preview: ...") all go.
        for _ in 0..4 {
            let mut stripped = false;
            for pattern in &self.patterns {
                let Some((range, matched)) = pattern
                    .regex
                    .find(&title)
                    .map(|m| (m.range(), m.as_str().to_string()))
                else {
                    continue;
                };
                if let Some(event) = pattern.event
                    && !events.contains(&event)
                {
                    if events.is_empty() {
                        event_text = Some(separator_trimmed(&matched)).filter(|t| !t.is_empty());
                    }
                    events.push(event);
                }
                if format.is_none() {
                    format = pattern.format.clone();
                }
                if pattern.strip && !matched.is_empty() {
                    title.replace_range(range, " ");
                    title = title.trim().to_string();
                    stripped = true;
                }
            }
            if !stripped {
                break;
            }
        }

        title = self.certificate.replace_all(&title, "").into_owned();
        let mut year = None;
        if let Some(caps) = self.trailing_year.captures(&title) {
            year = caps.get(1).and_then(|y| y.as_str().parse().ok());
            title = self.trailing_year.replace(&title, "").into_owned();
        }
        let mut title = collapse_whitespace(&title);
        title = title
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '–' | '|' | ','))
            .to_string();
        if title.is_empty() {
            title = collapse_whitespace(raw);
        }

        CleanedTitle {
            title,
            event_type: events.first().copied(),
            event_text,
            format,
            year,
            ambiguous: events.len() > 1,
        }
    }

    /// First matching event row wins; any other distinct match marks the
    /// result ambiguous.
    pub fn detect_event_type(&self, raw: &str) -> (Option<EventType>, bool) {
        let cleaned = self.clean_title(raw);
        (cleaned.event_type, cleaned.ambiguous)
    }

    /// Director and year hints from free text around a listing.
    pub fn extract_metadata(&self, text: &str) -> MetadataHints {
        let director = self
            .director
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().trim_end_matches(',').to_string())
            .filter(|d| !d.is_empty());
        let year = self
            .year
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        MetadataHints { director, year }
    }

    /// Cheap check for titles that already look like a bare film title.
    /// Titles failing it are worth sending to the title extractor.
    pub fn is_likely_clean_title(&self, raw: &str) -> bool {
        let raw = raw.trim();
        if self.patterns.iter().any(|p| p.strip && p.regex.is_match(raw)) {
            return false;
        }

        if let Some(caps) = self.colon_prefix.captures(raw)
            && let Some(prefix) = caps.get(1)
        {
            let prefix = prefix.as_str().trim();
            let has_letters = prefix.chars().any(char::is_alphabetic);
            if has_letters && !prefix.chars().any(char::is_lowercase) {
                return false;
            }
            let lower = prefix.to_lowercase();
            if lower.split_whitespace().any(|w| SERIES_KEYWORDS.contains(&w)) {
                return false;
            }
        }

        // "UK PREMIERE Some Film": a shouted run followed by normal casing.
        let words: Vec<&str> = raw.split_whitespace().collect();
        let shouted = words
            .iter()
            .take_while(|w| {
                w.chars().any(char::is_alphabetic) && !w.chars().any(char::is_lowercase)
            })
            .count();
        if shouted >= 2 && words[shouted..].iter().any(|w| w.chars().any(char::is_lowercase)) {
            return false;
        }
        true
    }

    pub fn normalize(&self, raw: RawScreening) -> NormalizedScreening {
        let cleaned = self.clean_title(&raw.title);
        let hints = raw
            .listing_text
            .as_deref()
            .map(|t| self.extract_metadata(t))
            .unwrap_or_default();
        let likely_clean = self.is_likely_clean_title(&raw.title);
        if cleaned.ambiguous {
            debug!(venue = %raw.venue_id, title = %raw.title, "several event patterns matched");
        }

        NormalizedScreening {
            title: cleaned.title,
            event_type: cleaned.event_type.or(raw.event_type),
            event_description: raw.event_description.clone().or(cleaned.event_text),
            format: raw.format.clone().or(cleaned.format),
            year_hint: raw.year.or(cleaned.year).or(hints.year),
            director_hint: raw.director.clone().or(hints.director),
            likely_clean,
            ambiguous: cleaned.ambiguous,
            raw,
        }
    }
}

fn separator_trimmed(text: &str) -> String {
    text.trim_matches(|c: char| c.is_whitespace() || matches!(c, '+' | ':' | '-' | '–' | '|'))
        .to_string()
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::test_support::utc;

    fn normalizer() -> Normalizer {
        Normalizer::new(&default_patterns()).unwrap()
    }

    #[test]
    fn kids_club_prefix_is_stripped_and_classified() {
        let n = normalizer();
        let cleaned = n.clean_title("Saturday Morning Picture Club: The Muppets Christmas Carol");
        assert_eq!(cleaned.title, "The Muppets Christmas Carol");
        assert_eq!(cleaned.event_type, Some(EventType::KidsScreening));
        assert_eq!(cleaned.event_type.map(|e| e.label()), Some("kids screening"));
        assert!(!cleaned.ambiguous);
    }

    #[test]
    fn format_prefix_and_certificate_are_stripped() {
        let cleaned = normalizer().clean_title("35mm: Casablanca (PG)");
        assert_eq!(cleaned.title, "Casablanca");
        assert_eq!(cleaned.format.as_deref(), Some("35mm"));
        assert_eq!(cleaned.event_type, None);
    }

    #[test]
    fn suffixes_years_and_whitespace() {
        let n = normalizer();
        let cleaned = n.clean_title("Nosferatu  (1922) [12A] - 70mm");
        assert_eq!(cleaned.title, "Nosferatu");
        assert_eq!(cleaned.year, Some(1922));
        assert_eq!(cleaned.format.as_deref(), Some("70mm"));

        let cleaned = n.clean_title("Paris, Texas + Q&A with Wim Wenders");
        assert_eq!(cleaned.title, "Paris, Texas");
        assert_eq!(cleaned.event_type, Some(EventType::QAndA));
        assert_eq!(cleaned.event_text.as_deref(), Some("Q&A with Wim Wenders"));
    }

    #[test]
    fn stacked_prefixes_all_go() {
        let cleaned = normalizer().clean_title("35mm: Preview: Anora");
        assert_eq!(cleaned.title, "Anora");
        assert_eq!(cleaned.event_type, Some(EventType::Preview));
        assert_eq!(cleaned.format.as_deref(), Some("35mm"));
    }

    #[test]
    fn distinct_event_matches_are_ambiguous_first_wins() {
        let (event, ambiguous) = normalizer().detect_event_type("Preview: Anora + Q&A");
        assert_eq!(event, Some(EventType::Preview));
        assert!(ambiguous);
    }

    #[test]
    fn gate_flags_event_and_shouted_prefixes() {
        let n = normalizer();
        assert!(!n.is_likely_clean_title("UK PREMIERE I Only Rest in the Storm"));
        assert!(!n.is_likely_clean_title("Saturday Morning Picture Club: The Muppets Christmas Carol"));
        assert!(!n.is_likely_clean_title("CLASSIC MATINEE: Brief Encounter"));
        assert!(!n.is_likely_clean_title("Queer Horror Nights Presents: Candyman"));
        assert!(!n.is_likely_clean_title("BFI FLARE Some Film"));

        assert!(n.is_likely_clean_title("Casablanca"));
        assert!(n.is_likely_clean_title("Star Wars: A New Hope"));
        assert!(n.is_likely_clean_title("Mission: Impossible"));
        assert!(n.is_likely_clean_title("RRR"));
        assert!(n.is_likely_clean_title("THE GODFATHER"));
    }

    #[test]
    fn metadata_hints_from_listing_text() {
        let n = normalizer();
        let hints = n.extract_metadata("Dir. F. W. Murnau, Germany 1922, 94 mins");
        assert_eq!(hints.director.as_deref(), Some("F. W. Murnau"));
        assert_eq!(hints.year, Some(1922));

        let hints = n.extract_metadata("Directed by Agnès Varda. France.");
        assert_eq!(hints.director.as_deref(), Some("Agnès Varda"));
        assert_eq!(hints.year, None);

        assert_eq!(n.extract_metadata("94 mins").director, None);
    }

    #[test]
    fn normalize_prefers_scraper_hints() {
        let n = normalizer();
        let mut raw = RawScreening::new("ica", "Nosferatu + intro", utc("2025-01-06T19:00:00Z"), "https://b/1");
        raw.listing_text = Some("Dir. F. W. Murnau, Germany 1922".into());
        raw.year = Some(1921);
        let normalized = n.normalize(raw);
        assert_eq!(normalized.title, "Nosferatu");
        assert_eq!(normalized.event_type, Some(EventType::Intro));
        assert_eq!(normalized.year_hint, Some(1921));
        assert_eq!(normalized.director_hint.as_deref(), Some("F. W. Murnau"));
        assert!(!normalized.likely_clean);
    }

    #[test]
    fn configured_table_replaces_defaults() {
        let config: NormalizeConfig = toml::from_str(
            r#"
            [[patterns]]
            pattern = "^cult classics\\s*:\\s*"
            event = "classic"
            "#,
        )
        .unwrap();
        let n = Normalizer::from_config(&config).unwrap();
        let cleaned = n.clean_title("Cult Classics: Repo Man");
        assert_eq!(cleaned.title, "Repo Man");
        assert_eq!(cleaned.event_type, Some(EventType::Classic));
        // Built-in rows are gone.
        assert_eq!(n.clean_title("Preview: Anora").event_type, None);
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let spec = PatternSpec::event("(unclosed", EventType::Preview);
        assert!(matches!(Normalizer::new(&[spec]), Err(ConfigError::Invalid(_))));
    }
}
