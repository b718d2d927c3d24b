//! Screening-count anomaly detection against a rolling per-venue baseline.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Europe::London;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::StoreError;
use crate::model::{VenueBaseline, VenueDefinition};
use crate::store::ScreeningStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayKind {
    Weekday,
    Weekend,
}

impl DayKind {
    /// Classified by the London calendar day of `at`.
    pub fn of(at: DateTime<Utc>) -> Self {
        match at.with_timezone(&London).weekday() {
            Weekday::Sat | Weekday::Sun => DayKind::Weekend,
            _ => DayKind::Weekday,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAssessment {
    pub venue_id: String,
    pub count: usize,
    pub day_kind: DayKind,
    pub baseline: Option<f64>,
    pub percent_change: Option<f64>,
    pub tolerance_percent: f64,
    pub anomaly_detected: bool,
    pub should_block: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Structured alert handed to the alerting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub venue_id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub assessment: Option<HealthAssessment>,
    pub raised_at: DateTime<Utc>,
}

/// Fire-and-forget alert delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &AlertPayload);
}

/// Writes alerts to the log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &AlertPayload) {
        match alert.severity {
            AlertSeverity::Critical => error!(venue = %alert.venue_id, message = %alert.message, "alert"),
            AlertSeverity::Warning => warn!(venue = %alert.venue_id, message = %alert.message, "alert"),
        }
    }
}

pub struct HealthMonitor {
    store: Arc<dyn ScreeningStore>,
    config: HealthConfig,
    sink: Arc<dyn AlertSink>,
    /// Serializes baseline updates per venue within this process.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn ScreeningStore>, config: HealthConfig) -> Self {
        Self {
            store,
            config,
            sink: Arc::new(LogAlertSink),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Compares a run's count with the stored baseline. Read-only.
    pub async fn assess(
        &self,
        venue: &VenueDefinition,
        count: usize,
        at: DateTime<Utc>,
    ) -> Result<HealthAssessment, StoreError> {
        let baseline = self.store.get_baseline(&venue.id).await?;
        let assessment = evaluate(&self.config, venue, baseline.as_ref(), count, DayKind::of(at));
        debug!(
            venue = %venue.id,
            count,
            baseline = ?assessment.baseline,
            change = ?assessment.percent_change,
            anomaly = assessment.anomaly_detected,
            block = assessment.should_block,
            "health assessed"
        );
        Ok(assessment)
    }

    /// Folds `count` into the venue's baseline. Pinned baselines are returned
    /// untouched. Concurrent writers from other processes are caught by the
    /// store's version check and retried.
    pub async fn record(
        &self,
        venue_id: &str,
        count: usize,
        at: DateTime<Utc>,
    ) -> Result<VenueBaseline, StoreError> {
        let lock = self.venue_lock(venue_id);
        let _guard = lock.lock().await;

        let day = DayKind::of(at);
        let mut attempt = 1;
        loop {
            let current = self.store.get_baseline(venue_id).await?;
            if let Some(pinned) = current.as_ref().filter(|b| b.manual_override) {
                debug!(venue = venue_id, "baseline pinned, not updated");
                return Ok(pinned.clone());
            }
            let next = fold(current.as_ref(), venue_id, count, day, self.config.smoothing, at);
            match self.store.set_baseline(&next, current.map(|b| b.version)).await {
                Ok(stored) => {
                    info!(
                        venue = venue_id,
                        weekday_avg = stored.weekday_avg,
                        weekend_avg = stored.weekend_avg,
                        samples = stored.samples,
                        "baseline updated"
                    );
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < self.config.max_update_attempts => {
                    warn!(venue = venue_id, attempt, "baseline changed underneath us, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Raises an alert for anomalous assessments; quiet otherwise.
    pub async fn report(&self, assessment: &HealthAssessment, at: DateTime<Utc>) {
        if !assessment.anomaly_detected && !assessment.should_block {
            return;
        }
        let severity = if assessment.should_block {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        self.sink
            .send(&AlertPayload {
                venue_id: assessment.venue_id.clone(),
                severity,
                message: assessment.recommendation.clone(),
                assessment: Some(assessment.clone()),
                raised_at: at,
            })
            .await;
    }

    pub async fn report_failure(&self, venue_id: &str, message: &str, at: DateTime<Utc>) {
        self.sink
            .send(&AlertPayload {
                venue_id: venue_id.to_string(),
                severity: AlertSeverity::Critical,
                message: format!("run failed: {message}"),
                assessment: None,
                raised_at: at,
            })
            .await;
    }

    fn venue_lock(&self, venue_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(venue_id.to_string())
            .or_default()
            .clone()
    }
}

/// Pure anomaly rule. Tolerance comes from the venue, then the stored
/// baseline, then the configured default.
pub fn evaluate(
    config: &HealthConfig,
    venue: &VenueDefinition,
    baseline: Option<&VenueBaseline>,
    count: usize,
    day: DayKind,
) -> HealthAssessment {
    let tolerance = venue
        .tolerance_percent
        .or(baseline.and_then(|b| b.tolerance_percent))
        .unwrap_or(config.default_tolerance_percent);
    let expected = baseline.map(|b| match day {
        DayKind::Weekday => b.weekday_avg,
        DayKind::Weekend => b.weekend_avg,
    });
    let percent_change = expected
        .filter(|b| *b > 0.0)
        .map(|b| (count as f64 - b) / b * 100.0);

    let anomaly_detected = percent_change.is_some_and(|pc| pc.abs() > tolerance);
    let should_block = percent_change.is_some_and(|pc| count == 0 || pc <= -config.block_drop_percent);

    let recommendation = match (expected, percent_change) {
        (None, _) => "No baseline yet; this run becomes the first sample.".to_string(),
        (Some(_), None) => "Baseline is zero; nothing to compare against.".to_string(),
        (Some(b), Some(pc)) if should_block => format!(
            "Hold this run for review: {count} screenings against a baseline of {b:.1} ({pc:+.1}%). \
             The {} scraper may have stopped matching the site's markup.",
            venue.id
        ),
        (Some(b), Some(pc)) if anomaly_detected && pc < 0.0 => format!(
            "Screening count fell {:.1}% below the baseline of {b:.1}; applied, but check the listings.",
            pc.abs()
        ),
        (Some(b), Some(pc)) if anomaly_detected => format!(
            "Screening count rose {pc:.1}% above the baseline of {b:.1}; check for duplicated listings."
        ),
        (Some(_), Some(pc)) => format!("Within tolerance ({pc:+.1}% against ±{tolerance:.0}%)."),
    };

    HealthAssessment {
        venue_id: venue.id.clone(),
        count,
        day_kind: day,
        baseline: expected,
        percent_change,
        tolerance_percent: tolerance,
        anomaly_detected,
        should_block,
        recommendation,
    }
}

/// Exponential moving average of the day kind's count. The first sample
/// seeds both averages.
fn fold(
    current: Option<&VenueBaseline>,
    venue_id: &str,
    count: usize,
    day: DayKind,
    smoothing: f64,
    at: DateTime<Utc>,
) -> VenueBaseline {
    let count = count as f64;
    let Some(b) = current else {
        return VenueBaseline {
            venue_id: venue_id.to_string(),
            weekday_avg: count,
            weekend_avg: count,
            samples: 1,
            tolerance_percent: None,
            manual_override: false,
            version: 0,
            updated_at: at,
        };
    };
    let ema = |avg: f64| smoothing * count + (1.0 - smoothing) * avg;
    let (weekday_avg, weekend_avg) = match day {
        DayKind::Weekday => (ema(b.weekday_avg), b.weekend_avg),
        DayKind::Weekend => (b.weekday_avg, ema(b.weekend_avg)),
    };
    VenueBaseline {
        weekday_avg,
        weekend_avg,
        samples: b.samples + 1,
        updated_at: at,
        ..b.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::venues::ScraperKind;
    use crate::venues::test_support::{utc, venue};

    const MONDAY: &str = "2025-01-06T19:00:00Z";
    const SATURDAY: &str = "2025-01-04T19:00:00Z";

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<AlertPayload>>);

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, alert: &AlertPayload) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    fn baseline(avg: f64) -> VenueBaseline {
        VenueBaseline {
            venue_id: "ica".into(),
            weekday_avg: avg,
            weekend_avg: avg,
            samples: 10,
            tolerance_percent: Some(30.0),
            manual_override: false,
            version: 0,
            updated_at: utc(MONDAY),
        }
    }

    fn ica() -> VenueDefinition {
        venue("ica", ScraperKind::Ica, "https://www.ica.art")
    }

    #[test]
    fn collapse_to_five_blocks_the_run() {
        let a = evaluate(&HealthConfig::default(), &ica(), Some(&baseline(40.0)), 5, DayKind::Weekday);
        assert_eq!(a.percent_change, Some(-87.5));
        assert!(a.anomaly_detected);
        assert!(a.should_block);
        assert!(a.recommendation.starts_with("Hold this run"));
    }

    #[test]
    fn tolerance_band_and_overrides() {
        let config = HealthConfig::default();
        let b = baseline(40.0);
        let within = evaluate(&config, &ica(), Some(&b), 32, DayKind::Weekday);
        assert!(!within.anomaly_detected && !within.should_block);

        let spike = evaluate(&config, &ica(), Some(&b), 60, DayKind::Weekday);
        assert!(spike.anomaly_detected && !spike.should_block);

        let mut lenient = ica();
        lenient.tolerance_percent = Some(60.0);
        let drop = evaluate(&config, &lenient, Some(&b), 20, DayKind::Weekday);
        assert_eq!(drop.tolerance_percent, 60.0);
        assert!(!drop.anomaly_detected);
        // Blocking does not depend on the tolerance band.
        assert!(drop.should_block);
    }

    #[test]
    fn no_baseline_no_anomaly() {
        let config = HealthConfig::default();
        let a = evaluate(&config, &ica(), None, 0, DayKind::Weekday);
        assert!(!a.anomaly_detected && !a.should_block);
        let a = evaluate(&config, &ica(), Some(&baseline(0.0)), 0, DayKind::Weekday);
        assert!(!a.anomaly_detected && !a.should_block);
    }

    #[test]
    fn weekend_runs_use_the_weekend_average() {
        assert_eq!(DayKind::of(utc(SATURDAY)), DayKind::Weekend);
        // Sunday 23:30 UTC in summer is already Monday in London.
        assert_eq!(DayKind::of(utc("2025-06-01T23:30:00Z")), DayKind::Weekday);

        let mut b = baseline(40.0);
        b.weekend_avg = 80.0;
        let a = evaluate(&HealthConfig::default(), &ica(), Some(&b), 40, DayKind::Weekend);
        assert_eq!(a.baseline, Some(80.0));
        assert_eq!(a.percent_change, Some(-50.0));
    }

    #[tokio::test]
    async fn record_seeds_then_smooths() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = HealthMonitor::new(store.clone(), HealthConfig::default());

        let first = monitor.record("ica", 40, utc(MONDAY)).await.unwrap();
        assert_eq!((first.weekday_avg, first.weekend_avg, first.samples), (40.0, 40.0, 1));

        let second = monitor.record("ica", 50, utc(SATURDAY)).await.unwrap();
        assert_eq!(second.weekday_avg, 40.0);
        assert!((second.weekend_avg - 43.0).abs() < 1e-9);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn pinned_baseline_is_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let mut pinned = baseline(40.0);
        pinned.manual_override = true;
        store.set_baseline(&pinned, None).await.unwrap();

        let monitor = HealthMonitor::new(store.clone(), HealthConfig::default());
        let after = monitor.record("ica", 5, utc(MONDAY)).await.unwrap();
        assert_eq!(after.weekday_avg, 40.0);
        assert_eq!(after.version, 1);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = Arc::new(HealthMonitor::new(store.clone(), HealthConfig::default()));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.record("ica", 40, utc(MONDAY)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let stored = store.get_baseline("ica").await.unwrap().unwrap();
        assert_eq!(stored.samples, 8);
        assert_eq!(stored.version, 8);
    }

    #[tokio::test]
    async fn anomalies_reach_the_sink() {
        let store = Arc::new(InMemoryStore::new());
        store.set_baseline(&baseline(40.0), None).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let monitor = HealthMonitor::new(store, HealthConfig::default()).with_sink(sink.clone());

        let healthy = monitor.assess(&ica(), 38, utc(MONDAY)).await.unwrap();
        monitor.report(&healthy, utc(MONDAY)).await;
        let broken = monitor.assess(&ica(), 5, utc(MONDAY)).await.unwrap();
        monitor.report(&broken, utc(MONDAY)).await;

        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].assessment.as_ref().unwrap().count, 5);
    }
}
