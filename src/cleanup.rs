//! Time-based removal of screenings that have already happened.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::StoreError;
use crate::store::ScreeningStore;

/// Deletes screenings that started more than `grace` before `now`. Works
/// purely on elapsed time; whether a later scrape still lists them does not
/// matter.
pub async fn sweep_past_screenings(
    store: &dyn ScreeningStore,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<usize, StoreError> {
    let cutoff = now - grace;
    let removed = store.delete_screenings_before(cutoff).await?;
    info!(removed, cutoff = %cutoff, "past screenings swept");
    Ok(removed)
}
