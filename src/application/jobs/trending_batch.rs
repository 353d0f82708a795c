//! Cron job driving the recurring trending batch.

use std::str::FromStr;

use apalis::prelude::{Data, Error as ApalisError};
use apalis_cron::Schedule;
use tracing::{debug, warn};

use super::context::JobWorkerContext;

/// Marker struct for the cron-triggered batch job.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron
/// compatibility.
#[derive(Default, Debug, Clone)]
pub struct TrendingBatchJob;

impl From<chrono::DateTime<chrono::Utc>> for TrendingBatchJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

/// Process one scheduled batch tick. A failed run is logged and swallowed:
/// the previous generation keeps serving reads and the next tick retries.
pub async fn process_trending_batch_job(
    _job: TrendingBatchJob,
    ctx: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    match ctx.batch.run_batch().await {
        Ok(true) => {}
        Ok(false) => {
            debug!("Trending batch tick skipped (lock held or nothing to rank)");
        }
        Err(err) => {
            warn!(error = %err, "Trending batch failed; previous generation keeps serving");
        }
    }
    Ok(())
}

/// Parse the batch cadence from a cron expression (seconds field included).
pub fn trending_batch_schedule(expression: &str) -> Result<Schedule, <Schedule as FromStr>::Err> {
    Schedule::from_str(expression)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_parses_and_ticks() {
        let schedule = trending_batch_schedule("0 */10 * * * *").expect("valid cron expression");
        let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();
        assert_eq!(upcoming.len(), 3);
    }

    #[test]
    fn malformed_schedule_is_rejected() {
        assert!(trending_batch_schedule("every ten minutes").is_err());
    }
}
