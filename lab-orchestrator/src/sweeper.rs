//! Background expiry and failure sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lab_core::LabStatus;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::manager::LabManager;

/// Counts for one sweep pass. Per-lab failures are logged and counted; they
/// never stop the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl LabManager {
    /// Clean up and expire every lab whose end time is before `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let labs = match self.repository.get_expired_labs(now).await {
            Ok(labs) => labs,
            Err(e) => {
                error!("Failed to list expired labs: {}", e);
                report.failed += 1;
                return report;
            }
        };

        // Failed labs are left to the stuck-error sweep
        for lab in labs.into_iter().filter(|lab| lab.status.is_active()) {
            info!(lab_id = %lab.id, "Lab '{}' reached its end time, expiring", lab.name);
            let result = match self.handle(&lab.id).await {
                Ok(handle) => self.expire(&handle).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => report.expired += 1,
                Err(e) => {
                    error!(lab_id = %lab.id, "Failed to expire lab: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Clean up and delete labs that have been in `Error` for longer than
    /// the configured threshold.
    pub async fn sweep_stuck_errors(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let threshold = match chrono::Duration::from_std(self.settings.stuck_error_threshold) {
            Ok(threshold) => threshold,
            Err(e) => {
                error!("Invalid stuck-error threshold: {}", e);
                report.failed += 1;
                return report;
            }
        };

        let labs = match self.repository.get_labs_by_status(LabStatus::Error).await {
            Ok(labs) => labs,
            Err(e) => {
                error!("Failed to list failed labs: {}", e);
                report.failed += 1;
                return report;
            }
        };

        for lab in labs.into_iter().filter(|lab| now - lab.updated_at > threshold) {
            info!(lab_id = %lab.id, "Lab '{}' stuck in error since {}, deleting", lab.name, lab.updated_at);
            match self.delete_lab(&lab.id).await {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    error!(lab_id = %lab.id, "Failed to delete failed lab: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Both sweeps. Stuck labs go first so an `Error` lab past its end time
    /// is deleted rather than merely expired.
    pub async fn run_sweep(&self) -> SweepReport {
        let now = Utc::now();
        let stuck = self.sweep_stuck_errors(now).await;
        let expired = self.sweep_expired(now).await;
        SweepReport {
            expired: expired.expired,
            deleted: stuck.deleted,
            failed: stuck.failed + expired.failed,
        }
    }
}

pub async fn start_sweeper_task(manager: Arc<LabManager>, every: Duration, cancel: CancellationToken) {
    let every = every.max(Duration::from_secs(1));
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Sweeper task running (checks every {} seconds)", every.as_secs());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sweeper task stopped");
                break;
            }
            _ = interval.tick() => {
                let report = manager.run_sweep().await;
                if report == SweepReport::default() {
                    debug!("Sweep found nothing to do");
                } else {
                    info!(
                        "Sweep finished: {} expired, {} deleted, {} failed",
                        report.expired, report.deleted, report.failed
                    );
                }
            }
        }
    }
}
