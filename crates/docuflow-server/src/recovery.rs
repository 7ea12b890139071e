/*
[INPUT]:  Job store holding state from the previous process instance
[OUTPUT]: Orphaned Processing jobs transitioned to Failed + a report
[POS]:    Startup layer - runs once before the gateway listener opens
[UPDATE]: When the recovery reason or sweep policy changes
*/

use tracing::{info, warn};

use crate::job::JobStatus;
use crate::store::JobStore;

/// Failure reason attached to every job the sweep recovers
pub const RECOVERY_REASON: &str = "Processing was interrupted by a server restart";

/// Outcome of one recovery sweep. Errors are reported, never raised: a
/// failed sweep degrades to clients waiting on the next one instead of
/// blocking startup.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered_count: usize,
    pub errors: Vec<String>,
}

/// Force-fail every job orphaned by a previous process instance.
///
/// Any job still Processing at startup lost its worker, so no further
/// notification can ever arrive for it. Runs before the listener opens; no
/// cross-instance lock is taken, so with several servers booting at once the
/// first sweep to see a stale row wins.
pub fn recover_stuck_jobs(store: &JobStore) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let orphaned = match store.list_jobs_by_status(JobStatus::Processing) {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(error = %err, "recovery sweep could not list processing jobs");
            report.errors.push(err.to_string());
            return report;
        }
    };

    if orphaned.is_empty() {
        info!("recovery sweep found no orphaned jobs");
        return report;
    }

    for job in orphaned {
        match store.mark_failed(&job.job_id, RECOVERY_REASON) {
            Ok(()) => {
                info!(
                    job_id = %job.job_id,
                    file_name = %job.file_name,
                    stage = ?job.stage,
                    "recovered orphaned job"
                );
                report.recovered_count += 1;
            }
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "failed to recover orphaned job");
                report.errors.push(format!("{}: {err}", job.job_id));
            }
        }
    }

    report
}
