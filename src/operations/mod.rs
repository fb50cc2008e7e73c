//! Pipeline operations
//!
//! Leaves first: hasher, copier, stability gate and retry policy are pure
//! building blocks. The orchestrators drive them per job; the supervisor
//! owns scheduling and recovery.

pub mod copier;
pub mod copy_orchestrator;
pub mod hasher;
pub mod retry;
pub mod stability;
pub mod supervisor;
pub mod verify_orchestrator;

use crate::domain::{Job, JobEvent, JobState};
use crate::infrastructure::events::{EventBus, PipelineEvent};
use crate::infrastructure::journal::{job_not_found, Journal, StateChange};
use crate::shared::{ReplicatorError, Result};

/// Apply a job event and persist it with compare-and-swap
///
/// On a concurrency conflict the job is re-read and the event re-applied;
/// a sibling writer that already landed the same transition counts as
/// success. The audit append is fire-and-forget per the journal contract.
pub(crate) async fn transition_job(
	journal: &Journal,
	events: &EventBus,
	job: &mut Job,
	event: JobEvent,
) -> Result<JobState> {
	const MAX_TRIES: u32 = 5;
	let mut tries = 0;

	loop {
		let snapshot = job.clone();
		let old = job.state;
		let next = job.apply(event)?;

		match journal.jobs.update(job).await {
			Ok(()) => {
				journal
					.state_log
					.record(StateChange::job(job.id, old, next))
					.await;
				events.emit(PipelineEvent::JobStateChanged {
					job_id: job.id,
					old_state: old,
					new_state: next,
				});
				return Ok(next);
			}
			Err(ReplicatorError::ConcurrencyConflict { .. }) if tries < MAX_TRIES => {
				tries += 1;
				*job = journal
					.jobs
					.find(snapshot.id)
					.await?
					.ok_or_else(|| job_not_found(snapshot.id))?;
				if job.state == next {
					return Ok(next);
				}
			}
			Err(e) => {
				*job = snapshot;
				return Err(e);
			}
		}
	}
}
