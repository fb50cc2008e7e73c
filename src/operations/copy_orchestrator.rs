//! Copy orchestrator
//!
//! Drives one job's fan-out to its destination replicas. Copies run in
//! parallel by default (sequential by priority when configured), each
//! bounded by a per-target semaphore. The orchestrator asserts that all
//! replicas of a job carried identical bytes; any disagreement quarantines
//! the job immediately.

use crate::config::ReplicatorConfig;
use crate::domain::{
	Job, JobEvent, JobId, JobState, TargetCopyState, TargetEvent, TargetId, TargetOutcome,
};
use crate::infrastructure::events::{CopyCompletion, EventBus, PipelineEvent};
use crate::infrastructure::journal::{job_not_found, Journal, StateChange};
use crate::infrastructure::metrics::PipelineMetrics;
use crate::shared::{format_bytes, ErrorClass, ReplicatorError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::copier::{self, CopyOutcome};
use super::retry::{OperationKind, RetryDecision, RetryPolicy};
use super::transition_job;

/// Result of one orchestration pass over a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRunResult {
	pub job_state: JobState,
	pub copied: Vec<TargetId>,
	pub failed: Vec<TargetId>,
}

/// Fans one job out to N target copiers and aggregates the outcomes
pub struct CopyOrchestrator {
	journal: Arc<Journal>,
	config: Arc<ReplicatorConfig>,
	policy: RetryPolicy,
	events: EventBus,
	metrics: Arc<PipelineMetrics>,
	/// Caps concurrent copy operations per destination, across jobs
	target_slots: HashMap<TargetId, Arc<Semaphore>>,
}

impl CopyOrchestrator {
	pub fn new(
		journal: Arc<Journal>,
		config: Arc<ReplicatorConfig>,
		events: EventBus,
		metrics: Arc<PipelineMetrics>,
	) -> Self {
		let target_slots = config
			.target_ids()
			.into_iter()
			.map(|id| {
				(
					id,
					Arc::new(Semaphore::new(config.copy.max_concurrent_per_target)),
				)
			})
			.collect();
		Self {
			policy: RetryPolicy::new(config.retry.clone()),
			journal,
			config,
			events,
			metrics,
			target_slots,
		}
	}

	/// One orchestration pass: drive every pending target of the job
	pub async fn process(
		&self,
		job_id: JobId,
		cancel: &watch::Receiver<bool>,
	) -> Result<CopyRunResult> {
		let mut job = self
			.journal
			.jobs
			.find(job_id)
			.await?
			.ok_or_else(|| job_not_found(job_id))?;

		match job.state {
			JobState::Queued => {
				transition_job(&self.journal, &self.events, &mut job, JobEvent::CopyStarted)
					.await?;
			}
			// In-progress passes and re-copies for verification retries
			JobState::InProgress | JobState::Partial => {}
			other => {
				return Err(ReplicatorError::InvalidTransition(
					crate::domain::InvalidTransition::new("job", other, "copy pass"),
				));
			}
		}

		let mut outcomes = self.load_or_create_outcomes(&job).await?;

		// Claim every pending target before any byte moves
		let mut claimed: Vec<usize> = Vec::new();
		for (idx, outcome) in outcomes.iter_mut().enumerate() {
			if outcome.copy_state != TargetCopyState::Pending {
				continue;
			}
			if outcome.final_path.is_none() {
				let old = outcome.copy_state;
				outcome.apply(TargetEvent::CopyStarted)?;
				outcome.fail(
					TargetEvent::PermanentFailure,
					"no destination path recorded for this target",
				)?;
				self.persist_target(outcome, old).await?;
				continue;
			}
			let old = outcome.copy_state;
			outcome.apply(TargetEvent::CopyStarted)?;
			outcome.attempts += 1;
			outcome.temp_path = outcome
				.final_path
				.as_deref()
				.map(copier::temp_path_for);
			outcome.integrity_failure = false;
			outcome.next_retry_at = None;
			self.persist_target(outcome, old).await?;
			claimed.push(idx);
		}

		if claimed.is_empty() {
			let state = self.aggregate(&mut job, &outcomes).await?;
			return Ok(CopyRunResult {
				job_state: state,
				copied: vec![],
				failed: vec![],
			});
		}

		let results = if self.config.copy.parallel_copy_enabled {
			self.dispatch_parallel(&job, &outcomes, &claimed, cancel).await
		} else {
			self.dispatch_sequential(&job, &outcomes, &claimed, cancel).await
		};

		let mut copied = Vec::new();
		let mut failed = Vec::new();
		let mut successes: Vec<(TargetId, CopyOutcome)> = Vec::new();
		let mut integrity_failures: Vec<TargetId> = Vec::new();

		for (target_id, result) in results {
			let Some(outcome) = outcomes.iter_mut().find(|o| o.target_id == target_id) else {
				warn!(job_id = %job.id, target = %target_id, "Copy result for unknown target");
				continue;
			};
			match result {
				Ok(copy_outcome) => {
					outcome.hash = Some(copy_outcome.hash.clone());
					outcome.last_error = None;
					debug!(
						job_id = %job.id,
						target = %target_id,
						"Replica copy landed: {} in {:.1}s",
						format_bytes(copy_outcome.bytes),
						copy_outcome.duration.as_secs_f64()
					);
					self.metrics.incr(&self.metrics.copies_succeeded);
					self.metrics.add_bytes_copied(copy_outcome.bytes);
					self.events.emit(PipelineEvent::TargetCopyCompleted {
						job_id: job.id,
						target_id: target_id.clone(),
						result: CopyCompletion::Succeeded {
							hash: copy_outcome.hash.clone(),
							bytes: copy_outcome.bytes,
						},
					});
					copied.push(target_id.clone());
					successes.push((target_id, copy_outcome));
				}
				Err(ReplicatorError::Cancelled) => {
					// Cooperative cancellation: hand the target back untouched
					let old = outcome.copy_state;
					outcome.apply(TargetEvent::CopyInterrupted)?;
					self.persist_target(outcome, old).await?;
					debug!(job_id = %job.id, target = %target_id, "Copy interrupted");
				}
				Err(e) => {
					self.metrics.incr(&self.metrics.copies_failed);
					if e.class() == ErrorClass::Integrity {
						let old = outcome.copy_state;
						outcome.fail(TargetEvent::PermanentFailure, e.to_string())?;
						outcome.integrity_failure = true;
						self.persist_target(outcome, old).await?;
						integrity_failures.push(target_id.clone());
					} else {
						self.handle_copy_failure(&job, outcome, &e).await?;
					}
					self.events.emit(PipelineEvent::TargetCopyCompleted {
						job_id: job.id,
						target_id: target_id.clone(),
						result: CopyCompletion::Failed {
							error: e.to_string(),
							retryable: outcome.copy_state == TargetCopyState::FailedRetryable,
						},
					});
					failed.push(target_id);
				}
			}
		}

		// A copy stream that disagreed with the recorded source hash is
		// corruption, never a retry candidate
		if !integrity_failures.is_empty() {
			// Healthy sibling copies did land; settle them so a later
			// release can pick the job back up
			self.finish_successes(&mut outcomes, &successes).await?;
			let entry = self
				.journal
				.quarantine
				.quarantine_job(
					&mut job,
					"copy stream hash disagreed with the recorded source hash",
					integrity_failures.clone(),
				)
				.await?;
			self.metrics.incr(&self.metrics.jobs_quarantined);
			self.events.emit(PipelineEvent::JobQuarantined {
				job_id: job.id,
				entry_id: entry.id,
				affected_targets: integrity_failures.clone(),
			});
			return Ok(CopyRunResult {
				job_state: job.state,
				copied,
				failed,
			});
		}

		// Replicas of one source must carry identical bytes
		if let Some(affected) = self.hash_disagreement(&job, &successes) {
			return self
				.quarantine_for_disagreement(&mut job, &mut outcomes, affected, copied)
				.await;
		}

		if !successes.is_empty() {
			let (_, first) = &successes[0];
			job.set_source_hash(first.hash.clone())?;
			self.persist_job_fields(&mut job).await?;
		}

		// Corruption drills hold outcomes in `copying` so the verification
		// sweep cannot observe them mid-window.
		if !successes.is_empty() {
			if let Some(delay) = self.config.verification_delay() {
				tokio::time::sleep(delay).await;
			}
		}

		self.finish_successes(&mut outcomes, &successes).await?;

		let job_state = self.aggregate(&mut job, &outcomes).await?;

		info!(
			job_id = %job.id,
			state = %job_state,
			copied = copied.len(),
			failed = failed.len(),
			"Copy pass finished"
		);

		Ok(CopyRunResult {
			job_state,
			copied,
			failed,
		})
	}

	/// Ensure one outcome row exists per required target
	async fn load_or_create_outcomes(&self, job: &Job) -> Result<Vec<TargetOutcome>> {
		let mut outcomes = self.journal.targets.find_for_job(job.id).await?;

		let file_name = job.source_path.file_name().ok_or_else(|| {
			ReplicatorError::config(format!(
				"source path has no file name: {}",
				job.source_path.display()
			))
		})?;

		for target_id in &job.required_targets {
			if outcomes.iter().any(|o| &o.target_id == target_id) {
				continue;
			}
			let root = self.config.dest_root(target_id).ok_or_else(|| {
				ReplicatorError::config(format!("no destination root for target {target_id}"))
			})?;
			let outcome =
				TargetOutcome::pending(job.id, target_id.clone(), root.path.join(file_name));
			self.journal.targets.insert(&outcome).await?;
			self.journal
				.state_log
				.record(StateChange {
					job_id: job.id,
					entity_type: crate::infrastructure::journal::EntityType::Target,
					entity_id: Some(target_id.to_string()),
					old_state: None,
					new_state: outcome.copy_state.to_string(),
					context: None,
				})
				.await;
			outcomes.push(outcome);
		}

		Ok(outcomes)
	}

	async fn dispatch_parallel(
		&self,
		job: &Job,
		outcomes: &[TargetOutcome],
		claimed: &[usize],
		cancel: &watch::Receiver<bool>,
	) -> Vec<(TargetId, Result<CopyOutcome>)> {
		let mut tasks = JoinSet::new();

		for &idx in claimed {
			let outcome = &outcomes[idx];
			let slot = self.slot_for(&outcome.target_id);
			let spec = TargetCopySpec::from_outcome(job, outcome);
			let events = self.events.clone();
			let cancel = cancel.clone();
			let no_progress_timeout = self.config.no_progress_timeout();

			tasks.spawn(async move {
				let _permit = match slot.acquire_owned().await {
					Ok(permit) => permit,
					Err(_) => {
						return (
							spec.target_id,
							Err(ReplicatorError::unknown("copy slot closed")),
						)
					}
				};
				let result = run_target_copy(spec.clone(), events, cancel, no_progress_timeout).await;
				(spec.target_id, result)
			});
		}

		let mut results = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(entry) => results.push(entry),
				Err(e) => warn!("Copy task panicked: {e}"),
			}
		}
		results
	}

	async fn dispatch_sequential(
		&self,
		job: &Job,
		outcomes: &[TargetOutcome],
		claimed: &[usize],
		cancel: &watch::Receiver<bool>,
	) -> Vec<(TargetId, Result<CopyOutcome>)> {
		// Priority order comes from the configured destination order
		let mut ordered: Vec<usize> = claimed.to_vec();
		let priorities: HashMap<TargetId, i32> = self
			.config
			.dest_roots
			.iter()
			.map(|d| (TargetId::from(d.id.as_str()), d.priority))
			.collect();
		ordered.sort_by_key(|&idx| {
			priorities
				.get(&outcomes[idx].target_id)
				.copied()
				.unwrap_or(i32::MAX)
		});

		let mut results = Vec::new();
		for idx in ordered {
			let outcome = &outcomes[idx];
			let slot = self.slot_for(&outcome.target_id);
			let spec = TargetCopySpec::from_outcome(job, outcome);
			let _permit = match slot.acquire().await {
				Ok(permit) => permit,
				Err(_) => {
					results.push((
						spec.target_id,
						Err(ReplicatorError::unknown("copy slot closed")),
					));
					continue;
				}
			};
			let result = run_target_copy(
				spec.clone(),
				self.events.clone(),
				cancel.clone(),
				self.config.no_progress_timeout(),
			)
			.await;
			results.push((spec.target_id, result));
		}
		results
	}

	fn slot_for(&self, target_id: &TargetId) -> Arc<Semaphore> {
		self.target_slots
			.get(target_id)
			.cloned()
			.unwrap_or_else(|| Arc::new(Semaphore::new(1)))
	}

	async fn handle_copy_failure(
		&self,
		job: &Job,
		outcome: &mut TargetOutcome,
		error: &ReplicatorError,
	) -> Result<()> {
		let old = outcome.copy_state;
		match self
			.policy
			.should_retry(outcome.attempts, error, OperationKind::Copy)
		{
			RetryDecision::Retry { delay } => {
				outcome.fail(TargetEvent::RetryableFailure, error.to_string())?;
				outcome.next_retry_at =
					Some(chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
				self.metrics.incr(&self.metrics.retries_scheduled);
				warn!(
					job_id = %job.id,
					target = %outcome.target_id,
					attempts = outcome.attempts,
					delay_s = delay.as_secs(),
					"Copy failed, retry scheduled: {error}"
				);
			}
			RetryDecision::Permanent { reason } | RetryDecision::GiveUp { reason } => {
				outcome.fail(TargetEvent::PermanentFailure, reason.clone())?;
				warn!(
					job_id = %job.id,
					target = %outcome.target_id,
					attempts = outcome.attempts,
					"Copy failed permanently: {reason}"
				);
			}
		}
		self.persist_target(outcome, old).await
	}

	/// Compare success hashes against the source hash (or each other)
	fn hash_disagreement(
		&self,
		job: &Job,
		successes: &[(TargetId, CopyOutcome)],
	) -> Option<Vec<TargetId>> {
		if successes.is_empty() {
			return None;
		}
		let reference = job
			.source_hash
			.clone()
			.unwrap_or_else(|| successes[0].1.hash.clone());
		let affected: Vec<TargetId> = successes
			.iter()
			.filter(|(_, outcome)| outcome.hash != reference)
			.map(|(id, _)| id.clone())
			.collect();
		if affected.is_empty() {
			None
		} else {
			Some(affected)
		}
	}

	async fn quarantine_for_disagreement(
		&self,
		job: &mut Job,
		outcomes: &mut [TargetOutcome],
		affected: Vec<TargetId>,
		copied: Vec<TargetId>,
	) -> Result<CopyRunResult> {
		for target_id in &affected {
			if let Some(outcome) = outcomes.iter_mut().find(|o| &o.target_id == target_id) {
				let old = outcome.copy_state;
				outcome.fail(
					TargetEvent::PermanentFailure,
					"replica hash disagrees with sibling copies of the same source",
				)?;
				outcome.integrity_failure = true;
				self.persist_target(outcome, old).await?;
			}
		}

		// Agreeing copies did land; settle them so a later release can
		// pick the job back up
		for outcome in outcomes.iter_mut() {
			if outcome.copy_state == TargetCopyState::Copying && outcome.hash.is_some() {
				let old = outcome.copy_state;
				outcome.apply(TargetEvent::CopyFinished)?;
				self.persist_target(outcome, old).await?;
			}
		}

		let entry = self
			.journal
			.quarantine
			.quarantine_job(
				job,
				"copy streams reported disagreeing hashes for one source",
				affected.clone(),
			)
			.await?;
		self.metrics.incr(&self.metrics.jobs_quarantined);
		self.events.emit(PipelineEvent::JobQuarantined {
			job_id: job.id,
			entry_id: entry.id,
			affected_targets: affected.clone(),
		});

		Ok(CopyRunResult {
			job_state: job.state,
			copied,
			failed: affected,
		})
	}

	/// Persist non-state job mutations (source hash) with conflict retry
	async fn persist_job_fields(&self, job: &mut Job) -> Result<()> {
		const MAX_TRIES: u32 = 5;
		let mut tries = 0;
		loop {
			match self.journal.jobs.update(job).await {
				Ok(()) => return Ok(()),
				Err(ReplicatorError::ConcurrencyConflict { .. }) if tries < MAX_TRIES => {
					tries += 1;
					let hash = job.source_hash.clone();
					*job = self
						.journal
						.jobs
						.find(job.id)
						.await?
						.ok_or_else(|| job_not_found(job.id))?;
					if let Some(hash) = hash {
						job.set_source_hash(hash)?;
					}
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Compute the job-level state from the full outcome set
	///
	/// The job advances to `partial` once no target has copy work left:
	/// every outcome is at least `copied` or permanently failed. Surviving
	/// replicas still get verified even when a sibling is already lost.
	async fn aggregate(&self, job: &mut Job, outcomes: &[TargetOutcome]) -> Result<JobState> {
		let no_copy_work_left = outcomes.iter().all(|o| {
			matches!(
				o.copy_state,
				TargetCopyState::Copied
					| TargetCopyState::Verifying
					| TargetCopyState::Verified
					| TargetCopyState::FailedPermanent
			)
		});
		let any_copied = outcomes.iter().any(|o| {
			matches!(
				o.copy_state,
				TargetCopyState::Copied | TargetCopyState::Verifying | TargetCopyState::Verified
			)
		});
		let all_terminal = outcomes.iter().all(|o| o.copy_state.is_terminal());
		let any_permanent = outcomes
			.iter()
			.any(|o| o.copy_state == TargetCopyState::FailedPermanent);

		if outcomes.is_empty() {
			return Ok(job.state);
		}

		if all_terminal && any_permanent {
			let state = transition_job(
				&self.journal,
				&self.events,
				job,
				JobEvent::TargetsPermanentlyFailed,
			)
			.await?;
			self.metrics.incr(&self.metrics.jobs_failed);
			return Ok(state);
		}

		if job.state == JobState::InProgress && no_copy_work_left && any_copied {
			return transition_job(
				&self.journal,
				&self.events,
				job,
				JobEvent::AllCopiesComplete,
			)
			.await;
		}

		Ok(job.state)
	}

	/// Settle every successful copy of this pass into `copied`
	async fn finish_successes(
		&self,
		outcomes: &mut [TargetOutcome],
		successes: &[(TargetId, CopyOutcome)],
	) -> Result<()> {
		for (target_id, _) in successes {
			let Some(outcome) = outcomes.iter_mut().find(|o| &o.target_id == target_id) else {
				continue;
			};
			let old = outcome.copy_state;
			outcome.apply(TargetEvent::CopyFinished)?;
			self.persist_target(outcome, old).await?;
		}
		Ok(())
	}

	async fn persist_target(&self, outcome: &TargetOutcome, old: TargetCopyState) -> Result<()> {
		self.journal.targets.update(outcome).await?;
		if old != outcome.copy_state {
			self.journal
				.state_log
				.record(StateChange::target(
					outcome.job_id,
					&outcome.target_id,
					old,
					outcome.copy_state,
				))
				.await;
		}
		Ok(())
	}
}

/// Owned inputs for one target copy task
#[derive(Clone)]
struct TargetCopySpec {
	job_id: JobId,
	target_id: TargetId,
	source: PathBuf,
	final_path: PathBuf,
	expected_hash: Option<String>,
	total_bytes: u64,
}

impl TargetCopySpec {
	fn from_outcome(job: &Job, outcome: &TargetOutcome) -> Self {
		Self {
			job_id: job.id,
			target_id: outcome.target_id.clone(),
			source: job.source_path.clone(),
			// The claim loop never dispatches an outcome without a final path
			final_path: outcome.final_path.clone().unwrap_or_default(),
			expected_hash: job.source_hash.clone(),
			total_bytes: job.initial_size,
		}
	}
}

/// Run one copy with progress events (>= 1 s cadence) and a no-progress
/// watchdog that cancels a stalled stream
async fn run_target_copy(
	spec: TargetCopySpec,
	events: EventBus,
	cancel: watch::Receiver<bool>,
	no_progress_timeout: Duration,
) -> Result<CopyOutcome> {
	let bytes_seen = Arc::new(AtomicU64::new(0));
	let done = Arc::new(AtomicBool::new(false));
	let (child_tx, child_rx) = watch::channel(false);

	let monitor = {
		let bytes_seen = bytes_seen.clone();
		let done = done.clone();
		let mut cancel = cancel.clone();
		let events = events.clone();
		let spec = spec.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(1));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			let mut last_bytes = 0u64;
			let mut stalled_for = Duration::ZERO;

			loop {
				tokio::select! {
					_ = interval.tick() => {}
					changed = cancel.changed() => {
						if changed.is_err() || *cancel.borrow() {
							let _ = child_tx.send(true);
							return;
						}
						continue;
					}
				}
				if done.load(Ordering::Acquire) {
					return;
				}

				let bytes = bytes_seen.load(Ordering::Relaxed);
				let rate = bytes.saturating_sub(last_bytes);
				if rate == 0 {
					stalled_for += Duration::from_secs(1);
					if stalled_for >= no_progress_timeout {
						warn!(
							job_id = %spec.job_id,
							target = %spec.target_id,
							"No byte progress for {}s; cancelling copy",
							stalled_for.as_secs()
						);
						let _ = child_tx.send(true);
						return;
					}
				} else {
					stalled_for = Duration::ZERO;
				}

				let remaining = spec.total_bytes.saturating_sub(bytes);
				let eta = if rate > 0 {
					Some(Duration::from_secs(remaining / rate.max(1)))
				} else {
					None
				};
				events.emit(PipelineEvent::CopyProgress {
					job_id: spec.job_id,
					target_id: spec.target_id.clone(),
					bytes,
					total_bytes: spec.total_bytes,
					bytes_per_second: rate,
					eta,
				});
				last_bytes = bytes;
			}
		})
	};

	let progress = {
		let bytes_seen = bytes_seen.clone();
		move |total: u64| bytes_seen.store(total, Ordering::Relaxed)
	};

	let result = copier::copy(
		&spec.source,
		&spec.final_path,
		spec.expected_hash.as_deref(),
		&progress,
		&child_rx,
	)
	.await;

	done.store(true, Ordering::Release);
	monitor.abort();

	// A watchdog-triggered cancellation surfaces as a timeout, which the
	// retry policy treats as transient.
	match result {
		Err(ReplicatorError::Cancelled) if !*cancel.borrow() => Err(ReplicatorError::Timeout(
			format!("copy to {} stalled", spec.final_path.display()),
		)),
		other => other,
	}
}
