//! Verification orchestrator
//!
//! Re-hashes each copied replica and compares it with the recorded source
//! hash. Hash mismatch is zero-tolerance: the target fails permanently, the
//! corrupted replica is archived for review, and the job lands in
//! quarantine. I/O trouble during verification is retryable.

use crate::config::ReplicatorConfig;
use crate::domain::{
	Job, JobEvent, JobId, JobState, TargetCopyState, TargetEvent, TargetId, TargetOutcome,
};
use crate::infrastructure::events::{EventBus, PipelineEvent};
use crate::infrastructure::journal::{job_not_found, Journal, StateChange};
use crate::infrastructure::metrics::PipelineMetrics;
use crate::shared::{ReplicatorError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::hasher;
use super::retry::{OperationKind, RetryPolicy};
use super::transition_job;

/// Job-level result of one verification pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostVerification {
	/// Every target verified; the job is terminal-good
	AllVerified,
	/// Some targets still need copying or re-verification
	StillPartial,
	/// Integrity failure; the job is quarantined
	Quarantined { entry_id: i32 },
	/// No target can make further progress
	Failed,
}

enum TargetVerdict {
	Match { duration: Duration },
	Mismatch { actual: String },
	IoError(ReplicatorError),
}

/// Verifies copied replicas for jobs in `partial`
pub struct VerificationOrchestrator {
	journal: Arc<Journal>,
	config: Arc<ReplicatorConfig>,
	policy: RetryPolicy,
	events: EventBus,
	metrics: Arc<PipelineMetrics>,
}

impl VerificationOrchestrator {
	pub fn new(
		journal: Arc<Journal>,
		config: Arc<ReplicatorConfig>,
		events: EventBus,
		metrics: Arc<PipelineMetrics>,
	) -> Self {
		Self {
			policy: RetryPolicy::new(config.retry.clone()),
			journal,
			config,
			events,
			metrics,
		}
	}

	/// Verify every `copied` target of one job
	pub async fn verify(
		&self,
		job_id: JobId,
		cancel: &watch::Receiver<bool>,
	) -> Result<PostVerification> {
		let mut job = self
			.journal
			.jobs
			.find(job_id)
			.await?
			.ok_or_else(|| job_not_found(job_id))?;

		if job.state != JobState::Partial {
			return Err(ReplicatorError::InvalidTransition(
				crate::domain::InvalidTransition::new("job", job.state, "verification pass"),
			));
		}
		let source_hash = job.source_hash.clone().ok_or_else(|| {
			ReplicatorError::IntegrityViolation(format!(
				"job {job_id} reached partial without a source hash"
			))
		})?;

		let mut outcomes = self.journal.targets.find_for_job(job_id).await?;

		// Claim and persist `verifying` before any hashing so the transient
		// state is observable through the journal
		let mut claimed: Vec<usize> = Vec::new();
		for (idx, outcome) in outcomes.iter_mut().enumerate() {
			if outcome.copy_state != TargetCopyState::Copied {
				continue;
			}
			let old = outcome.copy_state;
			outcome.apply(TargetEvent::VerifyStarted)?;
			self.persist_target(outcome, old, None).await?;
			claimed.push(idx);
		}

		if !claimed.is_empty() {
			let verdicts = self.hash_targets(&outcomes, &claimed, &source_hash, cancel).await;
			self.apply_verdicts(&job, &mut outcomes, verdicts, &source_hash)
				.await?;
		}

		self.aggregate(&mut job, &outcomes).await
	}

	/// Re-hash claimed targets with fan-out capped at `min(n, cores)`
	async fn hash_targets(
		&self,
		outcomes: &[TargetOutcome],
		claimed: &[usize],
		source_hash: &str,
		cancel: &watch::Receiver<bool>,
	) -> Vec<(TargetId, TargetVerdict)> {
		let cores = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1);
		let fan_out = claimed.len().min(cores).max(1);
		let slots = Arc::new(Semaphore::new(fan_out));

		let mut tasks = JoinSet::new();
		for &idx in claimed {
			let outcome = &outcomes[idx];
			let target_id = outcome.target_id.clone();
			let final_path = outcome.final_path.clone();
			let expected = source_hash.to_string();
			let slots = slots.clone();
			let cancel = cancel.clone();

			tasks.spawn(async move {
				let _permit = match slots.acquire_owned().await {
					Ok(permit) => permit,
					Err(_) => {
						return (
							target_id,
							TargetVerdict::IoError(ReplicatorError::unknown(
								"verification slot closed",
							)),
						)
					}
				};
				if *cancel.borrow() {
					return (target_id, TargetVerdict::IoError(ReplicatorError::Cancelled));
				}
				let verdict = verify_replica(final_path.as_deref(), &expected).await;
				(target_id, verdict)
			});
		}

		let mut verdicts = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(entry) => verdicts.push(entry),
				Err(e) => warn!("Verification task panicked: {e}"),
			}
		}
		verdicts
	}

	async fn apply_verdicts(
		&self,
		job: &Job,
		outcomes: &mut [TargetOutcome],
		verdicts: Vec<(TargetId, TargetVerdict)>,
		source_hash: &str,
	) -> Result<()> {
		for (target_id, verdict) in verdicts {
			let Some(outcome) = outcomes.iter_mut().find(|o| o.target_id == target_id) else {
				warn!(job_id = %job.id, target = %target_id, "Verdict for unknown target");
				continue;
			};
			let old = outcome.copy_state;

			match verdict {
				TargetVerdict::Match { duration } => {
					outcome.apply(TargetEvent::VerifySucceeded)?;
					outcome.last_error = None;
					self.persist_target(
						outcome,
						old,
						Some(serde_json::json!({ "verify_duration_ms": duration.as_millis() as u64 })),
					)
					.await?;
					self.metrics.incr(&self.metrics.verifications_succeeded);
					self.events.emit(PipelineEvent::TargetVerified {
						job_id: job.id,
						target_id,
						duration,
					});
				}
				TargetVerdict::Mismatch { actual } => {
					let error = ReplicatorError::HashMismatch {
						expected: source_hash.to_string(),
						actual,
					};
					outcome.fail(TargetEvent::PermanentFailure, error.to_string())?;
					outcome.integrity_failure = true;
					self.persist_target(outcome, old, None).await?;
					self.metrics.incr(&self.metrics.verifications_failed);
					self.archive_corrupted_replica(job, outcome).await;
				}
				TargetVerdict::IoError(ReplicatorError::Cancelled) => {
					// Leave the persisted `verifying` in place; recovery
					// reclassifies it to `copied` on the next startup
				}
				TargetVerdict::IoError(e) => {
					self.metrics.incr(&self.metrics.verifications_failed);
					let decision =
						self.policy
							.should_retry(outcome.attempts.max(1), &e, OperationKind::Verify);
					match decision {
						super::retry::RetryDecision::Retry { delay } => {
							outcome.fail(
								TargetEvent::RetryableFailure,
								format!("verification I/O: {e}"),
							)?;
							outcome.next_retry_at = Some(
								chrono::Utc::now()
									+ chrono::Duration::from_std(delay).unwrap_or_default(),
							);
							self.metrics.incr(&self.metrics.retries_scheduled);
						}
						super::retry::RetryDecision::Permanent { reason }
						| super::retry::RetryDecision::GiveUp { reason } => {
							outcome.fail(TargetEvent::PermanentFailure, reason)?;
						}
					}
					self.persist_target(outcome, old, None).await?;
				}
			}
		}
		Ok(())
	}

	/// Compute the post-verification job state from the full outcome set
	async fn aggregate(&self, job: &mut Job, outcomes: &[TargetOutcome]) -> Result<PostVerification> {
		let mismatched: Vec<TargetId> = outcomes
			.iter()
			.filter(|o| o.copy_state == TargetCopyState::FailedPermanent && o.integrity_failure)
			.map(|o| o.target_id.clone())
			.collect();

		if !mismatched.is_empty() {
			let reason = outcomes
				.iter()
				.find(|o| mismatched.contains(&o.target_id))
				.and_then(|o| o.last_error.clone())
				.unwrap_or_else(|| "replica hash mismatch".to_string());
			let entry = self
				.journal
				.quarantine
				.quarantine_job(job, reason, mismatched.clone())
				.await?;
			self.metrics.incr(&self.metrics.jobs_quarantined);
			self.events.emit(PipelineEvent::JobQuarantined {
				job_id: job.id,
				entry_id: entry.id,
				affected_targets: mismatched,
			});
			return Ok(PostVerification::Quarantined { entry_id: entry.id });
		}

		let all_verified = !outcomes.is_empty()
			&& outcomes
				.iter()
				.all(|o| o.copy_state == TargetCopyState::Verified);
		if all_verified {
			transition_job(&self.journal, &self.events, job, JobEvent::AllTargetsVerified).await?;
			self.metrics.incr(&self.metrics.jobs_verified);
			info!(job_id = %job.id, "All replicas verified");
			return Ok(PostVerification::AllVerified);
		}

		let all_terminal = outcomes.iter().all(|o| o.copy_state.is_terminal());
		let any_permanent = outcomes
			.iter()
			.any(|o| o.copy_state == TargetCopyState::FailedPermanent);
		if all_terminal && any_permanent {
			transition_job(
				&self.journal,
				&self.events,
				job,
				JobEvent::TargetsPermanentlyFailed,
			)
			.await?;
			self.metrics.incr(&self.metrics.jobs_failed);
			return Ok(PostVerification::Failed);
		}

		Ok(PostVerification::StillPartial)
	}

	/// Move a corrupted replica into the quarantine directory, best effort
	async fn archive_corrupted_replica(&self, job: &Job, outcome: &TargetOutcome) {
		let Some(final_path) = outcome.final_path.as_deref() else {
			return;
		};
		let archived = self.archive_path(job, outcome, final_path);
		match tokio::fs::rename(final_path, &archived).await {
			Ok(()) => warn!(
				job_id = %job.id,
				target = %outcome.target_id,
				archived = %archived.display(),
				"Corrupted replica archived"
			),
			Err(e) => warn!(
				job_id = %job.id,
				target = %outcome.target_id,
				"Could not archive corrupted replica: {e}"
			),
		}
	}

	fn archive_path(&self, job: &Job, outcome: &TargetOutcome, final_path: &Path) -> PathBuf {
		let file_name = final_path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "replica".to_string());
		self.config
			.quarantine_dir
			.join(format!("{}-{}-{}", job.id, outcome.target_id, file_name))
	}

	async fn persist_target(
		&self,
		outcome: &TargetOutcome,
		old: TargetCopyState,
		context: Option<serde_json::Value>,
	) -> Result<()> {
		self.journal.targets.update(outcome).await?;
		if old != outcome.copy_state {
			let mut change = StateChange::target(
				outcome.job_id,
				&outcome.target_id,
				old,
				outcome.copy_state,
			);
			if let Some(context) = context {
				change = change.with_context(context);
			}
			self.journal.state_log.record(change).await;
		}
		Ok(())
	}
}

/// Hash one replica and compare against the expected source hash
async fn verify_replica(final_path: Option<&Path>, expected: &str) -> TargetVerdict {
	let Some(final_path) = final_path else {
		return TargetVerdict::IoError(ReplicatorError::unknown(
			"target outcome has no final path",
		));
	};
	let started = Instant::now();
	match hasher::hash_file(final_path).await {
		Ok(actual) if actual == expected => TargetVerdict::Match {
			duration: started.elapsed(),
		},
		Ok(actual) => TargetVerdict::Mismatch { actual },
		Err(e) => TargetVerdict::IoError(e),
	}
}
