//! Pipeline supervisor
//!
//! Owns discovery intake, startup recovery, the retry and verification
//! schedulers, audit-log retention, and the operator-facing actions. All
//! state lives in the journal; the supervisor carries nothing across a
//! restart that recovery cannot rebuild.

use crate::config::ReplicatorConfig;
use crate::domain::{
	Job, JobEvent, JobId, JobState, TargetCopyState, TargetEvent, TargetId, TargetOutcome,
};
use crate::infrastructure::events::EventBus;
use crate::infrastructure::journal::{Journal, StateChange};
use crate::infrastructure::metrics::PipelineMetrics;
use crate::services::watcher::{PathEvent, PathEventKind};
use crate::shared::{ReplicatorError, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::copier;
use super::copy_orchestrator::CopyOrchestrator;
use super::retry::RetryPolicy;
use super::stability::{Stability, StabilityGate};
use super::transition_job;
use super::verify_orchestrator::{PostVerification, VerificationOrchestrator};

/// How often the retry scheduler scans for due targets
const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// How often the retention sweep considers pruning the audit log
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// What recovery found and fixed on startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	pub resubmitted_jobs: usize,
	pub reclassified_copying: usize,
	pub reclassified_verifying: usize,
	pub orphan_temps_removed: u64,
}

/// Drives the whole replication pipeline
pub struct PipelineSupervisor {
	config: Arc<ReplicatorConfig>,
	journal: Arc<Journal>,
	copy: CopyOrchestrator,
	verify: VerificationOrchestrator,
	gate: StabilityGate,
	policy: RetryPolicy,
	events: EventBus,
	metrics: Arc<PipelineMetrics>,
	shutdown: watch::Sender<bool>,
	/// Caps concurrently verifying jobs across the sweep
	verify_slots: Arc<Semaphore>,
	/// Paths currently inside the stability gate, for dedupe
	pending_paths: Mutex<HashSet<PathBuf>>,
	/// Jobs with an orchestration pass in flight; keeps one copy or
	/// verification attempt per `(job, target)` pair at a time
	active_jobs: Mutex<HashSet<JobId>>,
}

impl PipelineSupervisor {
	pub fn new(
		config: Arc<ReplicatorConfig>,
		journal: Arc<Journal>,
		events: EventBus,
		metrics: Arc<PipelineMetrics>,
	) -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			copy: CopyOrchestrator::new(
				journal.clone(),
				config.clone(),
				events.clone(),
				metrics.clone(),
			),
			verify: VerificationOrchestrator::new(
				journal.clone(),
				config.clone(),
				events.clone(),
				metrics.clone(),
			),
			gate: StabilityGate::from_config(&config.stability),
			policy: RetryPolicy::new(config.retry.clone()),
			verify_slots: Arc::new(Semaphore::new(
				config.verification.max_concurrent_verifications,
			)),
			pending_paths: Mutex::new(HashSet::new()),
			active_jobs: Mutex::new(HashSet::new()),
			config,
			journal,
			events,
			metrics,
			shutdown,
		}
	}

	/// Observe the cooperative shutdown signal
	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	/// Request a clean shutdown: in-flight work cancels cooperatively
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);
	}

	/// Startup recovery, a pure function of the journal
	///
	/// Removes orphaned temp files, reclassifies work that was interrupted
	/// mid-flight, and reports what remains to resubmit. In-memory state
	/// from the previous process plays no part.
	pub async fn recover(&self) -> Result<RecoveryReport> {
		let mut report = RecoveryReport::default();

		for dest in &self.config.dest_roots {
			match copier::remove_orphan_temps(&dest.path).await {
				Ok(removed) => report.orphan_temps_removed += removed,
				Err(e) => warn!(dest = %dest.path.display(), "Orphan temp sweep failed: {e}"),
			}
		}

		let jobs = self.journal.jobs.find_non_terminal().await?;
		for job in &jobs {
			let outcomes = self.journal.targets.find_for_job(job.id).await?;
			for mut outcome in outcomes {
				match outcome.copy_state {
					TargetCopyState::Copying => {
						if let Some(temp) = outcome.temp_path.clone() {
							let _ = tokio::fs::remove_file(&temp).await;
						}
						self.reclassify(&mut outcome, TargetEvent::CopyInterrupted)
							.await?;
						report.reclassified_copying += 1;
					}
					TargetCopyState::Verifying => {
						self.reclassify(&mut outcome, TargetEvent::VerifyInterrupted)
							.await?;
						report.reclassified_verifying += 1;
					}
					_ => {}
				}
			}
			self.metrics.job_started();
		}
		report.resubmitted_jobs = jobs.len();

		info!(
			jobs = report.resubmitted_jobs,
			copying = report.reclassified_copying,
			verifying = report.reclassified_verifying,
			temps = report.orphan_temps_removed,
			"Recovery complete"
		);
		Ok(report)
	}

	async fn reclassify(&self, outcome: &mut TargetOutcome, event: TargetEvent) -> Result<()> {
		let old = outcome.copy_state;
		outcome.apply(event)?;
		outcome.temp_path = None;
		self.journal.targets.update(outcome).await?;
		self.journal
			.state_log
			.record(
				StateChange::target(outcome.job_id, &outcome.target_id, old, outcome.copy_state)
					.with_context(serde_json::json!({ "recovery": true })),
			)
			.await;
		Ok(())
	}

	/// Main loop: recover, resubmit, then react to discovery events and
	/// scheduler ticks until shutdown
	pub async fn run(self: Arc<Self>, mut discovery: mpsc::Receiver<PathEvent>) -> Result<()> {
		self.recover().await?;

		let mut tasks: JoinSet<()> = JoinSet::new();

		// Route journaled work back into the orchestrators by state
		for job in self.journal.jobs.find_non_terminal().await? {
			let this = self.clone();
			tasks.spawn(async move { this.resubmit(job).await });
		}

		let mut shutdown = self.shutdown.subscribe();
		let mut retry_tick = tokio::time::interval(RETRY_SCAN_INTERVAL);
		let mut verify_tick = tokio::time::interval(self.config.verification.scheduler_interval());
		let mut retention_tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
		retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		verify_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		retention_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		info!("Pipeline supervisor running");

		loop {
			tokio::select! {
				event = discovery.recv() => {
					match event {
						Some(event) => {
							if let Some(path) = self.accept_event(event) {
								let this = self.clone();
								tasks.spawn(async move { this.handle_discovery(path).await });
							}
						}
						None => {
							info!("Discovery channel closed; shutting down");
							self.shutdown();
						}
					}
				}
				_ = retry_tick.tick() => {
					let this = self.clone();
					tasks.spawn(async move {
						if let Err(e) = this.process_due_retries().await {
							warn!("Retry scan failed: {e}");
						}
					});
				}
				_ = verify_tick.tick() => {
					let this = self.clone();
					tasks.spawn(async move { this.verification_sweep().await });
				}
				_ = retention_tick.tick() => {
					let this = self.clone();
					tasks.spawn(async move { this.retention_sweep().await });
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}

			// Reap finished tasks without blocking the loop
			while let Some(result) = tasks.try_join_next() {
				if let Err(e) = result {
					warn!("Pipeline task panicked: {e}");
				}
			}
		}

		info!("Draining in-flight work before exit");
		while let Some(result) = tasks.join_next().await {
			if let Err(e) = result {
				warn!("Pipeline task panicked during drain: {e}");
			}
		}
		info!("Pipeline supervisor stopped");
		Ok(())
	}

	/// Filter raw watcher events down to paths worth gating
	fn accept_event(&self, event: PathEvent) -> Option<PathBuf> {
		match event.kind {
			PathEventKind::Created | PathEventKind::Modified => Some(event.path),
			PathEventKind::Removed => None,
		}
	}

	/// Gate a newly seen path and, once stable, create and drive its job
	async fn handle_discovery(&self, path: PathBuf) {
		{
			let mut pending = self.pending_paths.lock().await;
			if !pending.insert(path.clone()) {
				return;
			}
		}

		let result = self.discover_and_drive(&path).await;

		self.pending_paths.lock().await.remove(&path);

		if let Err(e) = result {
			warn!(path = %path.display(), "Discovery failed: {e}");
		}
	}

	async fn discover_and_drive(&self, path: &PathBuf) -> Result<()> {
		if self
			.journal
			.jobs
			.find_active_by_source_path(path)
			.await?
			.is_some()
		{
			debug!(path = %path.display(), "Path already owned by an active job");
			return Ok(());
		}

		let cancel = self.shutdown.subscribe();
		let size = match self.gate.wait_for_stability(path, &cancel).await? {
			Stability::Stable { size } => size,
			Stability::Unstable { reason } => {
				debug!(path = %path.display(), "File did not settle: {reason}");
				return Ok(());
			}
		};

		let mut job = Job::discovered(path.clone(), size, self.config.target_ids());
		self.journal.jobs.insert(&job).await?;
		self.journal
			.state_log
			.record(StateChange {
				job_id: job.id,
				entity_type: crate::infrastructure::journal::EntityType::Job,
				entity_id: None,
				old_state: None,
				new_state: job.state.to_string(),
				context: Some(serde_json::json!({ "initial_size": size })),
			})
			.await;
		self.metrics.incr(&self.metrics.jobs_discovered);
		self.metrics.job_started();
		info!(job_id = %job.id, path = %path.display(), size, "Job created");

		transition_job(&self.journal, &self.events, &mut job, JobEvent::Enqueued).await?;
		self.drive_copy(job.id).await;
		Ok(())
	}

	/// Route a recovered job into the right orchestrator for its state
	async fn resubmit(&self, mut job: Job) {
		let result: Result<()> = async {
			match job.state {
				JobState::Discovered => {
					transition_job(&self.journal, &self.events, &mut job, JobEvent::Enqueued)
						.await?;
					self.drive_copy(job.id).await;
				}
				JobState::Queued | JobState::InProgress => self.drive_copy(job.id).await,
				JobState::Partial => self.drive_verify(job.id).await,
				// Terminal states stay where they are
				JobState::Verified | JobState::Failed | JobState::Quarantined => {
					self.metrics.job_finished();
				}
			}
			Ok(())
		}
		.await;

		if let Err(e) = result {
			warn!(job_id = %job.id, "Resubmission failed: {e}");
		}
	}

	/// Claim a job for one orchestration pass; false when one is active
	async fn begin_pass(&self, job_id: JobId) -> bool {
		self.active_jobs.lock().await.insert(job_id)
	}

	async fn end_pass(&self, job_id: JobId) {
		self.active_jobs.lock().await.remove(&job_id);
	}

	/// One copy pass; follow a fresh `partial` straight into verification
	async fn drive_copy(&self, job_id: JobId) {
		if !self.begin_pass(job_id).await {
			return;
		}
		let cancel = self.shutdown.subscribe();
		match self.copy.process(job_id, &cancel).await {
			Ok(result) => match result.job_state {
				JobState::Partial => self.verify_pass(job_id).await,
				JobState::Failed | JobState::Quarantined => self.metrics.job_finished(),
				_ => {}
			},
			Err(e) => warn!(job_id = %job_id, "Copy pass failed: {e}"),
		}
		self.end_pass(job_id).await;
	}

	async fn drive_verify(&self, job_id: JobId) {
		if !self.begin_pass(job_id).await {
			return;
		}
		self.verify_pass(job_id).await;
		self.end_pass(job_id).await;
	}

	async fn verify_pass(&self, job_id: JobId) {
		let cancel = self.shutdown.subscribe();
		match self.verify.verify(job_id, &cancel).await {
			Ok(PostVerification::AllVerified) => self.finalize_verified(job_id).await,
			Ok(PostVerification::Failed) | Ok(PostVerification::Quarantined { .. }) => {
				self.metrics.job_finished();
			}
			Ok(PostVerification::StillPartial) => {}
			Err(e) => warn!(job_id = %job_id, "Verification pass failed: {e}"),
		}
	}

	/// Delete the source of a verified job; failure never unverifies it
	async fn finalize_verified(&self, job_id: JobId) {
		self.metrics.job_finished();

		if self.config.debug.keep_source {
			return;
		}
		let job = match self.journal.jobs.find(job_id).await {
			Ok(Some(job)) => job,
			Ok(None) => return,
			Err(e) => {
				warn!(job_id = %job_id, "Could not load job for source cleanup: {e}");
				return;
			}
		};
		match tokio::fs::remove_file(&job.source_path).await {
			Ok(()) => info!(job_id = %job_id, path = %job.source_path.display(), "Source file removed"),
			Err(e) => warn!(
				job_id = %job_id,
				path = %job.source_path.display(),
				"Could not remove verified source (job stays verified): {e}"
			),
		}
	}

	/// Hand due retryable failures back to the copy orchestrator
	async fn process_due_retries(&self) -> Result<()> {
		let due = self.journal.targets.find_due_retries(chrono::Utc::now()).await?;
		if due.is_empty() {
			return Ok(());
		}

		let mut jobs_to_drive: Vec<JobId> = Vec::new();
		for mut outcome in due {
			let old = outcome.copy_state;
			if outcome.attempts >= self.policy.max_attempts() {
				// Attempt budget exhausted: the target fails for good
				outcome.fail(
					TargetEvent::PermanentFailure,
					format!("retry budget exhausted after {} attempts", outcome.attempts),
				)?;
				outcome.next_retry_at = None;
				self.journal.targets.update(&outcome).await?;
				self.journal
					.state_log
					.record(StateChange::target(
						outcome.job_id,
						&outcome.target_id,
						old,
						outcome.copy_state,
					))
					.await;
				self.settle_if_exhausted(outcome.job_id).await?;
				continue;
			}

			outcome.apply(TargetEvent::RetryScheduled)?;
			outcome.next_retry_at = None;
			self.journal.targets.update(&outcome).await?;
			self.journal
				.state_log
				.record(StateChange::target(
					outcome.job_id,
					&outcome.target_id,
					old,
					outcome.copy_state,
				))
				.await;
			if !jobs_to_drive.contains(&outcome.job_id) {
				jobs_to_drive.push(outcome.job_id);
			}
		}

		for job_id in jobs_to_drive {
			self.drive_copy(job_id).await;
		}

		// Self-heal: a pass that was skipped or lost still leaves pending
		// targets behind; pick those jobs back up here
		for state in [JobState::Queued, JobState::InProgress] {
			for job in self.journal.jobs.find_by_state(state).await? {
				let outcomes = self.journal.targets.find_for_job(job.id).await?;
				let has_pending = outcomes
					.iter()
					.any(|o| o.copy_state == TargetCopyState::Pending);
				if has_pending || outcomes.is_empty() {
					self.drive_copy(job.id).await;
				}
			}
		}
		Ok(())
	}

	/// Fail the job once no required target can make further progress
	async fn settle_if_exhausted(&self, job_id: JobId) -> Result<()> {
		let Some(mut job) = self.journal.jobs.find(job_id).await? else {
			return Ok(());
		};
		if job.is_terminal() {
			return Ok(());
		}
		let outcomes = self.journal.targets.find_for_job(job_id).await?;
		let all_terminal = !outcomes.is_empty() && outcomes.iter().all(|o| o.copy_state.is_terminal());
		let any_permanent = outcomes
			.iter()
			.any(|o| o.copy_state == TargetCopyState::FailedPermanent);
		if all_terminal && any_permanent {
			transition_job(
				&self.journal,
				&self.events,
				&mut job,
				JobEvent::TargetsPermanentlyFailed,
			)
			.await?;
			self.metrics.incr(&self.metrics.jobs_failed);
			self.metrics.job_finished();
		}
		Ok(())
	}

	/// Schedule verifications for `partial` jobs with copied targets
	async fn verification_sweep(self: Arc<Self>) {
		let jobs = match self.journal.jobs.find_by_state(JobState::Partial).await {
			Ok(jobs) => jobs,
			Err(e) => {
				warn!("Verification sweep query failed: {e}");
				return;
			}
		};

		let mut sweeps = JoinSet::new();
		for job in jobs {
			let outcomes = match self.journal.targets.find_for_job(job.id).await {
				Ok(outcomes) => outcomes,
				Err(e) => {
					warn!(job_id = %job.id, "Could not load outcomes: {e}");
					continue;
				}
			};
			if !outcomes
				.iter()
				.any(|o| o.copy_state == TargetCopyState::Copied)
			{
				continue;
			}

			let this = self.clone();
			let slots = self.verify_slots.clone();
			sweeps.spawn(async move {
				let Ok(_permit) = slots.acquire_owned().await else {
					return;
				};
				this.drive_verify(job.id).await;
			});
		}

		while let Some(result) = sweeps.join_next().await {
			if let Err(e) = result {
				warn!("Verification sweep task panicked: {e}");
			}
		}
	}

	/// Prune audit-log rows past the retention window, when enabled
	async fn retention_sweep(&self) {
		let retention = &self.config.state_change_log;
		if !retention.enabled || !retention.auto_cleanup {
			return;
		}
		let cutoff = chrono::Utc::now() - chrono::Duration::days(retention.retention_days as i64);
		match self.journal.state_log.prune_older_than(cutoff).await {
			Ok(0) => {}
			Ok(removed) => info!(removed, "Pruned state change log"),
			Err(e) => warn!("State change log retention sweep failed: {e}"),
		}
	}

	// --- Operator actions (AdminAPI consumers call these; they flow
	// --- through the same transition methods as the pipeline)

	/// Manual retry of a permanently failed target with a fresh budget
	pub async fn retry_target(&self, job_id: JobId, target_id: &TargetId) -> Result<()> {
		let mut job = self
			.journal
			.jobs
			.find(job_id)
			.await?
			.ok_or_else(|| ReplicatorError::NotFound(format!("job {job_id}")))?;
		match job.state {
			JobState::Quarantined => {
				return Err(ReplicatorError::config(
					"job is quarantined; release the quarantine entry instead",
				));
			}
			JobState::Verified => {
				return Err(ReplicatorError::config("job is already verified"));
			}
			_ => {}
		}

		let mut outcome = self
			.journal
			.targets
			.find(job_id, target_id)
			.await?
			.ok_or_else(|| {
				ReplicatorError::NotFound(format!("target {target_id} of job {job_id}"))
			})?;

		let old = outcome.copy_state;
		outcome.apply(TargetEvent::OperatorRetry)?;
		outcome.attempts = 0;
		outcome.last_error = None;
		outcome.integrity_failure = false;
		outcome.next_retry_at = None;
		self.journal.targets.update(&outcome).await?;
		self.journal
			.state_log
			.record(
				StateChange::target(job_id, target_id, old, outcome.copy_state)
					.with_context(serde_json::json!({ "operator": true })),
			)
			.await;

		if job.state == JobState::Failed {
			transition_job(&self.journal, &self.events, &mut job, JobEvent::OperatorRequeued)
				.await?;
			self.metrics.job_started();
		}

		self.drive_copy(job_id).await;
		Ok(())
	}

	/// Release a quarantine entry; the job re-enters the pipeline
	pub async fn release_quarantine(
		&self,
		entry_id: i32,
		by: &str,
		reason: &str,
	) -> Result<Job> {
		let (_entry, job) = self.journal.quarantine.release(entry_id, by, reason).await?;
		self.metrics.job_started();
		self.drive_copy(job.id).await;
		self.journal
			.jobs
			.find(job.id)
			.await?
			.ok_or_else(|| ReplicatorError::NotFound(format!("job {}", job.id)))
	}

	/// Purge a quarantine entry; the job is failed for good
	pub async fn purge_quarantine(&self, entry_id: i32, by: &str, reason: &str) -> Result<()> {
		self.journal.quarantine.purge(entry_id, by, reason).await?;
		Ok(())
	}
}
