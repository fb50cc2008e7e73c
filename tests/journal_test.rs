//! Integration tests for the journal: repositories, optimistic
//! concurrency, audit log, quarantine store

use chrono::Utc;
use forker_core::domain::{
	Job, JobEvent, JobState, QuarantineStatus, TargetCopyState, TargetEvent, TargetId,
	TargetOutcome,
};
use forker_core::infrastructure::journal::{Journal, QuarantineFilter, StateChange};
use forker_core::shared::ReplicatorError;
use pretty_assertions::assert_eq;
use std::path::PathBuf;

fn sample_job() -> Job {
	Job::discovered(
		PathBuf::from("/data/input/scan-001.svs"),
		4096,
		vec![TargetId::from("clinical"), TargetId::from("research")],
	)
}

async fn journal() -> Journal {
	Journal::open_in_memory().await.unwrap()
}

#[tokio::test]
async fn migrations_record_the_schema_version() {
	let journal = journal().await;
	let version = journal.database().schema_version().await.unwrap();
	assert_eq!(version, 2);
}

#[tokio::test]
async fn job_round_trips_through_the_journal() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	let loaded = journal.jobs.find(job.id).await.unwrap().unwrap();
	assert_eq!(loaded.id, job.id);
	assert_eq!(loaded.source_path, job.source_path);
	assert_eq!(loaded.initial_size, 4096);
	assert_eq!(loaded.state, JobState::Discovered);
	assert_eq!(loaded.required_targets, job.required_targets);
	assert_eq!(loaded.version_token, 1);
	assert_eq!(loaded.source_hash, None);
}

#[tokio::test]
async fn update_bumps_the_version_token() {
	let journal = journal().await;
	let mut job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	job.apply(JobEvent::Enqueued).unwrap();
	journal.jobs.update(&mut job).await.unwrap();
	assert_eq!(job.version_token, 2);

	let loaded = journal.jobs.find(job.id).await.unwrap().unwrap();
	assert_eq!(loaded.state, JobState::Queued);
	assert_eq!(loaded.version_token, 2);
}

#[tokio::test]
async fn concurrent_writers_with_the_same_token_conflict() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	// Two in-memory copies read at the same version
	let mut first = journal.jobs.find(job.id).await.unwrap().unwrap();
	let mut second = journal.jobs.find(job.id).await.unwrap().unwrap();

	first.apply(JobEvent::Enqueued).unwrap();
	journal.jobs.update(&mut first).await.unwrap();

	second.apply(JobEvent::Enqueued).unwrap();
	let conflict = journal.jobs.update(&mut second).await;
	assert!(matches!(
		conflict,
		Err(ReplicatorError::ConcurrencyConflict { .. })
	));

	// The loser keeps its stale token so the caller can re-read
	assert_eq!(second.version_token, 1);
}

#[tokio::test]
async fn non_terminal_queries_exclude_finished_jobs() {
	let journal = journal().await;

	let mut verified = sample_job();
	verified.source_path = PathBuf::from("/data/input/done.svs");
	verified.state = JobState::Verified;
	journal.jobs.insert(&verified).await.unwrap();

	let active = sample_job();
	journal.jobs.insert(&active).await.unwrap();

	let non_terminal = journal.jobs.find_non_terminal().await.unwrap();
	assert_eq!(non_terminal.len(), 1);
	assert_eq!(non_terminal[0].id, active.id);

	let by_path = journal
		.jobs
		.find_active_by_source_path(&PathBuf::from("/data/input/done.svs"))
		.await
		.unwrap();
	assert!(by_path.is_none());
}

#[tokio::test]
async fn target_outcomes_round_trip_and_filter_by_due_time() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	let mut due = TargetOutcome::pending(
		job.id,
		TargetId::from("clinical"),
		PathBuf::from("/mnt/clinical/scan-001.svs"),
	);
	due.apply(TargetEvent::CopyStarted).unwrap();
	due.fail(TargetEvent::RetryableFailure, "disk hiccup").unwrap();
	due.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(5));
	journal.targets.insert(&due).await.unwrap();

	let mut not_due = TargetOutcome::pending(
		job.id,
		TargetId::from("research"),
		PathBuf::from("/mnt/research/scan-001.svs"),
	);
	not_due.apply(TargetEvent::CopyStarted).unwrap();
	not_due
		.fail(TargetEvent::RetryableFailure, "disk hiccup")
		.unwrap();
	not_due.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(10));
	journal.targets.insert(&not_due).await.unwrap();

	let ready = journal.targets.find_due_retries(Utc::now()).await.unwrap();
	assert_eq!(ready.len(), 1);
	assert_eq!(ready[0].target_id, TargetId::from("clinical"));
	assert_eq!(ready[0].last_error.as_deref(), Some("disk hiccup"));
}

#[tokio::test]
async fn deleting_a_job_cascades_to_its_outcomes() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();
	let outcome = TargetOutcome::pending(
		job.id,
		TargetId::from("clinical"),
		PathBuf::from("/mnt/clinical/scan-001.svs"),
	);
	journal.targets.insert(&outcome).await.unwrap();

	journal.jobs.delete(job.id).await.unwrap();

	let orphans = journal.targets.find_for_job(job.id).await.unwrap();
	assert!(orphans.is_empty());
}

#[tokio::test]
async fn state_log_derives_per_entity_durations() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	journal
		.state_log
		.append(StateChange::job(job.id, "discovered", "queued"))
		.await
		.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(20)).await;
	journal
		.state_log
		.append(StateChange::job(job.id, "queued", "in_progress"))
		.await
		.unwrap();

	let history = journal.state_log.history(job.id).await.unwrap();
	assert_eq!(history.len(), 2);
	assert_eq!(history[0].duration_ms_since_prev, None);
	assert!(history[1].duration_ms_since_prev.unwrap() >= 10);
	assert_eq!(history[1].old_state.as_deref(), Some("queued"));
	assert_eq!(history[1].new_state, "in_progress");
}

#[tokio::test]
async fn state_log_durations_are_tracked_per_entity() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	journal
		.state_log
		.append(StateChange::target(job.id, "clinical", "pending", "copying"))
		.await
		.unwrap();
	journal
		.state_log
		.append(StateChange::target(job.id, "research", "pending", "copying"))
		.await
		.unwrap();

	let history = journal.state_log.history(job.id).await.unwrap();
	// Different targets never chain into each other's durations
	assert_eq!(history[0].duration_ms_since_prev, None);
	assert_eq!(history[1].duration_ms_since_prev, None);
}

#[tokio::test]
async fn retention_prunes_only_old_rows() {
	let journal = journal().await;
	let job = sample_job();
	journal.jobs.insert(&job).await.unwrap();

	journal
		.state_log
		.append(StateChange::job(job.id, "discovered", "queued"))
		.await
		.unwrap();

	let removed = journal
		.state_log
		.prune_older_than(Utc::now() - chrono::Duration::days(30))
		.await
		.unwrap();
	assert_eq!(removed, 0);

	let removed = journal
		.state_log
		.prune_older_than(Utc::now() + chrono::Duration::seconds(5))
		.await
		.unwrap();
	assert_eq!(removed, 1);
}

#[tokio::test]
async fn quarantine_is_transactional_with_the_job_transition() {
	let journal = journal().await;
	let mut job = sample_job();
	job.state = JobState::Partial;
	job.source_hash = Some("ab".repeat(32));
	journal.jobs.insert(&job).await.unwrap();

	let entry = journal
		.quarantine
		.quarantine_job(&mut job, "replica mismatch", vec![TargetId::from("clinical")])
		.await
		.unwrap();

	assert_eq!(job.state, JobState::Quarantined);
	assert_eq!(job.version_token, 2);
	assert_eq!(entry.status, QuarantineStatus::Active);
	assert_eq!(entry.affected_targets, vec![TargetId::from("clinical")]);
	assert_eq!(entry.expected_hash.as_deref(), Some("ab".repeat(32).as_str()));

	let stored = journal.jobs.find(job.id).await.unwrap().unwrap();
	assert_eq!(stored.state, JobState::Quarantined);
}

#[tokio::test]
async fn release_requeues_the_job_and_resets_affected_targets() {
	let journal = journal().await;
	let mut job = sample_job();
	job.state = JobState::Partial;
	job.source_hash = Some("ab".repeat(32));
	journal.jobs.insert(&job).await.unwrap();

	let mut bad = TargetOutcome::pending(
		job.id,
		TargetId::from("clinical"),
		PathBuf::from("/mnt/clinical/scan-001.svs"),
	);
	bad.copy_state = TargetCopyState::FailedPermanent;
	bad.attempts = 3;
	bad.last_error = Some("hash mismatch: expected aa, got bb".into());
	bad.integrity_failure = true;
	journal.targets.insert(&bad).await.unwrap();

	let mut good = TargetOutcome::pending(
		job.id,
		TargetId::from("research"),
		PathBuf::from("/mnt/research/scan-001.svs"),
	);
	good.copy_state = TargetCopyState::Verified;
	good.hash = job.source_hash.clone();
	journal.targets.insert(&good).await.unwrap();

	let entry = journal
		.quarantine
		.quarantine_job(&mut job, "replica mismatch", vec![TargetId::from("clinical")])
		.await
		.unwrap();

	let (reviewed, released_job) = journal
		.quarantine
		.release(entry.id, "alice", "drive replaced")
		.await
		.unwrap();

	assert_eq!(reviewed.status, QuarantineStatus::Released);
	assert_eq!(reviewed.reviewed_by.as_deref(), Some("alice"));
	assert!(reviewed.reviewed_at.is_some());
	assert_eq!(released_job.state, JobState::Queued);

	let outcomes = journal.targets.find_for_job(job.id).await.unwrap();
	let clinical = outcomes
		.iter()
		.find(|o| o.target_id == TargetId::from("clinical"))
		.unwrap();
	assert_eq!(clinical.copy_state, TargetCopyState::Pending);
	assert_eq!(clinical.attempts, 0);
	assert_eq!(clinical.last_error, None);
	assert!(!clinical.integrity_failure);

	// The healthy replica keeps its verified outcome
	let research = outcomes
		.iter()
		.find(|o| o.target_id == TargetId::from("research"))
		.unwrap();
	assert_eq!(research.copy_state, TargetCopyState::Verified);
}

#[tokio::test]
async fn purge_fails_the_job_for_good() {
	let journal = journal().await;
	let mut job = sample_job();
	job.state = JobState::Partial;
	job.source_hash = Some("ab".repeat(32));
	journal.jobs.insert(&job).await.unwrap();

	let entry = journal
		.quarantine
		.quarantine_job(&mut job, "replica mismatch", vec![TargetId::from("clinical")])
		.await
		.unwrap();

	let (reviewed, failed_job) = journal
		.quarantine
		.purge(entry.id, "bob", "media unrecoverable")
		.await
		.unwrap();

	assert_eq!(reviewed.status, QuarantineStatus::Purged);
	assert_eq!(failed_job.state, JobState::Failed);

	// A reviewed entry cannot be reviewed twice
	let again = journal.quarantine.release(entry.id, "bob", "oops").await;
	assert!(again.is_err());
}

#[tokio::test]
async fn quarantine_list_and_stats_reflect_entries() {
	let journal = journal().await;
	let mut job = sample_job();
	job.state = JobState::Partial;
	job.source_hash = Some("ab".repeat(32));
	journal.jobs.insert(&job).await.unwrap();

	journal
		.quarantine
		.quarantine_job(&mut job, "replica mismatch", vec![TargetId::from("clinical")])
		.await
		.unwrap();

	let active = journal
		.quarantine
		.list(QuarantineFilter {
			status: Some(QuarantineStatus::Active),
			since: None,
		})
		.await
		.unwrap();
	assert_eq!(active.len(), 1);

	let stats = journal.quarantine.stats(None).await.unwrap();
	assert_eq!(stats.total, 1);
	assert_eq!(stats.active, 1);
	assert_eq!(stats.released, 0);
	assert_eq!(stats.purged, 0);
}
