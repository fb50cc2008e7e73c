//! Supervisor tests: startup recovery, the full discovery-to-verified
//! loop, and operator actions

use forker_core::config::ReplicatorConfig;
use forker_core::domain::{
	Job, JobState, TargetCopyState, TargetEvent, TargetId, TargetOutcome,
};
use forker_core::infrastructure::journal::Journal;
use forker_core::infrastructure::metrics::PipelineMetrics;
use forker_core::operations::copier;
use forker_core::operations::hasher;
use forker_core::services::watcher::{PathEvent, PathEventKind};
use forker_core::{EventBus, PipelineSupervisor};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

async fn build(config: ReplicatorConfig) -> (Arc<PipelineSupervisor>, Arc<Journal>) {
	let config = Arc::new(config);
	config.ensure_directories().unwrap();
	let journal = Arc::new(Journal::open_in_memory().await.unwrap());
	let supervisor = Arc::new(PipelineSupervisor::new(
		config,
		journal.clone(),
		EventBus::default(),
		Arc::new(PipelineMetrics::default()),
	));
	(supervisor, journal)
}

fn fast_config(root: &Path) -> ReplicatorConfig {
	let mut config = ReplicatorConfig::default_with_root(root);
	config.stability.check_interval_seconds = 1;
	config.stability.consecutive_checks = 1;
	config.stability.min_file_age_seconds = 0;
	config.stability.max_checks = 10;
	config
}

#[tokio::test]
async fn recovery_reclassifies_interrupted_work_and_sweeps_temps() {
	let root = TempDir::new().unwrap();
	let config = fast_config(root.path());
	let (supervisor, journal) = build(config.clone()).await;

	let source = config.source_dir.join("scan-010.svs");
	std::fs::write(&source, b"interrupted payload").unwrap();

	// Journal a job that died mid-copy and mid-verification
	let mut job = Job::discovered(source, 19, config.target_ids());
	job.state = JobState::InProgress;
	journal.jobs.insert(&job).await.unwrap();

	let clinical_final = config.dest_roots[0].path.join("scan-010.svs");
	let clinical_temp = copier::temp_path_for(&clinical_final);
	std::fs::write(&clinical_temp, b"partial bytes").unwrap();

	let mut copying = TargetOutcome::pending(job.id, TargetId::from("clinical"), clinical_final);
	copying.apply(TargetEvent::CopyStarted).unwrap();
	copying.temp_path = Some(clinical_temp.clone());
	journal.targets.insert(&copying).await.unwrap();

	let research_final = config.dest_roots[1].path.join("scan-010.svs");
	std::fs::write(&research_final, b"interrupted payload").unwrap();
	let mut verifying = TargetOutcome::pending(job.id, TargetId::from("research"), research_final);
	verifying.apply(TargetEvent::CopyStarted).unwrap();
	verifying.apply(TargetEvent::CopyFinished).unwrap();
	verifying.apply(TargetEvent::VerifyStarted).unwrap();
	journal.targets.insert(&verifying).await.unwrap();

	// A stray temp in the other root, left by an older crash
	let stray = copier::temp_path_for(&config.dest_roots[1].path.join("older.svs"));
	std::fs::write(&stray, b"junk").unwrap();

	let report = supervisor.recover().await.unwrap();

	assert_eq!(report.resubmitted_jobs, 1);
	assert_eq!(report.reclassified_copying, 1);
	assert_eq!(report.reclassified_verifying, 1);
	assert_eq!(report.orphan_temps_removed, 2);
	assert!(!clinical_temp.exists());
	assert!(!stray.exists());

	let outcomes = journal.targets.find_for_job(job.id).await.unwrap();
	let clinical = outcomes
		.iter()
		.find(|o| o.target_id == TargetId::from("clinical"))
		.unwrap();
	assert_eq!(clinical.copy_state, TargetCopyState::Pending);
	assert_eq!(clinical.temp_path, None);

	let research = outcomes
		.iter()
		.find(|o| o.target_id == TargetId::from("research"))
		.unwrap();
	assert_eq!(research.copy_state, TargetCopyState::Copied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn discovery_event_flows_to_verified_and_source_cleanup() {
	let root = TempDir::new().unwrap();
	let config = fast_config(root.path());
	let (supervisor, journal) = build(config.clone()).await;

	let source = config.source_dir.join("scan-011.svs");
	let payload = vec![0x5Au8; 128 * 1024];
	std::fs::write(&source, &payload).unwrap();
	let expected_hash = hasher::hash_file(&source).await.unwrap();

	let (tx, rx) = mpsc::channel(16);
	let runner = tokio::spawn(supervisor.clone().run(rx));

	tx.send(PathEvent {
		path: source.clone(),
		kind: PathEventKind::Created,
	})
	.await
	.unwrap();

	// Wait for the pipeline to take the file all the way to verified
	let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
	let job = loop {
		if tokio::time::Instant::now() > deadline {
			panic!("job never reached verified");
		}
		let jobs = journal.jobs.find_by_state(JobState::Verified).await.unwrap();
		if let Some(job) = jobs.into_iter().next() {
			break job;
		}
		tokio::time::sleep(Duration::from_millis(200)).await;
	};

	assert_eq!(job.source_hash.as_deref(), Some(expected_hash.as_str()));

	for dest in &config.dest_roots {
		let replica = dest.path.join("scan-011.svs");
		assert_eq!(std::fs::read(&replica).unwrap(), payload);
		assert!(!copier::temp_path_for(&replica).exists());
	}

	// Verified source files leave the input directory
	assert!(!source.exists());

	let outcomes = journal.targets.find_for_job(job.id).await.unwrap();
	assert!(outcomes
		.iter()
		.all(|o| o.copy_state == TargetCopyState::Verified));

	supervisor.shutdown();
	drop(tx);
	runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn operator_retry_revives_a_permanently_failed_target() {
	let root = TempDir::new().unwrap();
	let mut config = fast_config(root.path());
	config.debug.keep_source = true;
	let (supervisor, journal) = build(config.clone()).await;

	let source = config.source_dir.join("scan-012.svs");
	let payload = b"revivable payload".to_vec();
	std::fs::write(&source, &payload).unwrap();
	let source_hash = hasher::hash_file(&source).await.unwrap();

	// Journal a failed job: clinical permanently failed, research verified
	let mut job = Job::discovered(source, payload.len() as u64, config.target_ids());
	job.state = JobState::Failed;
	job.source_hash = Some(source_hash.clone());
	journal.jobs.insert(&job).await.unwrap();

	let clinical_final = config.dest_roots[0].path.join("scan-012.svs");
	let mut failed = TargetOutcome::pending(job.id, TargetId::from("clinical"), clinical_final);
	failed.copy_state = TargetCopyState::FailedPermanent;
	failed.attempts = 5;
	failed.last_error = Some("copy failed 5 times (limit 5)".into());
	journal.targets.insert(&failed).await.unwrap();

	let research_final = config.dest_roots[1].path.join("scan-012.svs");
	std::fs::write(&research_final, &payload).unwrap();
	let mut verified = TargetOutcome::pending(job.id, TargetId::from("research"), research_final);
	verified.copy_state = TargetCopyState::Verified;
	verified.hash = Some(source_hash.clone());
	journal.targets.insert(&verified).await.unwrap();

	supervisor
		.retry_target(job.id, &TargetId::from("clinical"))
		.await
		.unwrap();

	let finished = journal.jobs.find(job.id).await.unwrap().unwrap();
	assert_eq!(finished.state, JobState::Verified);

	let outcomes = journal.targets.find_for_job(job.id).await.unwrap();
	for outcome in &outcomes {
		assert_eq!(outcome.copy_state, TargetCopyState::Verified);
		assert_eq!(outcome.hash.as_deref(), Some(source_hash.as_str()));
	}

	let replica = config.dest_roots[0].path.join("scan-012.svs");
	assert_eq!(std::fs::read(replica).unwrap(), payload);
}

#[tokio::test]
async fn quarantine_release_runs_the_job_back_through_the_pipeline() {
	let root = TempDir::new().unwrap();
	let mut config = fast_config(root.path());
	config.debug.keep_source = true;
	let (supervisor, journal) = build(config.clone()).await;

	let source = config.source_dir.join("scan-013.svs");
	let payload = b"quarantined payload".to_vec();
	std::fs::write(&source, &payload).unwrap();
	let source_hash = hasher::hash_file(&source).await.unwrap();

	let mut job = Job::discovered(source, payload.len() as u64, config.target_ids());
	job.state = JobState::Partial;
	job.source_hash = Some(source_hash.clone());
	journal.jobs.insert(&job).await.unwrap();

	let clinical_final = config.dest_roots[0].path.join("scan-013.svs");
	let mut bad = TargetOutcome::pending(job.id, TargetId::from("clinical"), clinical_final);
	bad.copy_state = TargetCopyState::FailedPermanent;
	bad.last_error = Some(format!("hash mismatch: expected {source_hash}, got deadbeef"));
	bad.integrity_failure = true;
	journal.targets.insert(&bad).await.unwrap();

	let research_final = config.dest_roots[1].path.join("scan-013.svs");
	std::fs::write(&research_final, &payload).unwrap();
	let mut good = TargetOutcome::pending(job.id, TargetId::from("research"), research_final);
	good.copy_state = TargetCopyState::Verified;
	good.hash = Some(source_hash.clone());
	journal.targets.insert(&good).await.unwrap();

	let entry = journal
		.quarantine
		.quarantine_job(&mut job, "replica mismatch", vec![TargetId::from("clinical")])
		.await
		.unwrap();

	let released = supervisor
		.release_quarantine(entry.id, "alice", "controller firmware patched")
		.await
		.unwrap();

	// Release re-copied the affected replica and verified the whole job
	assert_eq!(released.state, JobState::Verified);
	let replica = config.dest_roots[0].path.join("scan-013.svs");
	assert_eq!(std::fs::read(replica).unwrap(), payload);
}
