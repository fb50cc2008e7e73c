//! Integration tests for the single-target copier

use forker_core::operations::copier::{self, TEMP_SUFFIX};
use forker_core::operations::hasher::{self, EMPTY_SHA256};
use forker_core::shared::ReplicatorError;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::watch;

fn no_progress() -> impl Fn(u64) + Send + Sync {
	|_| {}
}

fn live_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
	watch::channel(false)
}

fn temp_sibling(final_path: &Path) -> PathBuf {
	copier::temp_path_for(final_path)
}

#[tokio::test]
async fn copy_round_trips_bytes_and_hash() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("input/scan-001.svs");
	let dest = dir.path().join("clinical/scan-001.svs");
	std::fs::create_dir_all(source.parent().unwrap()).unwrap();

	// Larger than one hashing buffer so the loop runs more than once
	let payload: Vec<u8> = (0..(1024 * 1024 + 8192)).map(|i| (i % 251) as u8).collect();
	std::fs::write(&source, &payload).unwrap();

	let (_tx, cancel) = live_cancel();
	let outcome = copier::copy(&source, &dest, None, &no_progress(), &cancel)
		.await
		.unwrap();

	assert_eq!(outcome.bytes, payload.len() as u64);
	assert_eq!(std::fs::read(&dest).unwrap(), payload);
	assert_eq!(outcome.hash, hasher::hash_file(&dest).await.unwrap());
	assert_eq!(outcome.hash, hasher::hash_file(&source).await.unwrap());
	assert!(!temp_sibling(&dest).exists());
}

#[tokio::test]
async fn recopy_over_identical_destination_is_a_no_op() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("scan.svs");
	let dest = dir.path().join("out/scan.svs");
	std::fs::write(&source, b"imaging payload").unwrap();

	let (_tx, cancel) = live_cancel();
	let first = copier::copy(&source, &dest, None, &no_progress(), &cancel)
		.await
		.unwrap();
	let second = copier::copy(&source, &dest, None, &no_progress(), &cancel)
		.await
		.unwrap();

	assert_eq!(first.hash, second.hash);
	assert_eq!(std::fs::read(&dest).unwrap(), b"imaging payload");
	assert!(!temp_sibling(&dest).exists());
}

#[tokio::test]
async fn zero_byte_file_copies_with_the_empty_hash() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("empty.svs");
	let dest = dir.path().join("out/empty.svs");
	std::fs::write(&source, b"").unwrap();

	let (_tx, cancel) = live_cancel();
	let outcome = copier::copy(&source, &dest, None, &no_progress(), &cancel)
		.await
		.unwrap();

	assert_eq!(outcome.bytes, 0);
	assert_eq!(outcome.hash, EMPTY_SHA256);
	assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
}

#[tokio::test]
async fn expected_hash_mismatch_fails_before_publication() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("scan.svs");
	let dest = dir.path().join("out/scan.svs");
	std::fs::write(&source, b"actual bytes").unwrap();

	let (_tx, cancel) = live_cancel();
	let wrong = "00".repeat(32);
	let result = copier::copy(&source, &dest, Some(&wrong), &no_progress(), &cancel).await;

	assert!(matches!(result, Err(ReplicatorError::HashMismatch { .. })));
	assert!(!dest.exists());
	assert!(!temp_sibling(&dest).exists());
}

#[tokio::test]
async fn cancelled_copy_leaves_no_temp_file() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("scan.svs");
	let dest = dir.path().join("out/scan.svs");
	std::fs::write(&source, vec![7u8; 64 * 1024]).unwrap();

	let (tx, cancel) = live_cancel();
	tx.send(true).unwrap();
	let result = copier::copy(&source, &dest, None, &no_progress(), &cancel).await;

	assert!(matches!(result, Err(ReplicatorError::Cancelled)));
	assert!(!dest.exists());
	assert!(!temp_sibling(&dest).exists());
}

#[tokio::test]
async fn stale_temp_file_is_replaced() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("scan.svs");
	let dest = dir.path().join("out/scan.svs");
	std::fs::write(&source, b"fresh bytes").unwrap();
	std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
	std::fs::write(temp_sibling(&dest), b"leftover from a crash").unwrap();

	let (_tx, cancel) = live_cancel();
	let outcome = copier::copy(&source, &dest, None, &no_progress(), &cancel)
		.await
		.unwrap();

	assert_eq!(outcome.bytes, 11);
	assert_eq!(std::fs::read(&dest).unwrap(), b"fresh bytes");
	assert!(!temp_sibling(&dest).exists());
}

#[tokio::test]
async fn progress_callback_reports_cumulative_bytes() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("scan.svs");
	let dest = dir.path().join("out/scan.svs");
	let payload = vec![3u8; 2 * 1024 * 1024 + 100];
	std::fs::write(&source, &payload).unwrap();

	let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
	let sink = seen.clone();
	let progress = move |bytes: u64| sink.lock().unwrap().push(bytes);

	let (_tx, cancel) = live_cancel();
	copier::copy(&source, &dest, None, &progress, &cancel)
		.await
		.unwrap();

	let seen = seen.lock().unwrap();
	assert!(seen.len() >= 3);
	assert!(seen.windows(2).all(|w| w[0] < w[1]));
	assert_eq!(*seen.last().unwrap(), payload.len() as u64);
}

#[tokio::test]
async fn orphan_sweep_removes_temp_files_recursively() {
	let dir = TempDir::new().unwrap();
	let nested = dir.path().join("a/b");
	std::fs::create_dir_all(&nested).unwrap();
	std::fs::write(dir.path().join(format!("one{TEMP_SUFFIX}")), b"x").unwrap();
	std::fs::write(nested.join(format!("two{TEMP_SUFFIX}")), b"y").unwrap();
	std::fs::write(nested.join("keep.svs"), b"payload").unwrap();

	let removed = copier::remove_orphan_temps(dir.path()).await.unwrap();

	assert_eq!(removed, 2);
	assert!(nested.join("keep.svs").exists());
	assert!(!nested.join(format!("two{TEMP_SUFFIX}")).exists());
}
