//! Single-target copier
//!
//! Streams the source into a temp file next to the final path while feeding
//! the same buffer into an incremental SHA-256, then publishes the replica
//! with an atomic rename. The temp suffix is reserved to this system;
//! callers guarantee temp and final live on one filesystem so the rename
//! stays atomic.

use crate::shared::{ReplicatorError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::hasher::{self, BUFFER_SIZE};

/// Reserved suffix for in-flight replica files
pub const TEMP_SUFFIX: &str = ".forker-tmp";

/// Result of a successful copy stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
	/// Lowercase hex SHA-256 of the copied bytes
	pub hash: String,
	pub bytes: u64,
	pub duration: Duration,
}

/// Temp path for a final path: a sibling carrying the reserved suffix
pub fn temp_path_for(final_path: &Path) -> PathBuf {
	let mut name = final_path
		.file_name()
		.map(|n| n.to_os_string())
		.unwrap_or_default();
	name.push(TEMP_SUFFIX);
	final_path.with_file_name(name)
}

/// Removes the temp file on every exit path unless disarmed
struct TempGuard {
	path: PathBuf,
	armed: bool,
}

impl TempGuard {
	fn new(path: PathBuf) -> Self {
		Self { path, armed: true }
	}

	fn disarm(&mut self) {
		self.armed = false;
	}
}

impl Drop for TempGuard {
	fn drop(&mut self) {
		if self.armed {
			if let Err(e) = std::fs::remove_file(&self.path) {
				if e.kind() != std::io::ErrorKind::NotFound {
					warn!(path = %self.path.display(), "Failed to remove temp file: {e}");
				}
			}
		}
	}
}

/// Copy `source` to `final_path` through a temp sibling, hashing in one pass
///
/// `expected_hash` short-circuits a corrupt stream before publication.
/// `progress` receives the cumulative byte count after every chunk; the
/// caller throttles emission and feeds its no-progress watchdog from it.
/// Cancellation is cooperative and leaves no temp file behind.
pub async fn copy(
	source: &Path,
	final_path: &Path,
	expected_hash: Option<&str>,
	progress: &(dyn Fn(u64) + Send + Sync),
	cancel: &watch::Receiver<bool>,
) -> Result<CopyOutcome> {
	let started = Instant::now();

	if let Some(parent) = final_path.parent() {
		fs::create_dir_all(parent)
			.await
			.map_err(|e| ReplicatorError::from_io(e, parent))?;
	}

	let temp_path = temp_path_for(final_path);
	match fs::remove_file(&temp_path).await {
		Ok(()) => debug!(path = %temp_path.display(), "Removed stale temp file"),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => return Err(ReplicatorError::from_io(e, &temp_path)),
	}

	let mut source_file = fs::File::open(source)
		.await
		.map_err(|e| ReplicatorError::from_io(e, source))?;
	let mut temp_file = fs::File::create(&temp_path)
		.await
		.map_err(|e| ReplicatorError::from_io(e, &temp_path))?;

	let mut guard = TempGuard::new(temp_path.clone());
	let mut hasher = Sha256::new();
	let mut buffer = vec![0u8; BUFFER_SIZE];
	let mut total_copied = 0u64;

	loop {
		if *cancel.borrow() {
			return Err(ReplicatorError::Cancelled);
		}

		let bytes_read = source_file
			.read(&mut buffer)
			.await
			.map_err(|e| ReplicatorError::from_io(e, source))?;
		if bytes_read == 0 {
			break;
		}

		let chunk = &buffer[..bytes_read];
		temp_file
			.write_all(chunk)
			.await
			.map_err(|e| ReplicatorError::from_io(e, &temp_path))?;
		hasher.update(chunk);

		total_copied += bytes_read as u64;
		progress(total_copied);
	}

	temp_file
		.flush()
		.await
		.map_err(|e| ReplicatorError::from_io(e, &temp_path))?;
	temp_file
		.sync_all()
		.await
		.map_err(|e| ReplicatorError::from_io(e, &temp_path))?;
	drop(temp_file);
	drop(source_file);

	let hash = hex::encode(hasher.finalize());

	if let Some(expected) = expected_hash {
		if expected != hash {
			return Err(ReplicatorError::HashMismatch {
				expected: expected.to_string(),
				actual: hash,
			});
		}
	}

	// Idempotent publication: an existing final that already carries the
	// right bytes wins over a rename.
	if let Ok(existing) = fs::metadata(final_path).await {
		if existing.len() == total_copied && hasher::hash_file(final_path).await? == hash {
			debug!(path = %final_path.display(), "Replica already published; keeping existing file");
			return Ok(CopyOutcome {
				hash,
				bytes: total_copied,
				duration: started.elapsed(),
			});
		}
	}

	fs::rename(&temp_path, final_path)
		.await
		.map_err(|e| ReplicatorError::from_io(e, final_path))?;
	guard.disarm();

	Ok(CopyOutcome {
		hash,
		bytes: total_copied,
		duration: started.elapsed(),
	})
}

/// Delete every file carrying the reserved temp suffix under `root`
///
/// Recovery runs this before resubmitting jobs so a crash never leaves a
/// partial replica masquerading as published.
pub async fn remove_orphan_temps(root: &Path) -> Result<u64> {
	let mut removed = 0u64;
	let mut stack = vec![root.to_path_buf()];

	while let Some(dir) = stack.pop() {
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
			Err(e) => return Err(ReplicatorError::from_io(e, &dir)),
		};
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| ReplicatorError::from_io(e, &dir))?
		{
			let path = entry.path();
			let file_type = entry
				.file_type()
				.await
				.map_err(|e| ReplicatorError::from_io(e, &path))?;
			if file_type.is_dir() {
				stack.push(path);
			} else if path
				.file_name()
				.and_then(|n| n.to_str())
				.map(|n| n.ends_with(TEMP_SUFFIX))
				.unwrap_or(false)
			{
				fs::remove_file(&path)
					.await
					.map_err(|e| ReplicatorError::from_io(e, &path))?;
				warn!(path = %path.display(), "Removed orphaned temp file");
				removed += 1;
			}
		}
	}

	Ok(removed)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn temp_path_is_sibling_with_suffix() {
		let temp = temp_path_for(Path::new("/mnt/clinical/scans/scan-001.svs"));
		assert_eq!(
			temp,
			PathBuf::from("/mnt/clinical/scans/scan-001.svs.forker-tmp")
		);
		assert_eq!(temp.parent(), Path::new("/mnt/clinical/scans").into());
	}
}
