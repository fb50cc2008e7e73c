//! Stability gate
//!
//! A source file is processed only after its size and readability have been
//! observed consistent for K consecutive probes and the file is old enough.
//! Later stages never read a byte of a file the gate has not declared
//! stable; the gate itself reads at most 1 KiB per probe.

use crate::config::StabilityConfig;
use crate::shared::{ReplicatorError, Result};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Verdict of the gate for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability {
	/// The file held still; `size` is the byte length the pipeline records
	Stable { size: u64 },
	/// The probe budget ran out before the file settled
	Unstable { reason: String },
}

/// Polls a path until it is safe to copy
#[derive(Debug, Clone)]
pub struct StabilityGate {
	check_interval: Duration,
	consecutive_checks: u32,
	min_file_age: Duration,
	max_checks: u32,
}

impl StabilityGate {
	pub fn new(
		check_interval: Duration,
		consecutive_checks: u32,
		min_file_age: Duration,
		max_checks: u32,
	) -> Self {
		Self {
			check_interval,
			consecutive_checks,
			min_file_age,
			max_checks,
		}
	}

	pub fn from_config(config: &StabilityConfig) -> Self {
		Self::new(
			config.check_interval(),
			config.consecutive_checks,
			config.min_file_age(),
			config.max_checks,
		)
	}

	/// Poll until the path is stable, the budget runs out, or cancellation
	pub async fn wait_for_stability(
		&self,
		path: &Path,
		cancel: &watch::Receiver<bool>,
	) -> Result<Stability> {
		let mut checks = 0u32;
		let mut streak = 0u32;
		let mut prev_size: Option<u64> = None;

		loop {
			if *cancel.borrow() {
				return Err(ReplicatorError::Cancelled);
			}
			if checks >= self.max_checks {
				return Ok(Stability::Unstable {
					reason: format!(
						"not stable after {} checks ({} consecutive required)",
						checks, self.consecutive_checks
					),
				});
			}
			checks += 1;

			match self.probe(path).await {
				Ok(observation) => {
					let settled = prev_size == Some(observation.size) && observation.old_enough;
					if settled {
						streak += 1;
						trace!(
							path = %path.display(),
							size = observation.size,
							streak,
							"Stability probe matched"
						);
						if streak >= self.consecutive_checks {
							return Ok(Stability::Stable {
								size: observation.size,
							});
						}
					} else {
						streak = 0;
					}
					prev_size = Some(observation.size);
				}
				// Probe failures are transient: reset and keep polling
				Err(e) => {
					debug!(path = %path.display(), "Stability probe failed: {e}");
					streak = 0;
					prev_size = None;
				}
			}

			tokio::time::sleep(self.check_interval).await;
		}
	}

	/// One observation: size, readability, age. At most 1 KiB is read.
	async fn probe(&self, path: &Path) -> std::io::Result<Observation> {
		let metadata = fs::metadata(path).await?;
		if !metadata.is_file() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				"not a regular file",
			));
		}

		let mut file = fs::File::open(path).await?;
		let mut probe_buf = [0u8; 1024];
		let _ = file.read(&mut probe_buf).await?;

		let old_enough = metadata
			.modified()
			.ok()
			.and_then(|mtime| mtime.elapsed().ok())
			.map(|age| age >= self.min_file_age)
			.unwrap_or(false);

		Ok(Observation {
			size: metadata.len(),
			old_enough,
		})
	}
}

struct Observation {
	size: u64,
	old_enough: bool,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::TempDir;

	fn fast_gate(consecutive: u32, max_checks: u32) -> StabilityGate {
		StabilityGate::new(
			Duration::from_millis(20),
			consecutive,
			Duration::ZERO,
			max_checks,
		)
	}

	fn no_cancel() -> watch::Receiver<bool> {
		let (tx, rx) = watch::channel(false);
		// Keep the sender alive for the test duration
		Box::leak(Box::new(tx));
		rx
	}

	#[tokio::test]
	async fn settled_file_is_declared_stable() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("scan.svs");
		std::fs::write(&path, vec![1u8; 4096]).unwrap();

		let verdict = fast_gate(2, 20)
			.wait_for_stability(&path, &no_cancel())
			.await
			.unwrap();
		assert_eq!(verdict, Stability::Stable { size: 4096 });
	}

	#[tokio::test]
	async fn growing_file_only_settles_after_growth_stops() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("scan.svs");
		std::fs::write(&path, vec![0u8; 100]).unwrap();

		let writer_path = path.clone();
		let writer = tokio::spawn(async move {
			for _ in 0..4 {
				tokio::time::sleep(Duration::from_millis(30)).await;
				let mut file = std::fs::OpenOptions::new()
					.append(true)
					.open(&writer_path)
					.unwrap();
				file.write_all(&vec![0u8; 100]).unwrap();
			}
		});

		let verdict = fast_gate(2, 100)
			.wait_for_stability(&path, &no_cancel())
			.await
			.unwrap();
		writer.await.unwrap();

		// Stability must only be declared at the final size
		assert_eq!(verdict, Stability::Stable { size: 500 });
	}

	#[tokio::test]
	async fn missing_file_exhausts_the_budget() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("never-arrives.svs");

		let verdict = fast_gate(2, 5)
			.wait_for_stability(&path, &no_cancel())
			.await
			.unwrap();
		assert!(matches!(verdict, Stability::Unstable { .. }));
	}

	#[tokio::test]
	async fn young_file_is_not_stable() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("fresh.svs");
		std::fs::write(&path, vec![0u8; 64]).unwrap();

		let gate = StabilityGate::new(
			Duration::from_millis(20),
			2,
			Duration::from_secs(3600),
			4,
		);
		let verdict = gate.wait_for_stability(&path, &no_cancel()).await.unwrap();
		assert!(matches!(verdict, Stability::Unstable { .. }));
	}

	#[tokio::test]
	async fn cancellation_aborts_the_wait() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("scan.svs");
		std::fs::write(&path, vec![0u8; 64]).unwrap();

		let (tx, rx) = watch::channel(true);
		let result = fast_gate(2, 20).wait_for_stability(&path, &rx).await;
		drop(tx);
		assert!(matches!(result, Err(ReplicatorError::Cancelled)));
	}
}
