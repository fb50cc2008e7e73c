//! Pipeline metrics
//!
//! Owned by the composition root and handed to components through their
//! constructors. Export format is a consumer concern; this is the shared
//! counter surface.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges for the replication pipeline
#[derive(Debug, Default)]
pub struct PipelineMetrics {
	pub jobs_discovered: AtomicU64,
	pub jobs_verified: AtomicU64,
	pub jobs_failed: AtomicU64,
	pub jobs_quarantined: AtomicU64,
	pub jobs_in_flight: AtomicI64,

	pub copies_succeeded: AtomicU64,
	pub copies_failed: AtomicU64,
	pub bytes_copied: AtomicU64,

	pub verifications_succeeded: AtomicU64,
	pub verifications_failed: AtomicU64,

	pub retries_scheduled: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub jobs_discovered: u64,
	pub jobs_verified: u64,
	pub jobs_failed: u64,
	pub jobs_quarantined: u64,
	pub jobs_in_flight: i64,
	pub copies_succeeded: u64,
	pub copies_failed: u64,
	pub bytes_copied: u64,
	pub verifications_succeeded: u64,
	pub verifications_failed: u64,
	pub retries_scheduled: u64,
}

impl PipelineMetrics {
	pub fn add_bytes_copied(&self, bytes: u64) {
		self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn incr(&self, counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn job_started(&self) {
		self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
	}

	pub fn job_finished(&self) {
		self.jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			jobs_discovered: self.jobs_discovered.load(Ordering::Relaxed),
			jobs_verified: self.jobs_verified.load(Ordering::Relaxed),
			jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
			jobs_quarantined: self.jobs_quarantined.load(Ordering::Relaxed),
			jobs_in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
			copies_succeeded: self.copies_succeeded.load(Ordering::Relaxed),
			copies_failed: self.copies_failed.load(Ordering::Relaxed),
			bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
			verifications_succeeded: self.verifications_succeeded.load(Ordering::Relaxed),
			verifications_failed: self.verifications_failed.load(Ordering::Relaxed),
			retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
		}
	}
}
