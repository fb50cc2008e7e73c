//! Retry policy
//!
//! A pure function from (attempt, failure classification, operation kind)
//! to a decision. Exponential backoff with a ceiling; jitter is symmetric
//! but never drops a delay below the previous attempt's nominal value, so
//! observed delays are non-decreasing after jitter normalisation.

use crate::config::RetryConfig;
use crate::shared::{ErrorClass, ReplicatorError};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Pipeline operations with distinct backoff bases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
	Copy,
	Verify,
	Discovery,
	Stability,
	Database,
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Copy => write!(f, "copy"),
			Self::Verify => write!(f, "verify"),
			Self::Discovery => write!(f, "discovery"),
			Self::Stability => write!(f, "stability"),
			Self::Database => write!(f, "database"),
		}
	}
}

/// Outcome of consulting the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
	/// Try again after the delay
	Retry { delay: Duration },
	/// The failure class can never succeed; fail the target now
	Permanent { reason: String },
	/// The attempt budget ran out
	GiveUp { reason: String },
}

/// Backoff and classification policy shared by every orchestrator
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	config: RetryConfig,
}

impl RetryPolicy {
	pub fn new(config: RetryConfig) -> Self {
		Self { config }
	}

	pub fn max_attempts(&self) -> u32 {
		self.config.max_attempts
	}

	fn base(&self, operation: OperationKind) -> Duration {
		let seconds = match operation {
			OperationKind::Copy => self.config.backoff_base_copy_seconds,
			OperationKind::Verify => self.config.backoff_base_verify_seconds,
			OperationKind::Discovery => self.config.backoff_base_discovery_seconds,
			OperationKind::Stability => self.config.backoff_base_stability_seconds,
			OperationKind::Database => self.config.backoff_base_database_seconds,
		};
		Duration::from_secs(seconds)
	}

	/// `min(max_delay, base * multiplier^(attempt-1))`, without jitter
	pub fn nominal_delay(&self, operation: OperationKind, attempt: u32) -> Duration {
		if attempt == 0 {
			return Duration::ZERO;
		}
		let base = self.base(operation).as_secs_f64();
		let exponent = (attempt - 1) as i32;
		let raw = base * self.config.backoff_multiplier.powi(exponent);
		let capped = raw.min(self.config.max_backoff_seconds as f64);
		Duration::from_secs_f64(capped)
	}

	/// Nominal delay plus symmetric jitter, clamped so the schedule never
	/// regresses below the previous attempt's nominal value
	pub fn jittered_delay(&self, operation: OperationKind, attempt: u32) -> Duration {
		let nominal = self.nominal_delay(operation, attempt).as_secs_f64();
		let previous = self
			.nominal_delay(operation, attempt.saturating_sub(1))
			.as_secs_f64();

		let spread = self.config.jitter_factor * nominal;
		let jitter = if spread > 0.0 {
			rand::thread_rng().gen_range(-spread..=spread)
		} else {
			0.0
		};

		let delayed = (nominal + jitter).max(previous).max(0.0);
		Duration::from_secs_f64(delayed)
	}

	/// Decide what happens after a failed attempt
	///
	/// `attempt` counts attempts already made, starting at 1.
	pub fn should_retry(
		&self,
		attempt: u32,
		error: &ReplicatorError,
		operation: OperationKind,
	) -> RetryDecision {
		match error.class() {
			ErrorClass::Permanent | ErrorClass::Integrity => {
				return RetryDecision::Permanent {
					reason: error.to_string(),
				};
			}
			ErrorClass::Cancelled => {
				return RetryDecision::GiveUp {
					reason: "cancelled".to_string(),
				};
			}
			// Unknown failures get the benefit of the doubt twice
			ErrorClass::Unknown if attempt >= 2 => {
				return RetryDecision::Permanent {
					reason: format!("unclassified failure persisted: {error}"),
				};
			}
			ErrorClass::Unknown | ErrorClass::Transient => {}
		}

		if attempt >= self.config.max_attempts {
			return RetryDecision::GiveUp {
				reason: format!(
					"{operation} failed {attempt} times (limit {})",
					self.config.max_attempts
				),
			};
		}

		RetryDecision::Retry {
			delay: self.jittered_delay(operation, attempt),
		}
	}
}
