//! Per-target copy and verification outcome

use super::{job::JobId, InvalidTransition};
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of a destination replica (e.g. "clinical", "research")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TargetId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for TargetId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

impl From<String> for TargetId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// Copy/verification state of one `(job, target)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum TargetCopyState {
	#[sea_orm(string_value = "pending")]
	Pending,
	#[sea_orm(string_value = "copying")]
	Copying,
	#[sea_orm(string_value = "copied")]
	Copied,
	#[sea_orm(string_value = "verifying")]
	Verifying,
	#[sea_orm(string_value = "verified")]
	Verified,
	#[sea_orm(string_value = "failed_retryable")]
	FailedRetryable,
	#[sea_orm(string_value = "failed_permanent")]
	FailedPermanent,
}

impl TargetCopyState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Verified | Self::FailedPermanent)
	}

	/// The single transition function for the target state machine
	pub fn transition(self, event: TargetEvent) -> Result<TargetCopyState, InvalidTransition> {
		use TargetCopyState::*;
		use TargetEvent::*;

		let next = match (self, event) {
			(Pending, CopyStarted) => Copying,
			(Copying, CopyFinished) => Copied,
			(Copied, VerifyStarted) => Verifying,
			(Verifying, VerifySucceeded) => Verified,
			(Copying, RetryableFailure) | (Verifying, RetryableFailure) => FailedRetryable,
			(Copying, PermanentFailure)
			| (Verifying, PermanentFailure)
			| (FailedRetryable, PermanentFailure) => FailedPermanent,
			(FailedRetryable, RetryScheduled) => Pending,
			// Operator-requested retry grants a fresh attempt budget
			(FailedPermanent, OperatorRetry) => Pending,
			// Startup recovery: reclassify work interrupted mid-flight
			(Copying, CopyInterrupted) => Pending,
			(Verifying, VerifyInterrupted) => Copied,
			(from, event) => {
				return Err(InvalidTransition::new("target", from, event));
			}
		};
		Ok(next)
	}
}

impl fmt::Display for TargetCopyState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "pending"),
			Self::Copying => write!(f, "copying"),
			Self::Copied => write!(f, "copied"),
			Self::Verifying => write!(f, "verifying"),
			Self::Verified => write!(f, "verified"),
			Self::FailedRetryable => write!(f, "failed_retryable"),
			Self::FailedPermanent => write!(f, "failed_permanent"),
		}
	}
}

/// Events that drive the target state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
	CopyStarted,
	CopyFinished,
	VerifyStarted,
	VerifySucceeded,
	RetryableFailure,
	PermanentFailure,
	RetryScheduled,
	OperatorRetry,
	CopyInterrupted,
	VerifyInterrupted,
}

impl fmt::Display for TargetEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::CopyStarted => "copy_started",
			Self::CopyFinished => "copy_finished",
			Self::VerifyStarted => "verify_started",
			Self::VerifySucceeded => "verify_succeeded",
			Self::RetryableFailure => "retryable_failure",
			Self::PermanentFailure => "permanent_failure",
			Self::RetryScheduled => "retry_scheduled",
			Self::OperatorRetry => "operator_retry",
			Self::CopyInterrupted => "copy_interrupted",
			Self::VerifyInterrupted => "verify_interrupted",
		};
		write!(f, "{name}")
	}
}

/// Progress record for one destination replica of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
	pub job_id: JobId,
	pub target_id: TargetId,
	pub copy_state: TargetCopyState,
	pub attempts: u32,
	/// Lowercase hex SHA-256 computed during the copy stream
	pub hash: Option<String>,
	pub temp_path: Option<PathBuf>,
	pub final_path: Option<PathBuf>,
	pub last_error: Option<String>,
	/// True when the permanent failure was a hash mismatch or sibling
	/// disagreement; drives quarantine instead of a plain job failure
	pub integrity_failure: bool,
	/// When the retry scheduler may hand this target back to the copier
	pub next_retry_at: Option<DateTime<Utc>>,
	pub last_transition_at: DateTime<Utc>,
}

impl TargetOutcome {
	pub fn pending(job_id: JobId, target_id: TargetId, final_path: PathBuf) -> Self {
		Self {
			job_id,
			target_id,
			copy_state: TargetCopyState::Pending,
			attempts: 0,
			hash: None,
			temp_path: None,
			final_path: Some(final_path),
			last_error: None,
			integrity_failure: false,
			next_retry_at: None,
			last_transition_at: Utc::now(),
		}
	}

	/// Apply an event, advancing the state machine
	pub fn apply(&mut self, event: TargetEvent) -> Result<TargetCopyState, InvalidTransition> {
		let next = self.copy_state.transition(event)?;
		self.copy_state = next;
		self.last_transition_at = Utc::now();
		Ok(next)
	}

	/// Record a failure reason alongside the transition
	pub fn fail(
		&mut self,
		event: TargetEvent,
		reason: impl Into<String>,
	) -> Result<TargetCopyState, InvalidTransition> {
		let next = self.apply(event)?;
		self.last_error = Some(reason.into());
		Ok(next)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn sample_outcome() -> TargetOutcome {
		TargetOutcome::pending(
			JobId::new(),
			TargetId::from("clinical"),
			PathBuf::from("/mnt/clinical/scan-001.svs"),
		)
	}

	#[test]
	fn copy_then_verify_path() {
		let mut outcome = sample_outcome();
		outcome.apply(TargetEvent::CopyStarted).unwrap();
		outcome.apply(TargetEvent::CopyFinished).unwrap();
		outcome.apply(TargetEvent::VerifyStarted).unwrap();
		outcome.apply(TargetEvent::VerifySucceeded).unwrap();
		assert_eq!(outcome.copy_state, TargetCopyState::Verified);
		assert!(outcome.copy_state.is_terminal());
	}

	#[test]
	fn retry_cycles_back_to_pending() {
		let mut outcome = sample_outcome();
		outcome.apply(TargetEvent::CopyStarted).unwrap();
		outcome
			.fail(TargetEvent::RetryableFailure, "disk hiccup")
			.unwrap();
		assert_eq!(outcome.copy_state, TargetCopyState::FailedRetryable);
		assert_eq!(outcome.last_error.as_deref(), Some("disk hiccup"));

		outcome.apply(TargetEvent::RetryScheduled).unwrap();
		assert_eq!(outcome.copy_state, TargetCopyState::Pending);
	}

	#[test]
	fn permanent_failure_is_terminal() {
		let mut outcome = sample_outcome();
		outcome.apply(TargetEvent::CopyStarted).unwrap();
		outcome
			.fail(TargetEvent::PermanentFailure, "access denied")
			.unwrap();
		assert!(outcome.apply(TargetEvent::RetryScheduled).is_err());
		assert!(outcome.apply(TargetEvent::CopyStarted).is_err());
	}

	#[test]
	fn operator_retry_reopens_a_permanent_failure() {
		let mut outcome = sample_outcome();
		outcome.copy_state = TargetCopyState::FailedPermanent;
		outcome.apply(TargetEvent::OperatorRetry).unwrap();
		assert_eq!(outcome.copy_state, TargetCopyState::Pending);
	}

	#[test]
	fn interrupted_verification_falls_back_to_copied() {
		let mut outcome = sample_outcome();
		outcome.copy_state = TargetCopyState::Verifying;
		outcome.apply(TargetEvent::VerifyInterrupted).unwrap();
		assert_eq!(outcome.copy_state, TargetCopyState::Copied);
	}

	#[test]
	fn pending_cannot_finish_copy() {
		let mut outcome = sample_outcome();
		assert!(outcome.apply(TargetEvent::CopyFinished).is_err());
	}
}
