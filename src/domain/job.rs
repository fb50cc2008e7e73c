//! Job aggregate and its state machine

use super::{target::TargetId, InvalidTransition};
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a replication job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for JobId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<Uuid> for JobId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl From<JobId> for Uuid {
	fn from(id: JobId) -> Self {
		id.0
	}
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	/// Seen by the watcher, stability confirmed, not yet scheduled
	#[sea_orm(string_value = "discovered")]
	Discovered,
	/// Waiting for the copy orchestrator
	#[sea_orm(string_value = "queued")]
	Queued,
	/// At least one target copy is in flight or awaiting retry
	#[sea_orm(string_value = "in_progress")]
	InProgress,
	/// All copies landed; verification pending or partially done
	#[sea_orm(string_value = "partial")]
	Partial,
	/// Every target verified against the source hash
	#[sea_orm(string_value = "verified")]
	Verified,
	/// All required targets failed permanently
	#[sea_orm(string_value = "failed")]
	Failed,
	/// Integrity failure; held for operator review
	#[sea_orm(string_value = "quarantined")]
	Quarantined,
}

impl JobState {
	/// Terminal states for the ordinary pipeline. Only an explicit operator
	/// release moves a job out of `Quarantined`.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Verified | Self::Failed | Self::Quarantined)
	}

	/// The single transition function for the job state machine
	pub fn transition(self, event: JobEvent) -> Result<JobState, InvalidTransition> {
		use JobEvent::*;
		use JobState::*;

		let next = match (self, event) {
			(Discovered, Enqueued) => Queued,
			(Queued, CopyStarted) => InProgress,
			// Recovery re-drives an interrupted job without re-queueing it
			(InProgress, CopyStarted) => InProgress,
			(InProgress, AllCopiesComplete) => Partial,
			(InProgress, IntegrityFailure) | (Partial, IntegrityFailure) => Quarantined,
			(InProgress, TargetsPermanentlyFailed) | (Partial, TargetsPermanentlyFailed) => Failed,
			(Partial, AllTargetsVerified) => Verified,
			(Quarantined, OperatorReleased) => Queued,
			(Quarantined, OperatorPurged) => Failed,
			(Failed, OperatorRequeued) => Queued,
			(from, event) => {
				return Err(InvalidTransition::new("job", from, event));
			}
		};
		Ok(next)
	}
}

impl fmt::Display for JobState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Discovered => write!(f, "discovered"),
			Self::Queued => write!(f, "queued"),
			Self::InProgress => write!(f, "in_progress"),
			Self::Partial => write!(f, "partial"),
			Self::Verified => write!(f, "verified"),
			Self::Failed => write!(f, "failed"),
			Self::Quarantined => write!(f, "quarantined"),
		}
	}
}

/// Events that drive the job state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
	Enqueued,
	CopyStarted,
	AllCopiesComplete,
	AllTargetsVerified,
	/// Every remaining target is terminal and at least one failed permanently
	TargetsPermanentlyFailed,
	IntegrityFailure,
	OperatorReleased,
	OperatorPurged,
	/// Operator-requested retry of a failed job
	OperatorRequeued,
}

impl fmt::Display for JobEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Enqueued => "enqueued",
			Self::CopyStarted => "copy_started",
			Self::AllCopiesComplete => "all_copies_complete",
			Self::AllTargetsVerified => "all_targets_verified",
			Self::TargetsPermanentlyFailed => "targets_permanently_failed",
			Self::IntegrityFailure => "integrity_failure",
			Self::OperatorReleased => "operator_released",
			Self::OperatorPurged => "operator_purged",
			Self::OperatorRequeued => "operator_requeued",
		};
		write!(f, "{name}")
	}
}

/// One replication job per discovered source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
	pub id: JobId,
	/// Absolute source path; unique among non-terminal jobs
	pub source_path: PathBuf,
	/// Byte length observed when stability was declared
	pub initial_size: u64,
	/// Lowercase hex SHA-256 of the source, populated once by the first
	/// successful copy stream
	pub source_hash: Option<String>,
	pub state: JobState,
	/// Destination replica identities, in priority order
	pub required_targets: Vec<TargetId>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	/// Monotonically increasing token bumped on every persisted mutation
	pub version_token: i64,
}

impl Job {
	/// Create a job for a freshly stable source file
	pub fn discovered(
		source_path: PathBuf,
		initial_size: u64,
		required_targets: Vec<TargetId>,
	) -> Self {
		let now = Utc::now();
		Self {
			id: JobId::new(),
			source_path,
			initial_size,
			source_hash: None,
			state: JobState::Discovered,
			required_targets,
			created_at: now,
			updated_at: now,
			version_token: 1,
		}
	}

	/// Apply an event, advancing the state machine
	pub fn apply(&mut self, event: JobEvent) -> Result<JobState, InvalidTransition> {
		let next = self.state.transition(event)?;
		self.state = next;
		self.updated_at = Utc::now();
		Ok(next)
	}

	/// Record the source hash. The hash is written exactly once; a second
	/// write with a different value is evidence of corruption.
	pub fn set_source_hash(&mut self, hash: String) -> Result<(), InvalidTransition> {
		match &self.source_hash {
			None => {
				self.source_hash = Some(hash);
				self.updated_at = Utc::now();
				Ok(())
			}
			Some(existing) if *existing == hash => Ok(()),
			Some(_) => Err(InvalidTransition::new(
				"job",
				self.state,
				"set_source_hash(conflicting value)",
			)),
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.state.is_terminal()
	}
}
