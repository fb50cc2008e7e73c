//! Domain aggregates for the replication pipeline
//!
//! A [`Job`](job::Job) tracks one source file through discovery, copying,
//! verification and a terminal state. Each job owns one
//! [`TargetOutcome`](target::TargetOutcome) per destination replica. State
//! machines are closed enums; every transition goes through a single
//! `transition(current, event)` function so an illegal edge is a value-level
//! error, not a scattered guard.

pub mod job;
pub mod quarantine;
pub mod target;

pub use job::{Job, JobEvent, JobId, JobState};
pub use quarantine::{QuarantineEntry, QuarantineStatus};
pub use target::{TargetCopyState, TargetEvent, TargetId, TargetOutcome};

use thiserror::Error;

/// A state machine rejected the requested edge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity} in state {from} cannot apply {event}")]
pub struct InvalidTransition {
	pub entity: &'static str,
	pub from: String,
	pub event: String,
}

impl InvalidTransition {
	pub(crate) fn new(entity: &'static str, from: impl ToString, event: impl ToString) -> Self {
		Self {
			entity,
			from: from.to_string(),
			event: event.to_string(),
		}
	}
}
