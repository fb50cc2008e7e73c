//! Event bus for decoupled communication
//!
//! Orchestrators publish onto a bounded broadcast channel; metrics and UI
//! collaborators subscribe. Publishers never hold subscriber lists.

use crate::domain::{JobId, JobState, TargetId};
use std::time::Duration;
use tokio::sync::broadcast;

/// Pipeline events
#[derive(Debug, Clone)]
pub enum PipelineEvent {
	/// A job moved between states
	JobStateChanged {
		job_id: JobId,
		old_state: JobState,
		new_state: JobState,
	},

	/// Periodic progress of one in-flight copy (cadence >= 1 s)
	CopyProgress {
		job_id: JobId,
		target_id: TargetId,
		bytes: u64,
		total_bytes: u64,
		bytes_per_second: u64,
		eta: Option<Duration>,
	},

	/// One target's copy attempt finished
	TargetCopyCompleted {
		job_id: JobId,
		target_id: TargetId,
		result: CopyCompletion,
	},

	/// One target's replica verified against the source hash
	TargetVerified {
		job_id: JobId,
		target_id: TargetId,
		duration: Duration,
	},

	/// The job was moved into quarantine
	JobQuarantined {
		job_id: JobId,
		entry_id: i32,
		affected_targets: Vec<TargetId>,
	},
}

/// Completion payload for `TargetCopyCompleted`
#[derive(Debug, Clone)]
pub enum CopyCompletion {
	Succeeded { hash: String, bytes: u64 },
	Failed { error: String, retryable: bool },
}

/// Event bus for broadcasting pipeline events
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
	/// Create a new event bus with specified capacity
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Emit an event; fine if nobody is listening
	pub fn emit(&self, event: PipelineEvent) {
		let _ = self.sender.send(event);
	}

	/// Subscribe to events
	pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(256)
	}
}
