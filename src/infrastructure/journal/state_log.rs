//! Append-only state change log
//!
//! Appends are fire-and-forget for the pipeline: a failed append is logged
//! and swallowed, never blocking or failing a state transition.

use crate::domain::JobId;
use crate::infrastructure::database::entities::{self, state_change_log};
use crate::shared::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
	QueryOrder,
};
use tracing::warn;

/// Which aggregate a log row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
	Job,
	Target,
}

impl EntityType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Job => "job",
			Self::Target => "target",
		}
	}
}

/// One transition to record
#[derive(Debug, Clone)]
pub struct StateChange {
	pub job_id: JobId,
	pub entity_type: EntityType,
	/// Target identity when the entity is a target
	pub entity_id: Option<String>,
	pub old_state: Option<String>,
	pub new_state: String,
	pub context: Option<serde_json::Value>,
}

impl StateChange {
	pub fn job(job_id: JobId, old_state: impl ToString, new_state: impl ToString) -> Self {
		Self {
			job_id,
			entity_type: EntityType::Job,
			entity_id: None,
			old_state: Some(old_state.to_string()),
			new_state: new_state.to_string(),
			context: None,
		}
	}

	pub fn target(
		job_id: JobId,
		target_id: impl ToString,
		old_state: impl ToString,
		new_state: impl ToString,
	) -> Self {
		Self {
			job_id,
			entity_type: EntityType::Target,
			entity_id: Some(target_id.to_string()),
			old_state: Some(old_state.to_string()),
			new_state: new_state.to_string(),
			context: None,
		}
	}

	pub fn with_context(mut self, context: serde_json::Value) -> Self {
		self.context = Some(context);
		self
	}
}

/// Append-only audit trail over the `state_change_log` table
#[derive(Clone)]
pub struct StateChangeLog {
	conn: DatabaseConnection,
	enabled: bool,
}

impl StateChangeLog {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self { conn, enabled: true }
	}

	pub fn with_enabled(mut self, enabled: bool) -> Self {
		self.enabled = enabled;
		self
	}

	/// Append a row, deriving the per-entity duration from the previous row
	pub async fn append(&self, change: StateChange) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}

		let now = Utc::now();
		let prev = self.last_for_entity(&change).await?;
		let duration_ms = prev
			.map(|row| (now - row.timestamp).num_milliseconds())
			.filter(|ms| *ms >= 0);

		state_change_log::ActiveModel {
			job_id: Set(change.job_id.0),
			entity_type: Set(change.entity_type.as_str().to_string()),
			entity_id: Set(change.entity_id),
			old_state: Set(change.old_state),
			new_state: Set(change.new_state),
			timestamp: Set(now),
			duration_ms_since_prev: Set(duration_ms),
			context: Set(change.context),
			..Default::default()
		}
		.insert(&self.conn)
		.await?;
		Ok(())
	}

	/// Fire-and-forget append: failures are logged and swallowed
	pub async fn record(&self, change: StateChange) {
		let job_id = change.job_id;
		if let Err(e) = self.append(change).await {
			warn!(job_id = %job_id, "Failed to append state change log row: {e}");
		}
	}

	/// Full transition history of a job, oldest first
	pub async fn history(&self, job_id: JobId) -> Result<Vec<state_change_log::Model>> {
		let rows = entities::StateChangeLog::find()
			.filter(state_change_log::Column::JobId.eq(job_id.0))
			.order_by_asc(state_change_log::Column::Id)
			.all(&self.conn)
			.await?;
		Ok(rows)
	}

	/// Delete rows older than the cutoff; returns the number removed
	pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
		let result = entities::StateChangeLog::delete_many()
			.filter(state_change_log::Column::Timestamp.lt(cutoff))
			.exec(&self.conn)
			.await?;
		Ok(result.rows_affected)
	}

	async fn last_for_entity(
		&self,
		change: &StateChange,
	) -> Result<Option<state_change_log::Model>> {
		let mut query = entities::StateChangeLog::find()
			.filter(state_change_log::Column::JobId.eq(change.job_id.0))
			.filter(state_change_log::Column::EntityType.eq(change.entity_type.as_str()));
		query = match &change.entity_id {
			Some(id) => query.filter(state_change_log::Column::EntityId.eq(id.clone())),
			None => query.filter(state_change_log::Column::EntityId.is_null()),
		};
		let row = query
			.order_by_desc(state_change_log::Column::Id)
			.one(&self.conn)
			.await?;
		Ok(row)
	}
}
