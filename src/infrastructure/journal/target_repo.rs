//! Target outcome repository

use crate::domain::{JobId, TargetCopyState, TargetId, TargetOutcome};
use crate::infrastructure::database::entities::{self, target_outcome};
use crate::shared::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
	QueryOrder,
};
use std::path::PathBuf;

/// CRUD over the `target_outcomes` table, keyed `(job_id, target_id)`
#[derive(Clone)]
pub struct TargetOutcomeRepository {
	conn: DatabaseConnection,
}

impl TargetOutcomeRepository {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self { conn }
	}

	pub async fn insert(&self, outcome: &TargetOutcome) -> Result<()> {
		outcome_to_active(outcome).insert(&self.conn).await?;
		Ok(())
	}

	/// Persist the full mutable column set for one outcome
	pub async fn update(&self, outcome: &TargetOutcome) -> Result<()> {
		entities::TargetOutcome::update(outcome_to_active(outcome))
			.exec(&self.conn)
			.await?;
		Ok(())
	}

	pub async fn find(&self, job_id: JobId, target_id: &TargetId) -> Result<Option<TargetOutcome>> {
		let model = entities::TargetOutcome::find_by_id((job_id.0, target_id.as_str().to_string()))
			.one(&self.conn)
			.await?;
		Ok(model.map(model_to_outcome))
	}

	pub async fn find_for_job(&self, job_id: JobId) -> Result<Vec<TargetOutcome>> {
		let models = entities::TargetOutcome::find()
			.filter(target_outcome::Column::JobId.eq(job_id.0))
			.order_by_asc(target_outcome::Column::TargetId)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_outcome).collect())
	}

	pub async fn find_by_state(&self, state: TargetCopyState) -> Result<Vec<TargetOutcome>> {
		let models = entities::TargetOutcome::find()
			.filter(target_outcome::Column::CopyState.eq(state))
			.order_by_asc(target_outcome::Column::LastTransitionAt)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_outcome).collect())
	}

	/// Retryable failures whose scheduled retry time has arrived
	pub async fn find_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<TargetOutcome>> {
		let models = entities::TargetOutcome::find()
			.filter(target_outcome::Column::CopyState.eq(TargetCopyState::FailedRetryable))
			.filter(target_outcome::Column::NextRetryAt.lte(now))
			.order_by_asc(target_outcome::Column::NextRetryAt)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_outcome).collect())
	}
}

fn outcome_to_active(outcome: &TargetOutcome) -> target_outcome::ActiveModel {
	target_outcome::ActiveModel {
		job_id: Set(outcome.job_id.0),
		target_id: Set(outcome.target_id.as_str().to_string()),
		copy_state: Set(outcome.copy_state),
		attempts: Set(outcome.attempts as i32),
		hash: Set(outcome.hash.clone()),
		temp_path: Set(outcome.temp_path.as_ref().map(|p| p.display().to_string())),
		final_path: Set(outcome.final_path.as_ref().map(|p| p.display().to_string())),
		last_error: Set(outcome.last_error.clone()),
		integrity_failure: Set(outcome.integrity_failure),
		next_retry_at: Set(outcome.next_retry_at),
		last_transition_at: Set(outcome.last_transition_at),
	}
}

pub(crate) fn model_to_outcome(model: target_outcome::Model) -> TargetOutcome {
	TargetOutcome {
		job_id: JobId(model.job_id),
		target_id: TargetId::from(model.target_id),
		copy_state: model.copy_state,
		attempts: model.attempts as u32,
		hash: model.hash,
		temp_path: model.temp_path.map(PathBuf::from),
		final_path: model.final_path.map(PathBuf::from),
		last_error: model.last_error,
		integrity_failure: model.integrity_failure,
		next_retry_at: model.next_retry_at,
		last_transition_at: model.last_transition_at,
	}
}
