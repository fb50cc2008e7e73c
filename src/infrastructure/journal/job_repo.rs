//! Job repository

use crate::domain::{Job, JobId, JobState};
use crate::infrastructure::database::entities::{self, job};
use crate::shared::Result;
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
	QueryOrder,
};
use std::path::PathBuf;

use super::{cas_update_job, targets_from_json, targets_to_json};

/// CRUD and query-by-state over the `jobs` table
#[derive(Clone)]
pub struct JobRepository {
	conn: DatabaseConnection,
}

impl JobRepository {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self { conn }
	}

	/// Persist a freshly created job
	pub async fn insert(&self, job: &Job) -> Result<()> {
		job::ActiveModel {
			id: Set(job.id.0),
			source_path: Set(job.source_path.display().to_string()),
			initial_size: Set(job.initial_size as i64),
			source_hash: Set(job.source_hash.clone()),
			state: Set(job.state),
			required_targets: Set(targets_to_json(&job.required_targets)),
			created_at: Set(job.created_at),
			updated_at: Set(job.updated_at),
			version_token: Set(job.version_token),
		}
		.insert(&self.conn)
		.await?;
		Ok(())
	}

	/// Persist a mutation with optimistic concurrency
	///
	/// On `ConcurrencyConflict` the caller re-reads and retries the
	/// transition; the in-memory token is bumped only on success.
	pub async fn update(&self, job: &mut Job) -> Result<()> {
		cas_update_job(&self.conn, job).await
	}

	pub async fn find(&self, id: JobId) -> Result<Option<Job>> {
		let model = entities::Job::find_by_id(id.0).one(&self.conn).await?;
		Ok(model.map(model_to_job))
	}

	pub async fn find_by_state(&self, state: JobState) -> Result<Vec<Job>> {
		let models = entities::Job::find()
			.filter(job::Column::State.eq(state))
			.order_by_asc(job::Column::CreatedAt)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_job).collect())
	}

	/// Jobs the recovery path must resubmit
	pub async fn find_non_terminal(&self) -> Result<Vec<Job>> {
		let models = entities::Job::find()
			.filter(job::Column::State.is_not_in([
				JobState::Verified,
				JobState::Failed,
				JobState::Quarantined,
			]))
			.order_by_asc(job::Column::CreatedAt)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_job).collect())
	}

	/// The non-terminal job owning a source path, if any
	pub async fn find_active_by_source_path(&self, path: &PathBuf) -> Result<Option<Job>> {
		let model = entities::Job::find()
			.filter(job::Column::SourcePath.eq(path.display().to_string()))
			.filter(job::Column::State.is_not_in([
				JobState::Verified,
				JobState::Failed,
				JobState::Quarantined,
			]))
			.one(&self.conn)
			.await?;
		Ok(model.map(model_to_job))
	}

	/// Remove a job and, via cascade, its outcomes. Retention only.
	pub async fn delete(&self, id: JobId) -> Result<()> {
		entities::Job::delete_by_id(id.0).exec(&self.conn).await?;
		Ok(())
	}
}

pub(crate) fn model_to_job(model: job::Model) -> Job {
	Job {
		id: JobId(model.id),
		source_path: PathBuf::from(model.source_path),
		initial_size: model.initial_size as u64,
		source_hash: model.source_hash,
		state: model.state,
		required_targets: targets_from_json(&model.required_targets),
		created_at: model.created_at,
		updated_at: model.updated_at,
		version_token: model.version_token,
	}
}
