//! Durable journal of jobs, target outcomes, audit log and quarantine
//!
//! All repositories share one WAL-mode SQLite database. Writes are durable
//! before acknowledgement; the pipeline never acknowledges progress that is
//! not persisted. Job mutations go through a compare-and-swap on the
//! `version_token` column so concurrent writers detect each other.

use crate::domain::{Job, JobId, TargetId};
use crate::shared::{ReplicatorError, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::path::Path;
use std::sync::Arc;

use super::database::{entities, Database};

pub mod job_repo;
pub mod quarantine_store;
pub mod state_log;
pub mod target_repo;

pub use job_repo::JobRepository;
pub use quarantine_store::{QuarantineFilter, QuarantineStats, QuarantineStore};
pub use state_log::{EntityType, StateChange, StateChangeLog};
pub use target_repo::TargetOutcomeRepository;

/// Bundle of journal repositories over one database
pub struct Journal {
	db: Arc<Database>,
	pub jobs: JobRepository,
	pub targets: TargetOutcomeRepository,
	pub state_log: StateChangeLog,
	pub quarantine: QuarantineStore,
}

impl Journal {
	/// Open (or create) the journal and run pending migrations
	pub async fn open(path: &Path) -> Result<Self> {
		let db = Database::open(path).await?;
		db.migrate().await?;
		Ok(Self::from_database(Arc::new(db)))
	}

	/// In-memory journal for tests
	pub async fn open_in_memory() -> Result<Self> {
		let db = Database::open_in_memory().await?;
		db.migrate().await?;
		Ok(Self::from_database(Arc::new(db)))
	}

	fn from_database(db: Arc<Database>) -> Self {
		let conn = db.conn().clone();
		Self {
			jobs: JobRepository::new(conn.clone()),
			targets: TargetOutcomeRepository::new(conn.clone()),
			state_log: StateChangeLog::new(conn.clone()),
			quarantine: QuarantineStore::new(conn),
			db,
		}
	}

	pub fn database(&self) -> &Database {
		&self.db
	}
}

/// Compare-and-swap update of a job row over any connection-like handle
///
/// Succeeds iff the stored `version_token` still equals `job.version_token`;
/// on success the stored and in-memory tokens are bumped together. Only the
/// mutable columns travel: immutable identity fields never change after
/// insert.
pub(crate) async fn cas_update_job<C: ConnectionTrait>(conn: &C, job: &mut Job) -> Result<()> {
	let expected = job.version_token;
	let result = entities::Job::update_many()
		.filter(entities::job::Column::Id.eq(job.id.0))
		.filter(entities::job::Column::VersionToken.eq(expected))
		.col_expr(
			entities::job::Column::SourceHash,
			Expr::value(job.source_hash.clone()),
		)
		.col_expr(entities::job::Column::State, Expr::value(job.state))
		.col_expr(
			entities::job::Column::UpdatedAt,
			Expr::value(job.updated_at),
		)
		.col_expr(
			entities::job::Column::VersionToken,
			Expr::value(expected + 1),
		)
		.exec(conn)
		.await?;

	if result.rows_affected == 0 {
		return Err(ReplicatorError::ConcurrencyConflict {
			entity: "job",
			id: job.id.to_string(),
		});
	}

	job.version_token = expected + 1;
	Ok(())
}

pub(crate) fn targets_to_json(targets: &[TargetId]) -> serde_json::Value {
	serde_json::Value::Array(
		targets
			.iter()
			.map(|t| serde_json::Value::String(t.as_str().to_string()))
			.collect(),
	)
}

pub(crate) fn targets_from_json(value: &serde_json::Value) -> Vec<TargetId> {
	value
		.as_array()
		.map(|items| {
			items
				.iter()
				.filter_map(|v| v.as_str().map(TargetId::from))
				.collect()
		})
		.unwrap_or_default()
}

pub(crate) fn job_not_found(id: JobId) -> ReplicatorError {
	ReplicatorError::NotFound(format!("job {id}"))
}
