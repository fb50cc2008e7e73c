//! Quarantine registry
//!
//! Entry creation is transactional with the owning job's transition into
//! `Quarantined`. Leaving quarantine happens only through the explicit
//! operator actions here, which record who acted and why.

use crate::domain::{
	Job, JobEvent, JobId, QuarantineEntry, QuarantineStatus, TargetCopyState, TargetId,
};
use crate::infrastructure::database::entities::{self, quarantine_entry, target_outcome};
use crate::shared::{ReplicatorError, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
	PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use std::path::PathBuf;
use tracing::info;

use super::{cas_update_job, job_not_found, job_repo::model_to_job, targets_to_json};

/// Filter for listing quarantine entries
#[derive(Debug, Clone, Default)]
pub struct QuarantineFilter {
	pub status: Option<QuarantineStatus>,
	pub since: Option<DateTime<Utc>>,
}

/// Aggregate counts over the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineStats {
	pub total: u64,
	pub active: u64,
	pub released: u64,
	pub purged: u64,
}

/// Append-only registry of integrity failures
#[derive(Clone)]
pub struct QuarantineStore {
	conn: DatabaseConnection,
}

impl QuarantineStore {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self { conn }
	}

	/// Move a job into quarantine and record the incident in one transaction
	///
	/// On any failure the in-memory job is rolled back so the caller can
	/// re-attempt later.
	pub async fn quarantine_job(
		&self,
		job: &mut Job,
		reason: impl Into<String>,
		affected_targets: Vec<TargetId>,
	) -> Result<QuarantineEntry> {
		let snapshot = job.clone();
		let reason = reason.into();

		let result = async {
			job.apply(JobEvent::IntegrityFailure)?;

			let txn = self.conn.begin().await?;
			cas_update_job(&txn, job).await?;

			let model = quarantine_entry::ActiveModel {
				job_id: Set(job.id.0),
				source_path: Set(job.source_path.display().to_string()),
				expected_hash: Set(job.source_hash.clone()),
				reason: Set(reason.clone()),
				affected_targets: Set(targets_to_json(&affected_targets)),
				quarantined_at: Set(Utc::now()),
				status: Set(QuarantineStatus::Active),
				reviewed_by: Set(None),
				reviewed_at: Set(None),
				review_reason: Set(None),
				..Default::default()
			}
			.insert(&txn)
			.await?;

			txn.commit().await?;
			Ok::<_, ReplicatorError>(model)
		}
		.await;

		match result {
			Ok(model) => {
				info!(
					job_id = %job.id,
					reason = %reason,
					"Job quarantined"
				);
				Ok(model_to_entry(model))
			}
			Err(e) => {
				*job = snapshot;
				Err(e)
			}
		}
	}

	/// Operator release: the job re-enters the pipeline
	///
	/// Affected target outcomes reset to `pending` with attempts zeroed; the
	/// job transitions `quarantined -> queued`. The source file is re-read
	/// from the original source directory on the next copy pass.
	pub async fn release(
		&self,
		entry_id: i32,
		by: impl Into<String>,
		reason: impl Into<String>,
	) -> Result<(QuarantineEntry, Job)> {
		self.review(entry_id, by.into(), reason.into(), QuarantineStatus::Released)
			.await
	}

	/// Operator purge: the incident is written off and the job fails
	pub async fn purge(
		&self,
		entry_id: i32,
		by: impl Into<String>,
		reason: impl Into<String>,
	) -> Result<(QuarantineEntry, Job)> {
		self.review(entry_id, by.into(), reason.into(), QuarantineStatus::Purged)
			.await
	}

	async fn review(
		&self,
		entry_id: i32,
		by: String,
		reason: String,
		resolution: QuarantineStatus,
	) -> Result<(QuarantineEntry, Job)> {
		let txn = self.conn.begin().await?;

		let entry = entities::QuarantineEntry::find_by_id(entry_id)
			.one(&txn)
			.await?
			.ok_or_else(|| ReplicatorError::NotFound(format!("quarantine entry {entry_id}")))?;
		if entry.status != QuarantineStatus::Active {
			return Err(ReplicatorError::config(format!(
				"quarantine entry {entry_id} is already {}",
				entry.status
			)));
		}

		let job_id = JobId(entry.job_id);
		let mut job = entities::Job::find_by_id(entry.job_id)
			.one(&txn)
			.await?
			.map(model_to_job)
			.ok_or_else(|| job_not_found(job_id))?;

		let event = match resolution {
			QuarantineStatus::Released => JobEvent::OperatorReleased,
			QuarantineStatus::Purged => JobEvent::OperatorPurged,
			QuarantineStatus::Active => unreachable!("review never re-activates"),
		};
		job.apply(event)?;
		cas_update_job(&txn, &mut job).await?;

		if resolution == QuarantineStatus::Released {
			let affected = super::targets_from_json(&entry.affected_targets);
			for target in &affected {
				entities::TargetOutcome::update_many()
					.filter(target_outcome::Column::JobId.eq(entry.job_id))
					.filter(target_outcome::Column::TargetId.eq(target.as_str()))
					.col_expr(
						target_outcome::Column::CopyState,
						Expr::value(TargetCopyState::Pending),
					)
					.col_expr(target_outcome::Column::Attempts, Expr::value(0))
					.col_expr(target_outcome::Column::Hash, Expr::value(Option::<String>::None))
					.col_expr(
						target_outcome::Column::TempPath,
						Expr::value(Option::<String>::None),
					)
					.col_expr(
						target_outcome::Column::LastError,
						Expr::value(Option::<String>::None),
					)
					.col_expr(target_outcome::Column::IntegrityFailure, Expr::value(false))
					.col_expr(
						target_outcome::Column::NextRetryAt,
						Expr::value(Option::<DateTime<Utc>>::None),
					)
					.col_expr(
						target_outcome::Column::LastTransitionAt,
						Expr::value(Utc::now()),
					)
					.exec(&txn)
					.await?;
			}
		}

		let now = Utc::now();
		let updated = quarantine_entry::ActiveModel {
			id: Set(entry.id),
			status: Set(resolution),
			reviewed_by: Set(Some(by.clone())),
			reviewed_at: Set(Some(now)),
			review_reason: Set(Some(reason.clone())),
			..Default::default()
		};
		let updated = entities::QuarantineEntry::update(updated).exec(&txn).await?;

		txn.commit().await?;

		info!(
			entry_id,
			job_id = %job.id,
			by = %by,
			resolution = %resolution,
			"Quarantine entry reviewed"
		);

		Ok((model_to_entry(updated), job))
	}

	pub async fn list(&self, filter: QuarantineFilter) -> Result<Vec<QuarantineEntry>> {
		let mut query = entities::QuarantineEntry::find();
		if let Some(status) = filter.status {
			query = query.filter(quarantine_entry::Column::Status.eq(status));
		}
		if let Some(since) = filter.since {
			query = query.filter(quarantine_entry::Column::QuarantinedAt.gte(since));
		}
		let models = query
			.order_by_desc(quarantine_entry::Column::QuarantinedAt)
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_entry).collect())
	}

	pub async fn find_active_for_job(&self, job_id: JobId) -> Result<Vec<QuarantineEntry>> {
		let models = entities::QuarantineEntry::find()
			.filter(quarantine_entry::Column::JobId.eq(job_id.0))
			.filter(quarantine_entry::Column::Status.eq(QuarantineStatus::Active))
			.all(&self.conn)
			.await?;
		Ok(models.into_iter().map(model_to_entry).collect())
	}

	pub async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<QuarantineStats> {
		let base = || {
			let mut query = entities::QuarantineEntry::find();
			if let Some(since) = since {
				query = query.filter(quarantine_entry::Column::QuarantinedAt.gte(since));
			}
			query
		};

		let total = base().count(&self.conn).await?;
		let active = base()
			.filter(quarantine_entry::Column::Status.eq(QuarantineStatus::Active))
			.count(&self.conn)
			.await?;
		let released = base()
			.filter(quarantine_entry::Column::Status.eq(QuarantineStatus::Released))
			.count(&self.conn)
			.await?;
		let purged = base()
			.filter(quarantine_entry::Column::Status.eq(QuarantineStatus::Purged))
			.count(&self.conn)
			.await?;

		Ok(QuarantineStats {
			total,
			active,
			released,
			purged,
		})
	}
}

fn model_to_entry(model: quarantine_entry::Model) -> QuarantineEntry {
	QuarantineEntry {
		id: model.id,
		job_id: JobId(model.job_id),
		source_path: PathBuf::from(model.source_path),
		expected_hash: model.expected_hash,
		reason: model.reason,
		affected_targets: super::targets_from_json(&model.affected_targets),
		quarantined_at: model.quarantined_at,
		status: model.status,
		reviewed_by: model.reviewed_by,
		reviewed_at: model.reviewed_at,
		review_reason: model.review_reason,
	}
}
