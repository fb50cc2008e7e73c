//! Quarantine registry entity

use crate::domain::QuarantineStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quarantine_entries")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,

	#[sea_orm(indexed)]
	pub job_id: Uuid,

	pub source_path: String,

	pub expected_hash: Option<String>,

	pub reason: String,

	/// JSON array of affected replica identities
	#[sea_orm(column_type = "Json")]
	pub affected_targets: Json,

	#[sea_orm(indexed)]
	pub quarantined_at: DateTimeUtc,

	#[sea_orm(indexed)]
	pub status: QuarantineStatus,

	pub reviewed_by: Option<String>,
	pub reviewed_at: Option<DateTimeUtc>,
	pub review_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
