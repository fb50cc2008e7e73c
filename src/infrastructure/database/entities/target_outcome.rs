//! Target outcome table entity, keyed `(job_id, target_id)`

use crate::domain::TargetCopyState;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "target_outcomes")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub job_id: Uuid,

	#[sea_orm(primary_key, auto_increment = false)]
	pub target_id: String,

	#[sea_orm(indexed)]
	pub copy_state: TargetCopyState,

	pub attempts: i32,

	/// Lowercase hex SHA-256 computed during the copy stream
	pub hash: Option<String>,

	pub temp_path: Option<String>,
	pub final_path: Option<String>,

	pub last_error: Option<String>,

	/// Permanent failure was a hash mismatch or sibling disagreement
	pub integrity_failure: bool,

	#[sea_orm(indexed, nullable)]
	pub next_retry_at: Option<DateTimeUtc>,

	pub last_transition_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
