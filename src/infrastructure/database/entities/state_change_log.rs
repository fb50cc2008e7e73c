//! Append-only audit trail of state transitions

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "state_change_log")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,

	#[sea_orm(indexed)]
	pub job_id: Uuid,

	/// "job" or "target"
	#[sea_orm(indexed)]
	pub entity_type: String,

	/// Target identity when `entity_type` is "target"
	pub entity_id: Option<String>,

	pub old_state: Option<String>,
	pub new_state: String,

	#[sea_orm(indexed)]
	pub timestamp: DateTimeUtc,

	/// Milliseconds since the previous row for the same entity
	pub duration_ms_since_prev: Option<i64>,

	#[sea_orm(column_type = "Json", nullable)]
	pub context: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
