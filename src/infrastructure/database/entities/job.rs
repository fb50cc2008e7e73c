//! Job table entity

use crate::domain::JobState;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub id: Uuid,

	#[sea_orm(indexed)]
	pub source_path: String,

	pub initial_size: i64,

	pub source_hash: Option<String>,

	#[sea_orm(indexed)]
	pub state: JobState,

	/// Replica identities as a JSON array, in priority order
	#[sea_orm(column_type = "Json")]
	pub required_targets: Json,

	pub created_at: DateTimeUtc,
	pub updated_at: DateTimeUtc,

	/// Optimistic concurrency token; every persisted mutation bumps it
	pub version_token: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
