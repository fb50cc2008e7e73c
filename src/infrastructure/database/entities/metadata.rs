//! Key/value metadata, including the schema version row

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Key of the row that records the applied schema version
pub const SCHEMA_VERSION_KEY: &str = "SchemaVersion";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "database_metadata")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub key: String,

	pub value: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
