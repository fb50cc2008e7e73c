//! Journal migrations, forward-only
//!
//! Each migration runs in its own transaction and updates the
//! `DatabaseMetadata.SchemaVersion` row inside that same transaction.

use sea_orm::{DatabaseBackend, Statement};
use sea_orm_migration::prelude::*;

mod m20250601_000001_create_initial_tables;
mod m20250602_000001_add_state_change_log;

/// Schema version the newest migration leaves behind
pub const SCHEMA_VERSION: u32 = 2;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
	fn migrations() -> Vec<Box<dyn MigrationTrait>> {
		vec![
			Box::new(m20250601_000001_create_initial_tables::Migration),
			Box::new(m20250602_000001_add_state_change_log::Migration),
		]
	}
}

/// Upsert the schema version row from within a migration
pub(crate) async fn set_schema_version(
	manager: &SchemaManager<'_>,
	version: u32,
) -> Result<(), DbErr> {
	manager
		.get_connection()
		.execute(Statement::from_sql_and_values(
			DatabaseBackend::Sqlite,
			"INSERT INTO database_metadata (key, value) VALUES ('SchemaVersion', ?) \
			 ON CONFLICT(key) DO UPDATE SET value = ?",
			[version.to_string().into(), version.to_string().into()],
		))
		.await?;
	Ok(())
}
