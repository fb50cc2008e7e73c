//! Add the append-only state change log

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(StateChangeLog::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(StateChangeLog::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(StateChangeLog::JobId).text().not_null())
					.col(ColumnDef::new(StateChangeLog::EntityType).text().not_null())
					.col(ColumnDef::new(StateChangeLog::EntityId).text())
					.col(ColumnDef::new(StateChangeLog::OldState).text())
					.col(ColumnDef::new(StateChangeLog::NewState).text().not_null())
					.col(ColumnDef::new(StateChangeLog::Timestamp).timestamp().not_null())
					.col(ColumnDef::new(StateChangeLog::DurationMsSincePrev).big_integer())
					.col(ColumnDef::new(StateChangeLog::Context).json())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_state_change_log_job_id")
					.table(StateChangeLog::Table)
					.col(StateChangeLog::JobId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_state_change_log_entity")
					.table(StateChangeLog::Table)
					.col(StateChangeLog::JobId)
					.col(StateChangeLog::EntityType)
					.col(StateChangeLog::EntityId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_state_change_log_timestamp")
					.table(StateChangeLog::Table)
					.col(StateChangeLog::Timestamp)
					.to_owned(),
			)
			.await?;

		super::set_schema_version(manager, 2).await
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(StateChangeLog::Table).to_owned())
			.await
	}
}

#[derive(DeriveIden)]
enum StateChangeLog {
	Table,
	Id,
	JobId,
	EntityType,
	EntityId,
	OldState,
	NewState,
	Timestamp,
	DurationMsSincePrev,
	Context,
}
