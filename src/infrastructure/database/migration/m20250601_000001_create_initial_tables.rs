//! Initial journal schema: jobs, target outcomes, quarantine, metadata

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Jobs::Table)
					.if_not_exists()
					.col(ColumnDef::new(Jobs::Id).text().not_null().primary_key())
					.col(ColumnDef::new(Jobs::SourcePath).text().not_null())
					.col(ColumnDef::new(Jobs::InitialSize).big_integer().not_null())
					.col(ColumnDef::new(Jobs::SourceHash).text())
					.col(ColumnDef::new(Jobs::State).text().not_null())
					.col(ColumnDef::new(Jobs::RequiredTargets).json().not_null())
					.col(ColumnDef::new(Jobs::CreatedAt).timestamp().not_null())
					.col(ColumnDef::new(Jobs::UpdatedAt).timestamp().not_null())
					.col(ColumnDef::new(Jobs::VersionToken).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_jobs_state")
					.table(Jobs::Table)
					.col(Jobs::State)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_jobs_source_path")
					.table(Jobs::Table)
					.col(Jobs::SourcePath)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(TargetOutcomes::Table)
					.if_not_exists()
					.col(ColumnDef::new(TargetOutcomes::JobId).text().not_null())
					.col(ColumnDef::new(TargetOutcomes::TargetId).text().not_null())
					.col(ColumnDef::new(TargetOutcomes::CopyState).text().not_null())
					.col(ColumnDef::new(TargetOutcomes::Attempts).integer().not_null())
					.col(ColumnDef::new(TargetOutcomes::Hash).text())
					.col(ColumnDef::new(TargetOutcomes::TempPath).text())
					.col(ColumnDef::new(TargetOutcomes::FinalPath).text())
					.col(ColumnDef::new(TargetOutcomes::LastError).text())
					.col(
						ColumnDef::new(TargetOutcomes::IntegrityFailure)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(TargetOutcomes::NextRetryAt).timestamp())
					.col(
						ColumnDef::new(TargetOutcomes::LastTransitionAt)
							.timestamp()
							.not_null(),
					)
					.primary_key(
						Index::create()
							.col(TargetOutcomes::JobId)
							.col(TargetOutcomes::TargetId),
					)
					.foreign_key(
						ForeignKey::create()
							.name("fk_target_outcomes_job")
							.from(TargetOutcomes::Table, TargetOutcomes::JobId)
							.to(Jobs::Table, Jobs::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_target_outcomes_copy_state")
					.table(TargetOutcomes::Table)
					.col(TargetOutcomes::CopyState)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_target_outcomes_next_retry_at")
					.table(TargetOutcomes::Table)
					.col(TargetOutcomes::NextRetryAt)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(QuarantineEntries::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(QuarantineEntries::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(QuarantineEntries::JobId).text().not_null())
					.col(ColumnDef::new(QuarantineEntries::SourcePath).text().not_null())
					.col(ColumnDef::new(QuarantineEntries::ExpectedHash).text())
					.col(ColumnDef::new(QuarantineEntries::Reason).text().not_null())
					.col(
						ColumnDef::new(QuarantineEntries::AffectedTargets)
							.json()
							.not_null(),
					)
					.col(
						ColumnDef::new(QuarantineEntries::QuarantinedAt)
							.timestamp()
							.not_null(),
					)
					.col(ColumnDef::new(QuarantineEntries::Status).text().not_null())
					.col(ColumnDef::new(QuarantineEntries::ReviewedBy).text())
					.col(ColumnDef::new(QuarantineEntries::ReviewedAt).timestamp())
					.col(ColumnDef::new(QuarantineEntries::ReviewReason).text())
					.foreign_key(
						ForeignKey::create()
							.name("fk_quarantine_entries_job")
							.from(QuarantineEntries::Table, QuarantineEntries::JobId)
							.to(Jobs::Table, Jobs::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_quarantine_entries_status")
					.table(QuarantineEntries::Table)
					.col(QuarantineEntries::Status)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(DatabaseMetadata::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(DatabaseMetadata::Key)
							.text()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(DatabaseMetadata::Value).text().not_null())
					.to_owned(),
			)
			.await?;

		super::set_schema_version(manager, 1).await
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(QuarantineEntries::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(TargetOutcomes::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Jobs::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(DatabaseMetadata::Table).to_owned())
			.await
	}
}

#[derive(DeriveIden)]
enum Jobs {
	Table,
	Id,
	SourcePath,
	InitialSize,
	SourceHash,
	State,
	RequiredTargets,
	CreatedAt,
	UpdatedAt,
	VersionToken,
}

#[derive(DeriveIden)]
enum TargetOutcomes {
	Table,
	JobId,
	TargetId,
	CopyState,
	Attempts,
	Hash,
	TempPath,
	FinalPath,
	LastError,
	IntegrityFailure,
	NextRetryAt,
	LastTransitionAt,
}

#[derive(DeriveIden)]
enum QuarantineEntries {
	Table,
	Id,
	JobId,
	SourcePath,
	ExpectedHash,
	Reason,
	AffectedTargets,
	QuarantinedAt,
	Status,
	ReviewedBy,
	ReviewedAt,
	ReviewReason,
}

#[derive(DeriveIden)]
enum DatabaseMetadata {
	Table,
	Key,
	Value,
}
