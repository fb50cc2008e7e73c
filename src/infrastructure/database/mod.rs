//! Journal database over SQLite using SeaORM

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr, EntityTrait,
	Statement,
};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod entities;
pub mod migration;

/// Journal database handle
///
/// Writes are serialized by SQLite's WAL writer while readers proceed
/// concurrently; durability before acknowledgement comes from
/// `synchronous=NORMAL` under WAL.
pub struct Database {
	conn: DatabaseConnection,
}

impl Database {
	/// Open the journal at the given path, creating it if missing
	pub async fn open(path: &Path) -> Result<Self, DbErr> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;
		}

		let db_url = format!("sqlite://{}?mode=rwc", path.display());

		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(10)
			.min_connections(2)
			.connect_timeout(Duration::from_secs(8))
			.idle_timeout(Duration::from_secs(8))
			.sqlx_logging(false); // We'll use tracing instead

		let conn = SeaDatabase::connect(opt).await?;
		Self::apply_pragmas(&conn).await?;

		info!("Opened journal at {:?}", path);

		Ok(Self { conn })
	}

	/// In-memory journal for tests; a single connection keeps one database
	pub async fn open_in_memory() -> Result<Self, DbErr> {
		let mut opt = ConnectOptions::new("sqlite::memory:");
		opt.max_connections(1).sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		Self::apply_pragmas(&conn).await?;
		Ok(Self { conn })
	}

	async fn apply_pragmas(conn: &DatabaseConnection) -> Result<(), DbErr> {
		for pragma in [
			"PRAGMA journal_mode=WAL",
			"PRAGMA synchronous=NORMAL",
			"PRAGMA foreign_keys=ON",
			"PRAGMA busy_timeout=5000",
		] {
			conn.execute(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				pragma,
			))
			.await?;
		}
		// Throughput pragmas; failure here is not fatal
		for pragma in ["PRAGMA temp_store=MEMORY", "PRAGMA cache_size=-20000"] {
			let _ = conn
				.execute(Statement::from_string(
					sea_orm::DatabaseBackend::Sqlite,
					pragma,
				))
				.await;
		}
		Ok(())
	}

	/// Apply migrations with versions greater than the stored schema version
	pub async fn migrate(&self) -> Result<(), DbErr> {
		migration::Migrator::up(&self.conn, None).await?;
		info!(
			schema_version = migration::SCHEMA_VERSION,
			"Journal migrations completed"
		);
		Ok(())
	}

	/// Read the schema version recorded in `database_metadata`
	pub async fn schema_version(&self) -> Result<u32, DbErr> {
		let row = entities::Metadata::find_by_id(entities::SCHEMA_VERSION_KEY.to_string())
			.one(&self.conn)
			.await?;
		match row {
			Some(row) => row
				.value
				.parse()
				.map_err(|e| DbErr::Custom(format!("Bad SchemaVersion value: {}", e))),
			None => Ok(0),
		}
	}

	/// Get the database connection
	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}
}
