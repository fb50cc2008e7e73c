//! Quarantine entries for integrity incidents

use super::{job::JobId, target::TargetId};
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Review status of a quarantine entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
	/// Awaiting operator review
	#[sea_orm(string_value = "active")]
	Active,
	/// Operator released the job back into the pipeline
	#[sea_orm(string_value = "released")]
	Released,
	/// Operator wrote the incident off; the job is failed
	#[sea_orm(string_value = "purged")]
	Purged,
}

impl fmt::Display for QuarantineStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Active => write!(f, "active"),
			Self::Released => write!(f, "released"),
			Self::Purged => write!(f, "purged"),
		}
	}
}

/// One row per integrity incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
	pub id: i32,
	pub job_id: JobId,
	pub source_path: PathBuf,
	/// Source hash the replicas were expected to match, when known
	pub expected_hash: Option<String>,
	pub reason: String,
	/// Targets whose replica disagreed with the source
	pub affected_targets: Vec<TargetId>,
	pub quarantined_at: DateTime<Utc>,
	pub status: QuarantineStatus,
	/// Operator identity recorded on release/purge
	pub reviewed_by: Option<String>,
	pub reviewed_at: Option<DateTime<Utc>>,
	pub review_reason: Option<String>,
}
