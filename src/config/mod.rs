//! Replicator configuration
//!
//! Loaded from a TOML file, validated before the pipeline starts. Every
//! tunable the orchestrators consume lives here; components receive the
//! config through their constructors, never through globals.

use crate::domain::TargetId;
use crate::shared::{ReplicatorError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// One destination replica root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestRoot {
	/// Replica identity (e.g. "clinical")
	pub id: String,
	/// Local mount point owned by this process
	pub path: PathBuf,
	/// Copy order when `parallel_copy_enabled` is off; lower runs first
	#[serde(default)]
	pub priority: i32,
}

/// Stability gate tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
	/// Seconds between stability probes
	pub check_interval_seconds: u64,
	/// Consecutive identical observations required
	pub consecutive_checks: u32,
	/// Minimum file age before it can be declared stable
	pub min_file_age_seconds: u64,
	/// Probe budget before giving up on a file
	pub max_checks: u32,
}

impl Default for StabilityConfig {
	fn default() -> Self {
		Self {
			check_interval_seconds: 5,
			consecutive_checks: 2,
			min_file_age_seconds: 10,
			max_checks: 60,
		}
	}
}

impl StabilityConfig {
	pub fn check_interval(&self) -> Duration {
		Duration::from_secs(self.check_interval_seconds)
	}

	pub fn min_file_age(&self) -> Duration {
		Duration::from_secs(self.min_file_age_seconds)
	}
}

/// Copy orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
	/// Concurrent copy operations allowed per destination
	pub max_concurrent_per_target: usize,
	/// Fan copies out in parallel; otherwise sequential by priority
	pub parallel_copy_enabled: bool,
	/// Holds outcomes in `copying` after a successful stream; corruption
	/// drills only, rejected in production unless the debug flag is set
	pub verification_delay_seconds: u64,
}

impl Default for CopyConfig {
	fn default() -> Self {
		Self {
			max_concurrent_per_target: 2,
			parallel_copy_enabled: true,
			verification_delay_seconds: 0,
		}
	}
}

/// Retry/backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
	pub max_attempts: u32,
	/// Exponential growth factor, must be > 1
	pub backoff_multiplier: f64,
	/// Delay ceiling in seconds
	pub max_backoff_seconds: u64,
	/// Symmetric jitter as a fraction of the nominal delay, 0..=1
	pub jitter_factor: f64,
	pub backoff_base_copy_seconds: u64,
	pub backoff_base_verify_seconds: u64,
	pub backoff_base_discovery_seconds: u64,
	pub backoff_base_stability_seconds: u64,
	pub backoff_base_database_seconds: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			backoff_multiplier: 2.0,
			max_backoff_seconds: 300,
			jitter_factor: 0.2,
			backoff_base_copy_seconds: 5,
			backoff_base_verify_seconds: 3,
			backoff_base_discovery_seconds: 2,
			backoff_base_stability_seconds: 10,
			backoff_base_database_seconds: 1,
		}
	}
}

/// Verification orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
	pub max_concurrent_verifications: usize,
	/// Seconds between sweeps over `partial` jobs
	pub scheduler_interval_seconds: u64,
}

impl Default for VerificationConfig {
	fn default() -> Self {
		Self {
			max_concurrent_verifications: 5,
			scheduler_interval_seconds: 30,
		}
	}
}

impl VerificationConfig {
	pub fn scheduler_interval(&self) -> Duration {
		Duration::from_secs(self.scheduler_interval_seconds)
	}
}

/// Audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeLogConfig {
	pub enabled: bool,
	pub retention_days: u32,
	/// Retention sweep runs only when explicitly enabled
	pub auto_cleanup: bool,
}

impl Default for StateChangeLogConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			retention_days: 90,
			auto_cleanup: false,
		}
	}
}

/// Debug overrides for drills and demo environments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
	/// Permit a non-zero `verification_delay_seconds`
	pub allow_verification_delay: bool,
	/// Leave verified source files in the input directory
	pub keep_source: bool,
}

/// Top-level replicator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
	/// Directory watched for incoming source files
	pub source_dir: PathBuf,
	/// Destination replica roots; production runs with two
	pub dest_roots: Vec<DestRoot>,
	/// Where corrupted replicas are archived for review
	pub quarantine_dir: PathBuf,
	/// Journal database and other runtime state
	pub data_dir: PathBuf,
	/// Seconds a copy may make no byte progress before the watchdog cancels it
	pub no_progress_timeout_seconds: u64,

	#[serde(default)]
	pub stability: StabilityConfig,
	#[serde(default)]
	pub copy: CopyConfig,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub verification: VerificationConfig,
	#[serde(default)]
	pub state_change_log: StateChangeLogConfig,
	#[serde(default)]
	pub debug: DebugConfig,
}

impl ReplicatorConfig {
	/// Load configuration from a TOML file
	pub fn load(path: &Path) -> Result<Self> {
		info!("Loading config from {:?}", path);
		let raw = fs::read_to_string(path)
			.map_err(|e| ReplicatorError::config(format!("cannot read {}: {e}", path.display())))?;
		let config: Self = toml::from_str(&raw)
			.map_err(|e| ReplicatorError::config(format!("cannot parse {}: {e}", path.display())))?;
		config.validate()?;
		Ok(config)
	}

	/// Save configuration to a TOML file
	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let raw = toml::to_string_pretty(self)
			.map_err(|e| ReplicatorError::config(format!("cannot serialize config: {e}")))?;
		fs::write(path, raw)?;
		info!("Saved config to {:?}", path);
		Ok(())
	}

	/// Reject configurations the pipeline cannot run safely with
	pub fn validate(&self) -> Result<()> {
		if self.dest_roots.is_empty() {
			return Err(ReplicatorError::config("at least one destination root is required"));
		}
		let mut ids: Vec<&str> = self.dest_roots.iter().map(|d| d.id.as_str()).collect();
		ids.sort_unstable();
		ids.dedup();
		if ids.len() != self.dest_roots.len() {
			return Err(ReplicatorError::config("destination root ids must be unique"));
		}
		if self.dest_roots.len() < 2 {
			warn!("Running with a single destination root; replicas will not be redundant");
		}
		if self.retry.backoff_multiplier <= 1.0 {
			return Err(ReplicatorError::config("backoff_multiplier must be > 1"));
		}
		if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
			return Err(ReplicatorError::config("jitter_factor must be within 0..=1"));
		}
		if self.retry.max_backoff_seconds == 0 {
			return Err(ReplicatorError::config("max_backoff_seconds must be > 0"));
		}
		for (name, base) in [
			("copy", self.retry.backoff_base_copy_seconds),
			("verify", self.retry.backoff_base_verify_seconds),
			("discovery", self.retry.backoff_base_discovery_seconds),
			("stability", self.retry.backoff_base_stability_seconds),
			("database", self.retry.backoff_base_database_seconds),
		] {
			if base == 0 {
				return Err(ReplicatorError::config(format!(
					"backoff base for {name} must be > 0"
				)));
			}
		}
		if self.stability.consecutive_checks == 0 {
			return Err(ReplicatorError::config("consecutive_checks must be >= 1"));
		}
		if self.copy.max_concurrent_per_target == 0 {
			return Err(ReplicatorError::config("max_concurrent_per_target must be >= 1"));
		}
		if self.verification.max_concurrent_verifications == 0 {
			return Err(ReplicatorError::config("max_concurrent_verifications must be >= 1"));
		}
		if self.copy.verification_delay_seconds > 0 && !self.debug.allow_verification_delay {
			return Err(ReplicatorError::config(
				"verification_delay_seconds is a test knob; set debug.allow_verification_delay to use it",
			));
		}
		Ok(())
	}

	/// Create the directories the pipeline writes into
	pub fn ensure_directories(&self) -> Result<()> {
		fs::create_dir_all(&self.source_dir)?;
		fs::create_dir_all(&self.quarantine_dir)?;
		fs::create_dir_all(&self.data_dir)?;
		for dest in &self.dest_roots {
			fs::create_dir_all(&dest.path)?;
		}
		Ok(())
	}

	/// Replica identities in declared priority order
	pub fn target_ids(&self) -> Vec<TargetId> {
		let mut roots: Vec<&DestRoot> = self.dest_roots.iter().collect();
		roots.sort_by_key(|d| d.priority);
		roots.iter().map(|d| TargetId::from(d.id.as_str())).collect()
	}

	/// Destination root for a replica identity
	pub fn dest_root(&self, target: &TargetId) -> Option<&DestRoot> {
		self.dest_roots.iter().find(|d| d.id == target.as_str())
	}

	pub fn journal_path(&self) -> PathBuf {
		self.data_dir.join("forker.db")
	}

	pub fn no_progress_timeout(&self) -> Duration {
		Duration::from_secs(self.no_progress_timeout_seconds)
	}

	pub fn verification_delay(&self) -> Option<Duration> {
		if self.copy.verification_delay_seconds > 0 {
			Some(Duration::from_secs(self.copy.verification_delay_seconds))
		} else {
			None
		}
	}

	/// A config rooted under `base`, used by tests and demos
	pub fn default_with_root(base: &Path) -> Self {
		Self {
			source_dir: base.join("input"),
			dest_roots: vec![
				DestRoot {
					id: "clinical".into(),
					path: base.join("clinical"),
					priority: 0,
				},
				DestRoot {
					id: "research".into(),
					path: base.join("research"),
					priority: 1,
				},
			],
			quarantine_dir: base.join("quarantine"),
			data_dir: base.join("data"),
			no_progress_timeout_seconds: 300,
			stability: StabilityConfig::default(),
			copy: CopyConfig::default(),
			retry: RetryConfig::default(),
			verification: VerificationConfig::default(),
			state_change_log: StateChangeLogConfig::default(),
			debug: DebugConfig::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_validates() {
		let config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		config.validate().unwrap();
		assert_eq!(config.target_ids().len(), 2);
	}

	#[test]
	fn verification_delay_requires_debug_flag() {
		let mut config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		config.copy.verification_delay_seconds = 10;
		assert!(config.validate().is_err());

		config.debug.allow_verification_delay = true;
		config.validate().unwrap();
	}

	#[test]
	fn multiplier_must_exceed_one() {
		let mut config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		config.retry.backoff_multiplier = 1.0;
		assert!(config.validate().is_err());
	}

	#[test]
	fn duplicate_dest_ids_rejected() {
		let mut config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		config.dest_roots[1].id = "clinical".into();
		assert!(config.validate().is_err());
	}

	#[test]
	fn target_ids_follow_priority_order() {
		let mut config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		config.dest_roots[0].priority = 5;
		let ids = config.target_ids();
		assert_eq!(ids[0].as_str(), "research");
		assert_eq!(ids[1].as_str(), "clinical");
	}

	#[test]
	fn round_trips_through_toml() {
		let config = ReplicatorConfig::default_with_root(Path::new("/tmp/forker"));
		let raw = toml::to_string_pretty(&config).unwrap();
		let parsed: ReplicatorConfig = toml::from_str(&raw).unwrap();
		assert_eq!(parsed.dest_roots.len(), 2);
		assert_eq!(parsed.retry.max_attempts, 5);
	}
}
