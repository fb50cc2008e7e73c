//! forkerd
//!
//! Replicator daemon and admin CLI.
//!
//! Usage:
//!   forkerd --config /etc/forker/forker.toml run
//!   forkerd --config forker.toml migrate
//!   forkerd --config forker.toml quarantine list
//!   forkerd --config forker.toml quarantine release 3 --by alice --reason "drive replaced"
//!   forkerd --config forker.toml retry-target <job-id> clinical

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forker_core::config::ReplicatorConfig;
use forker_core::domain::{JobId, QuarantineStatus, TargetId};
use forker_core::infrastructure::journal::QuarantineFilter;
use forker_core::services::watcher::{self, SourceWatcher};
use forker_core::{EventBus, Journal, PipelineMetrics, PipelineSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "forkerd", about = "Dual-target medical imaging file replicator")]
struct Cli {
	/// Path to the TOML configuration file
	#[arg(short, long, env = "FORKER_CONFIG", default_value = "forker.toml")]
	config: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the replication pipeline until interrupted
	Run,
	/// Apply pending journal migrations and exit
	Migrate,
	/// Inspect or review quarantined jobs
	Quarantine {
		#[command(subcommand)]
		action: QuarantineAction,
	},
	/// Manually retry a permanently failed target
	RetryTarget {
		/// Job identifier (UUID)
		job_id: Uuid,
		/// Replica identity (e.g. "clinical")
		target_id: String,
	},
}

#[derive(Subcommand)]
enum QuarantineAction {
	/// List quarantine entries
	List {
		/// Only show entries with this status
		#[arg(long, value_parser = parse_status)]
		status: Option<QuarantineStatus>,
	},
	/// Release an entry: the job re-enters the pipeline
	Release {
		entry_id: i32,
		#[arg(long)]
		by: String,
		#[arg(long)]
		reason: String,
	},
	/// Purge an entry: the job is failed for good
	Purge {
		entry_id: i32,
		#[arg(long)]
		by: String,
		#[arg(long)]
		reason: String,
	},
	/// Show aggregate quarantine counts
	Stats,
}

fn parse_status(raw: &str) -> std::result::Result<QuarantineStatus, String> {
	match raw {
		"active" => Ok(QuarantineStatus::Active),
		"released" => Ok(QuarantineStatus::Released),
		"purged" => Ok(QuarantineStatus::Purged),
		other => Err(format!("unknown status {other:?} (active|released|purged)")),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(env_filter).init();

	let cli = Cli::parse();
	let config = ReplicatorConfig::load(&cli.config)
		.with_context(|| format!("loading config from {}", cli.config.display()))?;

	match cli.command {
		Command::Run => run_pipeline(config).await,
		Command::Migrate => {
			Journal::open(&config.journal_path()).await?;
			info!("Journal is up to date");
			Ok(())
		}
		Command::Quarantine { action } => quarantine_admin(config, action).await,
		Command::RetryTarget { job_id, target_id } => {
			let supervisor = build_supervisor(&config).await?;
			supervisor
				.retry_target(JobId(job_id), &TargetId::from(target_id.as_str()))
				.await?;
			info!(%job_id, target_id, "Target requeued");
			Ok(())
		}
	}
}

async fn build_supervisor(config: &ReplicatorConfig) -> Result<Arc<PipelineSupervisor>> {
	config.ensure_directories()?;
	let mut journal = Journal::open(&config.journal_path()).await?;
	journal.state_log = journal
		.state_log
		.clone()
		.with_enabled(config.state_change_log.enabled);
	Ok(Arc::new(PipelineSupervisor::new(
		Arc::new(config.clone()),
		Arc::new(journal),
		EventBus::default(),
		Arc::new(PipelineMetrics::default()),
	)))
}

async fn run_pipeline(config: ReplicatorConfig) -> Result<()> {
	let supervisor = build_supervisor(&config).await?;

	// Bridge the watcher and the startup scan into one discovery channel
	let (tx, rx) = mpsc::channel(1024);
	for event in watcher::scan_existing(&config.source_dir).await? {
		let _ = tx.send(event).await;
	}
	let mut source_watcher = SourceWatcher::watch(&config.source_dir)?;
	let forwarder = tokio::spawn(async move {
		while let Some(event) = source_watcher.next_event().await {
			if tx.send(event).await.is_err() {
				break;
			}
		}
	});

	// Ctrl-C requests a clean shutdown: in-flight copies cancel and remove
	// their temp files, then the journal is flushed on drop
	let shutdown_handle = supervisor.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupt received; shutting down");
			shutdown_handle.shutdown();
		}
	});

	let result = supervisor.clone().run(rx).await;
	forwarder.abort();
	result?;
	Ok(())
}

async fn quarantine_admin(config: ReplicatorConfig, action: QuarantineAction) -> Result<()> {
	match action {
		QuarantineAction::List { status } => {
			let journal = Journal::open(&config.journal_path()).await?;
			let entries = journal
				.quarantine
				.list(QuarantineFilter {
					status,
					since: None,
				})
				.await?;
			if entries.is_empty() {
				println!("No quarantine entries");
				return Ok(());
			}
			for entry in entries {
				println!(
					"#{} [{}] job {} {}: {} (targets: {})",
					entry.id,
					entry.status,
					entry.job_id,
					entry.quarantined_at.format("%Y-%m-%d %H:%M:%S"),
					entry.reason,
					entry
						.affected_targets
						.iter()
						.map(|t| t.to_string())
						.collect::<Vec<_>>()
						.join(", "),
				);
			}
			Ok(())
		}
		QuarantineAction::Release {
			entry_id,
			by,
			reason,
		} => {
			let supervisor = build_supervisor(&config).await?;
			let job = supervisor.release_quarantine(entry_id, &by, &reason).await?;
			info!(entry_id, job_id = %job.id, state = %job.state, "Quarantine released");
			Ok(())
		}
		QuarantineAction::Purge {
			entry_id,
			by,
			reason,
		} => {
			let supervisor = build_supervisor(&config).await?;
			supervisor.purge_quarantine(entry_id, &by, &reason).await?;
			info!(entry_id, "Quarantine entry purged");
			Ok(())
		}
		QuarantineAction::Stats => {
			let journal = Journal::open(&config.journal_path()).await?;
			let stats = journal.quarantine.stats(None).await?;
			println!(
				"total: {}  active: {}  released: {}  purged: {}",
				stats.total, stats.active, stats.released, stats.purged
			);
			Ok(())
		}
	}
}
