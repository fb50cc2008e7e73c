//! Source directory watcher
//!
//! Thin wrapper over `notify`: raw file-system events become `PathEvent`s
//! on an mpsc channel. The watcher makes no stability promises; that is the
//! stability gate's job. Any mechanism producing `PathEvent`s can stand in
//! for this wrapper.

use crate::operations::copier::TEMP_SUFFIX;
use crate::shared::{ReplicatorError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEventKind {
	Created,
	Modified,
	Removed,
}

/// One ingress signal for the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
	pub path: PathBuf,
	pub kind: PathEventKind,
}

/// Watches the source directory and emits `PathEvent`s
pub struct SourceWatcher {
	// Kept alive for the lifetime of the subscription
	_watcher: RecommendedWatcher,
	rx: mpsc::Receiver<PathEvent>,
}

impl SourceWatcher {
	/// Start watching `dir` (top level only; sources arrive as flat files)
	pub fn watch(dir: &Path) -> Result<Self> {
		let (tx, rx) = mpsc::channel(1024);

		let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
			let event = match result {
				Ok(event) => event,
				Err(e) => {
					warn!("Watcher error: {e}");
					return;
				}
			};
			let kind = match event.kind {
				EventKind::Create(_) => PathEventKind::Created,
				EventKind::Modify(_) => PathEventKind::Modified,
				EventKind::Remove(_) => PathEventKind::Removed,
				_ => return,
			};
			for path in event.paths {
				if is_temp(&path) {
					continue;
				}
				// The notify callback runs on its own thread, so a
				// blocking send is safe; a full channel drops the event
				// and the startup scan or a later event picks it up.
				if tx.blocking_send(PathEvent {
					path: path.clone(),
					kind,
				})
				.is_err()
				{
					debug!(path = %path.display(), "Watcher channel closed; dropping event");
				}
			}
		})
		.map_err(|e| ReplicatorError::unknown(format!("cannot create watcher: {e}")))?;

		watcher
			.watch(dir, RecursiveMode::NonRecursive)
			.map_err(|e| ReplicatorError::unknown(format!("cannot watch {}: {e}", dir.display())))?;

		Ok(Self {
			_watcher: watcher,
			rx,
		})
	}

	/// Next event, or `None` once the watcher has shut down
	pub async fn next_event(&mut self) -> Option<PathEvent> {
		self.rx.recv().await
	}

	/// Hand out the raw receiver for `select!`-style consumers
	pub fn into_receiver(self) -> (RecommendedWatcher, mpsc::Receiver<PathEvent>) {
		(self._watcher, self.rx)
	}
}

/// Files already sitting in the source directory at startup
///
/// The watcher only reports changes; anything dropped while the process was
/// down is found here and fed through the same pipeline.
pub async fn scan_existing(dir: &Path) -> Result<Vec<PathEvent>> {
	let mut events = Vec::new();
	let mut entries = fs::read_dir(dir)
		.await
		.map_err(|e| ReplicatorError::from_io(e, dir))?;

	while let Some(entry) = entries
		.next_entry()
		.await
		.map_err(|e| ReplicatorError::from_io(e, dir))?
	{
		let path = entry.path();
		let file_type = entry
			.file_type()
			.await
			.map_err(|e| ReplicatorError::from_io(e, &path))?;
		if file_type.is_file() && !is_temp(&path) {
			events.push(PathEvent {
				path,
				kind: PathEventKind::Created,
			});
		}
	}

	Ok(events)
}

fn is_temp(path: &Path) -> bool {
	path.file_name()
		.and_then(|n| n.to_str())
		.map(|n| n.ends_with(TEMP_SUFFIX))
		.unwrap_or(false)
}
