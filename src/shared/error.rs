//! Error types shared across the replication pipeline

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T = ()> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur anywhere in the replication pipeline
#[derive(Debug, Error)]
pub enum ReplicatorError {
	/// A path that was expected to exist does not
	#[error("not found: {0}")]
	NotFound(String),

	/// The process lacks permission for the operation
	#[error("access denied: {0}")]
	AccessDenied(String),

	/// Generic I/O failure
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// Another process holds the file in a conflicting mode
	#[error("sharing violation: {0}")]
	Sharing(String),

	/// The operation exceeded its time budget
	#[error("timed out: {0}")]
	Timeout(String),

	/// A computed hash disagrees with the expected hash
	#[error("hash mismatch: expected {expected}, got {actual}")]
	HashMismatch { expected: String, actual: String },

	/// The configuration is invalid or incomplete
	#[error("configuration error: {0}")]
	Configuration(String),

	/// Replicas of the same source disagree with each other
	#[error("integrity violation: {0}")]
	IntegrityViolation(String),

	/// Optimistic concurrency check failed on a persisted aggregate
	#[error("concurrent update rejected for {entity} {id}")]
	ConcurrencyConflict { entity: &'static str, id: String },

	/// The operation was cancelled cooperatively
	#[error("operation cancelled")]
	Cancelled,

	/// Journal operation failed
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),

	/// A state machine rejected the requested transition
	#[error("{0}")]
	InvalidTransition(#[from] crate::domain::InvalidTransition),

	/// Anything we cannot classify more precisely
	#[error("{0}")]
	Unknown(String),
}

/// Coarse failure classification consumed by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Worth retrying after a delay
	Transient,
	/// Retrying cannot succeed
	Permanent,
	/// Evidence of corruption; quarantine, never retry
	Integrity,
	/// Cooperative cancellation; neither retried nor escalated
	Cancelled,
	/// Unclassifiable; the retry policy decides by attempt count
	Unknown,
}

impl fmt::Display for ErrorClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Transient => write!(f, "transient"),
			Self::Permanent => write!(f, "permanent"),
			Self::Integrity => write!(f, "integrity"),
			Self::Cancelled => write!(f, "cancelled"),
			Self::Unknown => write!(f, "unknown"),
		}
	}
}

impl ReplicatorError {
	/// Map an I/O error to the most specific variant, keeping the path
	pub fn from_io(err: io::Error, path: &Path) -> Self {
		match err.kind() {
			io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
			io::ErrorKind::PermissionDenied => Self::AccessDenied(path.display().to_string()),
			io::ErrorKind::TimedOut => Self::Timeout(path.display().to_string()),
			// Windows sharing violations surface as generic errors with
			// raw OS codes 32/33; other platforms report WouldBlock.
			io::ErrorKind::WouldBlock => Self::Sharing(path.display().to_string()),
			_ => Self::Io(err),
		}
	}

	/// Create a configuration error
	pub fn config<T: fmt::Display>(msg: T) -> Self {
		Self::Configuration(msg.to_string())
	}

	/// Create an unclassified error
	pub fn unknown<T: fmt::Display>(msg: T) -> Self {
		Self::Unknown(msg.to_string())
	}

	/// Classify this error for the retry policy
	pub fn class(&self) -> ErrorClass {
		match self {
			Self::NotFound(_) | Self::AccessDenied(_) | Self::Configuration(_) => {
				ErrorClass::Permanent
			}
			Self::InvalidTransition(_) => ErrorClass::Permanent,
			Self::HashMismatch { .. } | Self::IntegrityViolation { .. } => ErrorClass::Integrity,
			Self::Io(_) | Self::Sharing(_) | Self::Timeout(_) | Self::Database(_) => {
				ErrorClass::Transient
			}
			Self::ConcurrencyConflict { .. } => ErrorClass::Transient,
			Self::Cancelled => ErrorClass::Cancelled,
			Self::Unknown(_) => ErrorClass::Unknown,
		}
	}

	/// True when retrying can never succeed
	pub fn is_permanent(&self) -> bool {
		matches!(self.class(), ErrorClass::Permanent | ErrorClass::Integrity)
	}
}
