//! Sea-ORM entity definitions
//!
//! These map the replication aggregates to journal tables.

pub mod job;
pub mod metadata;
pub mod quarantine_entry;
pub mod state_change_log;
pub mod target_outcome;

pub use metadata::SCHEMA_VERSION_KEY;

// Re-export all entities
pub use job::Entity as Job;
pub use metadata::Entity as Metadata;
pub use quarantine_entry::Entity as QuarantineEntry;
pub use state_change_log::Entity as StateChangeLog;
pub use target_outcome::Entity as TargetOutcome;

// Re-export active models for easy access
pub use job::ActiveModel as JobActive;
pub use metadata::ActiveModel as MetadataActive;
pub use quarantine_entry::ActiveModel as QuarantineEntryActive;
pub use state_change_log::ActiveModel as StateChangeLogActive;
pub use target_outcome::ActiveModel as TargetOutcomeActive;
