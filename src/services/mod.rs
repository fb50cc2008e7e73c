//! Background services

pub mod watcher;

pub use watcher::{PathEvent, PathEventKind, SourceWatcher};
