//! Stall/timeout monitoring for fetch sessions, with per-source profiles.

mod profile;
mod session;

pub use profile::{ProfileTable, SourceProfile, DEFAULT_PROFILE};
pub use session::{MonitorEvent, ProgressMonitor, ProgressState};
