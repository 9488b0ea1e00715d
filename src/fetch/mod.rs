//! Tile fetching and the page-level entry point.
//!
//! - [`TileFetchOrchestrator`]: bounded-concurrency tile downloads through
//!   the resilience layer
//! - [`PageFetcher`]: resolves a [`PageSource`], runs the session under a
//!   progress monitor and returns a [`PageImage`] or a classified
//!   [`PageFailure`]

mod orchestrator;
mod page;

pub use orchestrator::{TileFetchOrchestrator, TileSet};
pub use page::{FetchSettings, PageFailure, PageFetcher, PageImage, PageSource, SourceSummary};
