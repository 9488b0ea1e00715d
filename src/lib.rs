//! # tilestitch
//!
//! Retrieve extreme-resolution page images from remote tile servers and
//! stitch them into one full-resolution image.
//!
//! Digitized manuscripts are often published as thousands of small tiles,
//! either packed into a single tiled container file or exposed as a Deep Zoom
//! pyramid with one URL per tile. The servers behind them are frequently slow
//! and occasionally fail outright. This library downloads every tile of a page
//! through a resilient network layer and composites them into one JPEG.
//!
//! ## Features
//!
//! - **Two source shapes**: TIFF-family containers (classic and 64-bit
//!   offsets, shared JPEG tables) and Deep Zoom pyramids (XML or JSON
//!   descriptors, configurable tile URL templates)
//! - **Resilience**: per-host circuit breakers, exponential backoff with
//!   jitter, DNS caching and per-host connection reuse
//! - **Stall detection**: per-library timing profiles with stuck detection and
//!   hard timeouts that cancel in-flight downloads
//! - **Bounded memory**: batched compositing, canvas clamping and a
//!   first-tile fallback when the canvas cannot be allocated
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`io`] - HTTP transport behind the [`HttpSource`](io::HttpSource) trait
//! - [`resilience`] - Circuit breakers, retry policy, DNS cache, connection pool
//! - [`monitor`] - Progress monitoring and per-source timing profiles
//! - [`mod@format`] - Container and pyramid readers
//! - [`tile`] - Tile model, compositing and JPEG encoding
//! - [`fetch`] - Concurrent tile downloads and the page-level entry point
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilestitch::{
//!     FetchSettings, PageFetcher, PageSource, PooledHttpSource, ResilienceConfig, ResilienceContext,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let resilience = Arc::new(ResilienceContext::new(ResilienceConfig::default()));
//!     let http = Arc::new(PooledHttpSource::new(Arc::clone(&resilience)));
//!     let fetcher = PageFetcher::new(http, resilience, FetchSettings::default());
//!
//!     let source = PageSource::Auto {
//!         url: "https://images.example.org/ms/f001r.dzi".to_string(),
//!     };
//!     match fetcher.fetch_page(&source, "morgan").await {
//!         Ok(page) => println!("{}x{}", page.width, page.height),
//!         Err(failure) => eprintln!("{}", failure.classification.user_message),
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod io;
pub mod monitor;
pub mod resilience;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, Command, FetchArgs, InspectArgs, NetworkArgs, SourceKind};
pub use error::{ContainerError, FetchError, NetworkErrorKind, PageError, PyramidError, StitchError};
pub use fetch::{
    FetchSettings, PageFailure, PageFetcher, PageImage, PageSource, SourceSummary,
    TileFetchOrchestrator, TileSet,
};
pub use format::container::{ContainerReader, ParsedContainer};
pub use format::pyramid::{PyramidDescriptor, PyramidReader, TileNaming};
pub use format::{detect_from_bytes, detect_from_url, merge_jpeg_tables};
pub use io::{HttpSource, PooledHttpSource};
pub use monitor::{MonitorEvent, ProfileTable, ProgressMonitor, SourceProfile};
pub use resilience::{
    classify, classify_page, Classification, ErrorCategory, ResilienceConfig, ResilienceContext,
    RetryPolicy,
};
pub use tile::{
    FetchedTile, JpegPageEncoder, SourceFormat, StitchSettings, TileDescriptor,
    TileSourceDescriptor, TileStitcher,
};
