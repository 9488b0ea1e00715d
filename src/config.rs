//! Configuration management for tilestitch.
//!
//! This module provides the command-line interface:
//! - Subcommands via clap (`fetch`, `inspect`)
//! - Environment variables with `TILESTITCH_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use tilestitch::config::{Cli, Command};
//!
//! let cli = Cli::parse();
//! if let Command::Fetch(args) = cli.command {
//!     println!("Fetching {} with profile {}", args.url, args.profile);
//! }
//! ```
//!
//! # Environment Variables
//!
//! Network and stitching options can be set via environment variables with
//! the `TILESTITCH_` prefix:
//!
//! - `TILESTITCH_CONCURRENCY` - Concurrent tile downloads (default: 6)
//! - `TILESTITCH_RETRIES` - Retries per request (default: 3)
//! - `TILESTITCH_RETRY_BASE_DELAY_MS` - Base backoff delay (default: 1000)
//! - `TILESTITCH_RETRY_MAX_DELAY_MS` - Backoff ceiling (default: 30000)
//! - `TILESTITCH_REQUEST_TIMEOUT_SECS` - Whole-request timeout (default: 30)
//! - `TILESTITCH_MAX_CANVAS_EDGE` - Largest canvas edge in pixels (default: 16384)
//! - `TILESTITCH_JPEG_QUALITY` - Output JPEG quality (default: 90)
//! - `TILESTITCH_BATCH_SIZE` - Tiles decoded per compositing batch (default: 10)
//! - `TILESTITCH_BATCH_TIMEOUT_SECS` - Timeout per compositing batch (default: 30)
//! - `TILESTITCH_HEALTH_CHECK_HOST` - Host resolved by the health check
//! - `TILESTITCH_PROFILE` - Source timing profile (default: default)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::fetch::{FetchSettings, PageSource};
use crate::monitor::DEFAULT_PROFILE;
use crate::resilience::{PoolSettings, ResilienceConfig, RetryPolicy};
use crate::tile::{
    StitchSettings, DEFAULT_BATCH_SIZE, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_CANVAS_EDGE,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default number of concurrent tile downloads.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Default retries per request.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default base backoff delay in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default whole-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default compositing batch timeout in seconds.
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tilestitch - Retrieve and stitch extreme-resolution page images.
///
/// Downloads the tiles of one page from a tiled container or a Deep Zoom
/// pyramid, tolerating slow and failing servers, and writes a single JPEG.
#[derive(Parser, Debug, Clone)]
#[command(name = "tilestitch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download a page and write the stitched image.
    Fetch(FetchArgs),
    /// Print a source's geometry as JSON without downloading tiles.
    Inspect(InspectArgs),
}

/// How to interpret the source URL.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Decide from the URL, then from the downloaded bytes
    #[default]
    Auto,
    /// Single tiled container file
    Container,
    /// Deep Zoom pyramid descriptor
    Pyramid,
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Container or pyramid descriptor URL.
    pub url: String,

    /// Output file for the stitched JPEG.
    #[arg(short, long, default_value = "page.jpg")]
    pub output: PathBuf,

    /// How to interpret the URL.
    #[arg(long, value_enum, default_value_t = SourceKind::Auto)]
    pub format: SourceKind,

    /// Timing profile of the source library.
    #[arg(long, default_value = DEFAULT_PROFILE, env = "TILESTITCH_PROFILE")]
    pub profile: String,

    /// Tile URL template for pyramids (`{level}`, `{col}`, `{row}`, `{format}`).
    #[arg(long)]
    pub template: Option<String>,

    /// Pyramid level to stitch (defaults to the full-resolution level).
    #[arg(long)]
    pub level: Option<u32>,

    #[command(flatten)]
    pub network: NetworkArgs,
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Container or pyramid descriptor URL.
    pub url: String,

    /// How to interpret the URL.
    #[arg(long, value_enum, default_value_t = SourceKind::Auto)]
    pub format: SourceKind,

    #[command(flatten)]
    pub network: NetworkArgs,
}

/// Options shared by every command that talks to a server.
#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    // =========================================================================
    // Download Configuration
    // =========================================================================
    /// Concurrent tile downloads per page.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, env = "TILESTITCH_CONCURRENCY")]
    pub concurrency: usize,

    /// Retries per request after the first attempt.
    #[arg(long, default_value_t = DEFAULT_RETRIES, env = "TILESTITCH_RETRIES")]
    pub retries: u32,

    /// Base delay for exponential backoff, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_BASE_DELAY_MS, env = "TILESTITCH_RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single backoff delay, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_MAX_DELAY_MS, env = "TILESTITCH_RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    /// Whole-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS, env = "TILESTITCH_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Host resolved by the periodic health check.
    ///
    /// If not specified, health is derived from recent request outcomes.
    #[arg(long, env = "TILESTITCH_HEALTH_CHECK_HOST")]
    pub health_check_host: Option<String>,

    // =========================================================================
    // Stitching Configuration
    // =========================================================================
    /// Largest canvas edge in pixels; larger pages are cropped.
    #[arg(long, default_value_t = DEFAULT_MAX_CANVAS_EDGE, env = "TILESTITCH_MAX_CANVAS_EDGE")]
    pub max_canvas_edge: u32,

    /// Output JPEG quality (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "TILESTITCH_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Tiles decoded per compositing batch.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "TILESTITCH_BATCH_SIZE")]
    pub batch_size: usize,

    /// Timeout for one compositing batch, in seconds.
    #[arg(long, default_value_t = DEFAULT_BATCH_TIMEOUT_SECS, env = "TILESTITCH_BATCH_TIMEOUT_SECS")]
    pub batch_timeout_secs: u64,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Default for NetworkArgs {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            health_check_host: None,
            max_canvas_edge: DEFAULT_MAX_CANVAS_EDGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_secs: DEFAULT_BATCH_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl NetworkArgs {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be greater than 0".to_string());
        }

        if self.retry_base_delay_ms == 0 {
            return Err("retry_base_delay_ms must be greater than 0".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms must not be below retry_base_delay_ms".to_string());
        }

        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }

        if self.max_canvas_edge == 0 {
            return Err("max_canvas_edge must be greater than 0".to_string());
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }

        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        if self.batch_timeout_secs == 0 {
            return Err("batch_timeout_secs must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Settings for the page fetcher.
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            concurrency: self.concurrency,
            max_retries: self.retries,
            stitch: StitchSettings {
                max_canvas_edge: self.max_canvas_edge,
                jpeg_quality: self.jpeg_quality,
                batch_size: self.batch_size,
                batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            },
        }
    }

    /// Settings for the shared resilience context.
    pub fn resilience_config(&self) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy::new(
                self.retries,
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
            pool: PoolSettings {
                max_connections_per_host: self.concurrency,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                ..PoolSettings::default()
            },
            health_check_host: self.health_check_host.clone(),
            ..ResilienceConfig::default()
        }
    }
}

impl FetchArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("A source URL is required".to_string());
        }
        if self.format != SourceKind::Pyramid && (self.template.is_some() || self.level.is_some())
        {
            return Err("--template and --level require --format pyramid".to_string());
        }
        self.network.validate()
    }

    /// The page source described by the arguments.
    pub fn page_source(&self) -> PageSource {
        match self.format {
            SourceKind::Auto => PageSource::Auto {
                url: self.url.clone(),
            },
            SourceKind::Container => PageSource::Container {
                url: self.url.clone(),
            },
            SourceKind::Pyramid => PageSource::Pyramid {
                descriptor_url: self.url.clone(),
                template: self.template.clone(),
                level: self.level,
            },
        }
    }
}

impl InspectArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("A source URL is required".to_string());
        }
        self.network.validate()
    }

    pub fn page_source(&self) -> PageSource {
        let url = self.url.clone();
        match self.format {
            SourceKind::Auto => PageSource::Auto { url },
            SourceKind::Container => PageSource::Container { url },
            SourceKind::Pyramid => PageSource::Pyramid {
                descriptor_url: url,
                template: None,
                level: None,
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
