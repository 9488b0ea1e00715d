//! Page-level entry point.
//!
//! [`PageFetcher::fetch_page`] turns a resolved tile source into one encoded
//! image. It picks the source's timing profile, runs the download under a
//! [`ProgressMonitor`], reads the container or pyramid, fetches missing tiles
//! and stitches the result. Failures come back as a [`PageFailure`] carrying
//! the error's classification, so the caller can render a placeholder.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{FetchError, PageError, PyramidError, StitchError};
use crate::format::container::{ContainerReader, ParsedContainer};
use crate::format::pyramid::{PyramidDescriptor, PyramidReader, TileNaming};
use crate::format::{detect_from_bytes, detect_from_url};
use crate::io::{destination_of, HttpSource};
use crate::monitor::{ProfileTable, ProgressMonitor, SourceProfile, DEFAULT_PROFILE};
use crate::resilience::{classify_page, Classification, ResilienceContext};
use crate::tile::{
    FetchedTile, SourceFormat, StitchSettings, StitchedImage, TileSourceDescriptor, TileStitcher,
};

use super::orchestrator::{TileFetchOrchestrator, TileSet};

/// Resolved configuration read by the fetch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    /// Concurrent tile downloads per page (default: 6)
    pub concurrency: usize,
    /// Retry ceiling per request; profiles may lower it (default: 3)
    pub max_retries: u32,
    pub stitch: StitchSettings,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 6,
            max_retries: 3,
            stitch: StitchSettings::default(),
        }
    }
}

/// Where a page's tiles come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSource {
    /// Single tiled container file
    Container { url: String },
    /// Pyramid descriptor, with an optional tile URL template and level
    Pyramid {
        descriptor_url: String,
        template: Option<String>,
        level: Option<u32>,
    },
    /// Decide from the URL, or from the downloaded bytes
    Auto { url: String },
}

impl PageSource {
    pub fn url(&self) -> &str {
        match self {
            PageSource::Container { url } | PageSource::Auto { url } => url,
            PageSource::Pyramid { descriptor_url, .. } => descriptor_url,
        }
    }
}

/// One encoded page.
#[derive(Debug, Clone, Serialize)]
pub struct PageImage {
    #[serde(skip)]
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: SourceFormat,
    pub tiles_total: usize,
    /// Tiles that could not be retrieved
    pub tiles_missing: usize,
    /// Tiles retrieved but not drawn
    pub tiles_skipped: usize,
    pub degraded: bool,
    pub clamped: bool,
}

impl PageImage {
    fn new(image: StitchedImage, format: SourceFormat, total: usize, missing: usize) -> Self {
        Self {
            data: image.data,
            width: image.width,
            height: image.height,
            format,
            tiles_total: total,
            tiles_missing: missing,
            tiles_skipped: image.tiles_skipped,
            degraded: image.degraded,
            clamped: image.clamped,
        }
    }
}

/// A page that could not be produced.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct PageFailure {
    #[source]
    pub error: PageError,
    pub classification: Classification,
    /// Best-effort image from the tiles that did arrive, if any
    pub partial: Option<PageImage>,
}

impl PageFailure {
    pub fn new(error: PageError) -> Self {
        Self {
            classification: classify_page(&error),
            error,
            partial: None,
        }
    }

    fn with_partial(mut self, partial: Option<PageImage>) -> Self {
        self.partial = partial;
        self
    }
}

impl From<PageError> for PageFailure {
    fn from(error: PageError) -> Self {
        PageFailure::new(error)
    }
}

/// Metadata of a source, without its tiles.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub descriptor: TileSourceDescriptor,
    pub columns: u32,
    pub rows: u32,
    pub tile_count: usize,
    /// Pyramid only
    pub max_level: Option<u32>,
    /// Container only: directory entries without data
    pub empty_tiles: usize,
}

/// Per-page state shared by the steps of one session.
struct Session<'a> {
    profile: SourceProfile,
    max_retries: u32,
    monitor: &'a ProgressMonitor,
    cancel: CancellationToken,
}

impl Session<'_> {
    fn headers(&self) -> &[(String, String)] {
        &self.profile.headers
    }

    /// Error for a session stopped early: a timeout if the monitor fired,
    /// otherwise an abort.
    fn interrupted(&self, completed: usize, total: usize) -> PageError {
        if self.monitor.timed_out() {
            PageError::SessionTimeout {
                completed,
                total,
                elapsed: self.monitor.elapsed(),
            }
        } else {
            PageError::Cancelled
        }
    }

    fn fetch_error(&self, error: FetchError) -> PageError {
        match error {
            FetchError::Cancelled => self.interrupted(0, 0),
            other => PageError::Fetch(other),
        }
    }

    fn pyramid_error(&self, error: PyramidError) -> PageError {
        match error {
            PyramidError::Fetch(FetchError::Cancelled) => self.interrupted(0, 0),
            other => PageError::Pyramid(other),
        }
    }
}

/// Produces page images from resolved tile sources.
#[derive(Clone)]
pub struct PageFetcher {
    http: Arc<dyn HttpSource>,
    resilience: Arc<ResilienceContext>,
    orchestrator: TileFetchOrchestrator,
    stitcher: TileStitcher,
    settings: FetchSettings,
    profiles: ProfileTable,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("settings", &self.settings)
            .field("stitcher", &self.stitcher)
            .finish_non_exhaustive()
    }
}

impl PageFetcher {
    pub fn new(
        http: Arc<dyn HttpSource>,
        resilience: Arc<ResilienceContext>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            orchestrator: TileFetchOrchestrator::new(
                Arc::clone(&http),
                Arc::clone(&resilience),
                settings.concurrency,
            ),
            stitcher: TileStitcher::detect(settings.stitch),
            http,
            resilience,
            settings,
            profiles: ProfileTable::builtin(),
        }
    }

    pub fn with_stitcher(mut self, stitcher: TileStitcher) -> Self {
        self.stitcher = stitcher;
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileTable) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn resilience(&self) -> &Arc<ResilienceContext> {
        &self.resilience
    }

    /// Fetch and stitch one page using the timing profile `profile`.
    pub async fn fetch_page(
        &self,
        source: &PageSource,
        profile: &str,
    ) -> Result<PageImage, PageFailure> {
        self.fetch_page_with_cancel(source, profile, &CancellationToken::new())
            .await
    }

    /// [`fetch_page`](Self::fetch_page) that also stops when `parent` is cancelled.
    pub async fn fetch_page_with_cancel(
        &self,
        source: &PageSource,
        profile: &str,
        parent: &CancellationToken,
    ) -> Result<PageImage, PageFailure> {
        let profile = self.profiles.lookup(profile);
        let max_retries = profile.retry_budget(self.settings.max_retries);
        let monitor = ProgressMonitor::with_parent(
            format!("Fetching {}", source.url()),
            profile.clone(),
            parent,
        );
        let cancel = monitor.start();
        let session = Session {
            profile,
            max_retries,
            monitor: &monitor,
            cancel,
        };

        let result = self.run(source, &session).await;
        match &result {
            Ok(page) => {
                monitor.complete();
                info!(
                    url = source.url(),
                    width = page.width,
                    height = page.height,
                    missing = page.tiles_missing,
                    degraded = page.degraded,
                    "Page ready"
                );
            }
            Err(failure) => {
                monitor.abort();
                warn!(
                    url = source.url(),
                    category = %failure.classification.category,
                    partial = failure.partial.is_some(),
                    error = %failure.error,
                    "Page failed"
                );
            }
        }
        result
    }

    /// Read a source's metadata without fetching its tiles.
    pub async fn inspect(&self, source: &PageSource) -> Result<SourceSummary, PageFailure> {
        let monitor = ProgressMonitor::new(
            format!("Inspecting {}", source.url()),
            self.profiles.lookup(DEFAULT_PROFILE),
        );
        let session = Session {
            profile: monitor.profile().clone(),
            max_retries: self.settings.max_retries,
            cancel: monitor.start(),
            monitor: &monitor,
        };

        let result = match self.resolve(source, &session).await {
            Ok(Resolved::Container(parsed)) => {
                let (_, empty) = parsed.split_tiles();
                Ok(summary(parsed.descriptor, None, empty.len()))
            }
            Ok(Resolved::Pyramid {
                pyramid,
                template,
                level,
            }) => naming(template.as_deref())
                .and_then(|naming| PyramidReader::new(naming).layout(source.url(), &pyramid, level))
                .map(|layout| summary(layout.descriptor, Some(layout.max_level), 0))
                .map_err(PageError::from),
            Err(e) => Err(e),
        };
        monitor.complete();
        result.map_err(PageFailure::new)
    }

    async fn run(
        &self,
        source: &PageSource,
        session: &Session<'_>,
    ) -> Result<PageImage, PageFailure> {
        match self.resolve(source, session).await? {
            Resolved::Container(parsed) => self.container_page(parsed, session).await,
            Resolved::Pyramid {
                pyramid,
                template,
                level,
            } => {
                self.pyramid_page(source.url(), pyramid, template.as_deref(), level, session)
                    .await
            }
        }
    }

    /// Download whatever `source` needs before tiles can be enumerated.
    async fn resolve(
        &self,
        source: &PageSource,
        session: &Session<'_>,
    ) -> Result<Resolved, PageError> {
        match source {
            PageSource::Container { url } => {
                let data = self.download(url, session).await?;
                self.parse_container(url, data, session)
            }
            PageSource::Pyramid {
                descriptor_url,
                template,
                level,
            } => {
                let pyramid = self.descriptor(descriptor_url, session).await?;
                Ok(Resolved::Pyramid {
                    pyramid,
                    template: template.clone(),
                    level: *level,
                })
            }
            PageSource::Auto { url } => match detect_from_url(url) {
                Some(SourceFormat::Container) => {
                    let data = self.download(url, session).await?;
                    self.parse_container(url, data, session)
                }
                Some(SourceFormat::Pyramid) => {
                    let pyramid = self.descriptor(url, session).await?;
                    Ok(Resolved::Pyramid {
                        pyramid,
                        template: None,
                        level: None,
                    })
                }
                None => {
                    let data = self.download(url, session).await?;
                    match detect_from_bytes(&data) {
                        Some(SourceFormat::Container) => self.parse_container(url, data, session),
                        Some(SourceFormat::Pyramid) => {
                            let pyramid = PyramidReader::parse_descriptor(url, &data)?;
                            Ok(Resolved::Pyramid {
                                pyramid,
                                template: None,
                                level: None,
                            })
                        }
                        None => Err(PageError::UnrecognizedSource { url: url.clone() }),
                    }
                }
            },
        }
    }

    async fn descriptor(
        &self,
        url: &str,
        session: &Session<'_>,
    ) -> Result<PyramidDescriptor, PageError> {
        session
            .monitor
            .update(0, Some(1), Some(&format!("Loading descriptor {}", url)));
        let pyramid = PyramidReader::fetch_descriptor(
            &*self.http,
            &self.resilience,
            url,
            session.headers(),
            &session.cancel,
        )
        .await
        .map_err(|e| session.pyramid_error(e))?;
        session.monitor.update(1, Some(1), None);
        Ok(pyramid)
    }

    async fn download(&self, url: &str, session: &Session<'_>) -> Result<Bytes, PageError> {
        let destination = destination_of(url)?;
        session
            .monitor
            .update(0, Some(1), Some(&format!("Downloading {}", url)));

        let http = &*self.http;
        let headers = session.headers();
        let data = self
            .resilience
            .call_with_retries(&destination, session.max_retries, &session.cancel, || {
                http.get(url, headers)
            })
            .await
            .map_err(|e| session.fetch_error(e))?;

        session.monitor.update(1, Some(1), None);
        Ok(data)
    }

    fn parse_container(
        &self,
        url: &str,
        data: Bytes,
        session: &Session<'_>,
    ) -> Result<Resolved, PageError> {
        let parsed = ContainerReader::parse(url, data)?;
        session.monitor.update(
            parsed.tiles.len() as u64,
            Some(parsed.tiles.len() as u64),
            Some("Container parsed"),
        );
        Ok(Resolved::Container(Box::new(parsed)))
    }

    async fn container_page(
        &self,
        parsed: Box<ParsedContainer>,
        session: &Session<'_>,
    ) -> Result<PageImage, PageFailure> {
        let (fetched, empty) = parsed.split_tiles();
        let total = parsed.tiles.len();
        if !empty.is_empty() {
            warn!(
                url = %parsed.descriptor.location,
                empty = empty.len(),
                total,
                "Container has tiles without data"
            );
        }

        let image = self
            .stitch(&parsed.descriptor, fetched, session)
            .await
            .map_err(PageFailure::new)?;
        Ok(PageImage::new(image, SourceFormat::Container, total, empty.len()))
    }

    async fn pyramid_page(
        &self,
        url: &str,
        pyramid: PyramidDescriptor,
        template: Option<&str>,
        level: Option<u32>,
        session: &Session<'_>,
    ) -> Result<PageImage, PageFailure> {
        let reader = PyramidReader::new(naming(template).map_err(PageError::from)?);
        let layout = reader
            .layout(url, &pyramid, level)
            .map_err(PageError::from)?;
        let total = layout.tiles.len();

        let tiles: TileSet = self
            .orchestrator
            .fetch_tiles(
                layout.tiles,
                session.headers(),
                session.max_retries,
                Some(session.monitor),
                &session.cancel,
            )
            .await;

        if tiles.cancelled {
            let error = session.interrupted(tiles.fetched.len(), total);
            let timed_out = matches!(error, PageError::SessionTimeout { .. });
            let partial = if tiles.fetched.is_empty() || !timed_out {
                None
            } else {
                let missing = tiles.missing.len();
                self.stitcher
                    .stitch(layout.descriptor.width, layout.descriptor.height, tiles.fetched)
                    .await
                    .ok()
                    .map(|image| PageImage::new(image, SourceFormat::Pyramid, total, missing))
            };
            return Err(PageFailure::new(error).with_partial(partial));
        }

        if tiles.fetched.is_empty() {
            let error = match tiles.last_error {
                Some(e) => PageError::Fetch(e),
                None => PageError::Stitch(StitchError::NoTiles),
            };
            return Err(PageFailure::new(error));
        }

        let missing = tiles.missing.len();
        if missing > 0 {
            warn!(url, missing, total, "Page has missing tiles, regions left blank");
        }
        let image = self
            .stitch(&layout.descriptor, tiles.fetched, session)
            .await
            .map_err(PageFailure::new)?;
        Ok(PageImage::new(image, SourceFormat::Pyramid, total, missing))
    }

    async fn stitch(
        &self,
        descriptor: &TileSourceDescriptor,
        tiles: Vec<FetchedTile>,
        session: &Session<'_>,
    ) -> Result<StitchedImage, PageError> {
        session
            .monitor
            .update(tiles.len() as u64, None, Some("Stitching tiles"));
        Ok(self
            .stitcher
            .stitch(descriptor.width, descriptor.height, tiles)
            .await?)
    }
}

enum Resolved {
    Container(Box<ParsedContainer>),
    Pyramid {
        pyramid: PyramidDescriptor,
        template: Option<String>,
        level: Option<u32>,
    },
}

fn naming(template: Option<&str>) -> Result<TileNaming, PyramidError> {
    match template {
        Some(template) => TileNaming::with_template(template),
        None => Ok(TileNaming::default()),
    }
}

fn summary(
    descriptor: TileSourceDescriptor,
    max_level: Option<u32>,
    empty_tiles: usize,
) -> SourceSummary {
    SourceSummary {
        columns: descriptor.columns(),
        rows: descriptor.rows(),
        tile_count: descriptor.tile_count(),
        descriptor,
        max_level,
        empty_tiles,
    }
}
