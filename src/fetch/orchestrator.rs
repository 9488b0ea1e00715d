//! Concurrent tile downloads.
//!
//! [`TileFetchOrchestrator`] downloads the tiles of one page with bounded
//! concurrency. Every request goes through the shared
//! [`ResilienceContext`] (breaker check, retries with backoff). A tile that
//! exhausts its retries is recorded as missing; it never fails the page.
//!
//! Tiles are spawned in index order and wait on a fair semaphore, so they
//! start in index order but may finish in any order.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::io::{destination_of, HttpSource};
use crate::monitor::ProgressMonitor;
use crate::resilience::{classify, ResilienceContext};
use crate::tile::{FetchedTile, TileDescriptor};

/// Outcome of fetching a page's tiles.
#[derive(Debug, Clone, Default)]
pub struct TileSet {
    /// Tiles retrieved, in completion order
    pub fetched: Vec<FetchedTile>,
    /// Indices of tiles not retrieved, ascending
    pub missing: Vec<usize>,
    /// Most recent per-tile failure, if any
    pub last_error: Option<FetchError>,
    /// True when the session was cancelled before every tile resolved
    pub cancelled: bool,
}

impl TileSet {
    pub fn total(&self) -> usize {
        self.fetched.len() + self.missing.len()
    }
}

/// Fetches pyramid tiles concurrently through the resilience layer.
#[derive(Clone)]
pub struct TileFetchOrchestrator {
    http: Arc<dyn HttpSource>,
    resilience: Arc<ResilienceContext>,
    concurrency: usize,
}

impl std::fmt::Debug for TileFetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileFetchOrchestrator")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl TileFetchOrchestrator {
    pub fn new(
        http: Arc<dyn HttpSource>,
        resilience: Arc<ResilienceContext>,
        concurrency: usize,
    ) -> Self {
        Self {
            http,
            resilience,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every tile, reporting progress to `monitor`.
    ///
    /// Returns once every tile is fetched or missing, or as soon as `cancel`
    /// fires. On cancellation all in-flight requests are aborted before
    /// returning and the unresolved tiles are reported missing.
    pub async fn fetch_tiles(
        &self,
        tiles: Vec<TileDescriptor>,
        headers: &[(String, String)],
        max_retries: u32,
        monitor: Option<&ProgressMonitor>,
        cancel: &CancellationToken,
    ) -> TileSet {
        let total = tiles.len();
        let all: Vec<usize> = tiles.iter().map(|t| t.index).collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let headers: Arc<[(String, String)]> = headers.into();
        let mut downloads = JoinSet::new();

        if let Some(monitor) = monitor {
            monitor.update(0, Some(total as u64), None);
        }

        for tile in tiles {
            let http = Arc::clone(&self.http);
            let resilience = Arc::clone(&self.resilience);
            let semaphore = Arc::clone(&semaphore);
            let headers = Arc::clone(&headers);
            let cancel = cancel.clone();

            downloads.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        fetch_tile(&*http, &resilience, &tile, &headers, max_retries, &cancel)
                            .await
                    }
                    Err(_) => Err(FetchError::Cancelled),
                };
                (tile, result)
            });
        }

        let mut set = TileSet::default();
        let mut resolved = 0u64;

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.cancelled = true;
                    break;
                }
                joined = downloads.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            resolved += 1;

            match joined {
                Ok((tile, Ok(data))) => set.fetched.push(FetchedTile {
                    descriptor: tile,
                    data,
                }),
                Ok((_, Err(FetchError::Cancelled))) => {
                    set.cancelled = true;
                }
                Ok((tile, Err(e))) => {
                    warn!(
                        tile = tile.index,
                        column = tile.column,
                        row = tile.row,
                        url = tile.url().unwrap_or_default(),
                        category = %classify(&e).category,
                        error = %e,
                        "Tile missing after retries"
                    );
                    set.last_error = Some(e);
                }
                Err(e) => {
                    warn!(error = %e, "Tile download task failed");
                }
            }

            if let Some(monitor) = monitor {
                monitor.update(resolved, Some(total as u64), None);
            }
        }

        if set.cancelled {
            downloads.abort_all();
            while downloads.join_next().await.is_some() {}
            debug!(
                fetched = set.fetched.len(),
                total, "Tile fetch cancelled, in-flight requests aborted"
            );
        }

        let fetched: HashSet<usize> = set.fetched.iter().map(|t| t.descriptor.index).collect();
        set.missing = all.into_iter().filter(|i| !fetched.contains(i)).collect();
        set.missing.sort_unstable();

        debug!(
            fetched = set.fetched.len(),
            missing = set.missing.len(),
            total,
            "Tile fetch finished"
        );
        set
    }
}

/// Fetch one tile with the destination's breaker and retry policy.
async fn fetch_tile(
    http: &dyn HttpSource,
    resilience: &ResilienceContext,
    tile: &TileDescriptor,
    headers: &[(String, String)],
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<Bytes, FetchError> {
    let url = tile.url().ok_or_else(|| FetchError::InvalidUrl {
        url: format!("tile {}", tile.index),
        message: "tile has no URL".to_string(),
    })?;
    let destination = destination_of(url)?;

    resilience
        .call_with_retries(&destination, max_retries, cancel, || http.get(url, headers))
        .await
}
