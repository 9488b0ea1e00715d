use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Network failure kinds recognised by the resilience layer.
///
/// Every kind except [`NetworkErrorKind::Other`] is "network-class" and counts
/// toward tripping a destination's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    Unreachable,
    Dns,
    Aborted,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::ConnectionReset => "connection reset",
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::Unreachable => "unreachable",
            NetworkErrorKind::Dns => "dns failure",
            NetworkErrorKind::Aborted => "aborted",
            NetworkErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors produced while fetching a single resource over HTTP
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// Transport-level failure before a status was received
    #[error("Network error ({kind}) fetching {url}: {message}")]
    Network {
        kind: NetworkErrorKind,
        url: String,
        message: String,
    },

    /// The destination's circuit breaker rejected the call
    #[error("Circuit breaker open for {destination}, retry in {}s", .retry_after.as_secs())]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },

    /// The owning session was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// URL could not be parsed or has no host
    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl FetchError {
    /// HTTP status code, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for timeouts, resets, refusals, unreachable hosts, DNS failures and aborts.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FetchError::Network { kind, .. } if *kind != NetworkErrorKind::Other
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Convert a transport error into a classified [`FetchError`].
    ///
    /// The error source chain is walked once here so that nothing downstream
    /// needs to inspect error messages again.
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            };
        }

        FetchError::Network {
            kind: network_kind(err),
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

fn network_kind(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }

    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return NetworkErrorKind::ConnectionReset,
                std::io::ErrorKind::Interrupted => return NetworkErrorKind::Aborted,
                _ => {}
            }
            // ENETUNREACH / EHOSTUNREACH
            if matches!(io.raw_os_error(), Some(101) | Some(113)) {
                return NetworkErrorKind::Unreachable;
            }
        }

        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetworkErrorKind::Dns;
        }

        source = inner.source();
    }

    if err.is_connect() {
        NetworkErrorKind::Unreachable
    } else {
        NetworkErrorKind::Other
    }
}

/// Errors that can occur when parsing a tiled container
#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    /// Invalid byte-order marker (not II or MM)
    #[error("Invalid byte-order marker: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid container version number
    #[error("Invalid container version: expected 42 (classic) or 43 (64-bit offsets), got {0}")]
    InvalidVersion(u16),

    /// 64-bit variant declares an offset size other than 8
    #[error("Invalid 64-bit offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// Buffer is too small for the structure being read
    #[error("Buffer too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Directory offset points outside the buffer
    #[error("Invalid directory offset: {0}")]
    InvalidIfdOffset(u64),

    /// Declared entry count does not fit in the remaining buffer
    #[error("Directory at offset {offset} declares {count} entries but only {available} bytes remain")]
    EntryCountMismatch { offset: u64, count: u64, available: u64 },

    /// Required tag is missing from the directory
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type, count or value
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unknown field type in a directory entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// An out-of-line value lies outside the buffer
    #[error("Value for {tag} out of bounds: {len} bytes at offset {offset}, buffer is {size} bytes")]
    ValueOutOfBounds {
        tag: &'static str,
        offset: u64,
        len: u64,
        size: u64,
    },

    /// A tile's byte range lies outside the buffer
    #[error("Tile {index} out of bounds: {length} bytes at offset {offset}, buffer is {size} bytes")]
    TileOutOfBounds {
        index: usize,
        offset: u64,
        length: u64,
        size: u64,
    },

    /// Tile grid is larger than a single page may have
    #[error("Tile grid of {columns}x{rows} exceeds the limit of {limit} tiles")]
    TooManyTiles { columns: u32, rows: u32, limit: u64 },

    /// Image uses strips instead of tiles
    #[error("Unsupported organization: image uses strips instead of tiles")]
    StripOrganization,
}

/// Errors that can occur when reading a Deep Zoom pyramid
#[derive(Debug, Clone, Error)]
pub enum PyramidError {
    /// Descriptor could not be downloaded
    #[error("Descriptor fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Descriptor is not well-formed XML
    #[error("Malformed XML descriptor: {0}")]
    Xml(String),

    /// Descriptor is not well-formed JSON
    #[error("Malformed JSON descriptor: {0}")]
    Json(String),

    /// Required element or attribute is missing
    #[error("Descriptor is missing {0}")]
    MissingElement(&'static str),

    /// Attribute present but not a valid value
    #[error("Invalid descriptor attribute {name}: {value:?}")]
    InvalidAttribute { name: &'static str, value: String },

    /// Requested level does not exist
    #[error("Level {level} out of range (max level is {max})")]
    LevelOutOfRange { level: u32, max: u32 },

    /// Level needs more tiles than a single page may have
    #[error("Level grid of {columns}x{rows} tiles exceeds the limit of {limit}")]
    TooManyTiles { columns: u32, rows: u32, limit: u64 },

    /// Custom tile URL template lacks a required placeholder
    #[error("Invalid tile URL template {0:?}: must contain {{level}}, {{col}} and {{row}}")]
    InvalidTemplate(String),
}

/// Errors that can occur while compositing tiles
#[derive(Debug, Clone, Error)]
pub enum StitchError {
    /// Requested canvas has a zero dimension
    #[error("Invalid canvas dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Canvas backing store could not be allocated
    #[error("Unable to allocate a {width}x{height} canvas")]
    CanvasAllocation { width: u32, height: u32 },

    /// No tiles were supplied
    #[error("No tiles to stitch")]
    NoTiles,

    /// Every tile failed to decode
    #[error("None of the {total} tiles could be decoded")]
    NoTilesDecoded { total: usize },

    /// Output encoding failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Fatal errors for one page request
#[derive(Debug, Clone, Error)]
pub enum PageError {
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Pyramid error: {0}")]
    Pyramid(#[from] PyramidError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Stitch error: {0}")]
    Stitch(#[from] StitchError),

    /// Hard maximum elapsed before the session finished
    #[error("Session timed out after {}s with {completed}/{total} tiles", .elapsed.as_secs())]
    SessionTimeout {
        completed: usize,
        total: usize,
        elapsed: Duration,
    },

    /// Neither the URL nor the downloaded bytes identify a known format
    #[error("Unrecognized tile source at {url}")]
    UnrecognizedSource { url: String },

    /// Caller aborted the session
    #[error("Session aborted")]
    Cancelled,
}
