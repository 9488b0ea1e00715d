//! User-facing classification of fetch failures.

use std::fmt;

use serde::Serialize;

use crate::error::{FetchError, NetworkErrorKind, PageError};

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Likely to succeed if tried again later
    Temporary,
    /// Will not succeed without a change on the caller's side
    Permanent,
    /// Server asked us to slow down
    RateLimited,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate limited",
            ErrorCategory::Unknown => "unknown",
        })
    }
}

/// Category plus human-readable explanation and suggested next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub user_message: String,
    pub suggested_action: String,
}

impl Classification {
    fn new(category: ErrorCategory, user_message: &str, suggested_action: &str) -> Self {
        Self {
            category,
            user_message: user_message.to_string(),
            suggested_action: suggested_action.to_string(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category == ErrorCategory::Permanent
    }
}

/// Classify a single fetch failure.
pub fn classify(error: &FetchError) -> Classification {
    use ErrorCategory::*;

    match error {
        FetchError::Network { kind, .. } => match kind {
            NetworkErrorKind::Dns => Classification::new(
                Temporary,
                "The server address could not be resolved.",
                "Check your internet connection and try again in a few minutes.",
            ),
            NetworkErrorKind::Timeout => Classification::new(
                Temporary,
                "The server took too long to respond.",
                "The server may be busy. Try again later.",
            ),
            NetworkErrorKind::ConnectionReset => Classification::new(
                Temporary,
                "The connection was interrupted.",
                "Try again. If this persists, the server may be limiting connections.",
            ),
            NetworkErrorKind::ConnectionRefused => Classification::new(
                Temporary,
                "The server refused the connection.",
                "The server may be down for maintenance. Try again later.",
            ),
            NetworkErrorKind::Unreachable => Classification::new(
                Temporary,
                "The server could not be reached.",
                "Check your network connection and try again.",
            ),
            NetworkErrorKind::Aborted | NetworkErrorKind::Other => Classification::new(
                Unknown,
                "The transfer failed unexpectedly.",
                "Try again. If the problem persists, report it with the URL.",
            ),
        },
        FetchError::Http { status, .. } => match *status {
            401 | 403 => Classification::new(
                Permanent,
                "Access to this resource is forbidden.",
                "The resource may require authentication or be restricted.",
            ),
            404 | 410 => Classification::new(
                Permanent,
                "The resource was not found.",
                "Verify that the URL is correct and the resource still exists.",
            ),
            429 => Classification::new(
                RateLimited,
                "Too many requests were sent to the server.",
                "Wait a few minutes before trying again.",
            ),
            500..=599 => Classification::new(
                Temporary,
                "The server reported an internal error.",
                "Try again later.",
            ),
            _ => Classification::new(
                Unknown,
                "The server returned an unexpected response.",
                "Try again. If the problem persists, report it with the URL.",
            ),
        },
        FetchError::CircuitOpen { .. } => Classification::new(
            Temporary,
            "The server has been failing repeatedly and is temporarily skipped.",
            "Wait for the recovery period to pass and try again.",
        ),
        FetchError::InvalidUrl { .. } => Classification::new(
            Permanent,
            "The URL is not valid.",
            "Check the URL for typos.",
        ),
        FetchError::Cancelled => Classification::new(
            Unknown,
            "The request was cancelled.",
            "Start the download again.",
        ),
    }
}

/// Classify a page-level failure.
pub fn classify_page(error: &PageError) -> Classification {
    use ErrorCategory::*;

    match error {
        PageError::Fetch(e) => classify(e),
        PageError::Pyramid(crate::error::PyramidError::Fetch(e)) => classify(e),
        PageError::Container(_) | PageError::Pyramid(_) => Classification::new(
            Permanent,
            "The image data is malformed or in an unsupported layout.",
            "Report this page; it cannot be read as a tiled image.",
        ),
        PageError::UnrecognizedSource { .. } => Classification::new(
            Permanent,
            "The address does not point to a supported tiled image.",
            "Check that the URL points to a tiled container or a pyramid descriptor.",
        ),
        PageError::Stitch(_) => Classification::new(
            Permanent,
            "The page tiles could not be assembled into an image.",
            "Report this page; its tiles could not be decoded.",
        ),
        PageError::SessionTimeout { .. } => Classification::new(
            Temporary,
            "The download took longer than allowed.",
            "The server may be slow right now. Try again later.",
        ),
        PageError::Cancelled => Classification::new(
            Unknown,
            "The download was aborted.",
            "Start the download again.",
        ),
    }
}
