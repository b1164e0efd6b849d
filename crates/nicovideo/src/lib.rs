//! nicovideo protocol client: watch-page resolution, format listing and the
//! two content delivery strategies.
//!
//! A watch URL resolves to an [`ApiData`] descriptor embedded in the page.
//! Depending on the descriptor, bytes are obtained either over **DMC**
//! (a single ranged HTTP download kept alive by session heartbeats) or
//! **DMS** (segmented HLS-style delivery with AES-128-CBC encrypted chunks,
//! reassembled into a progressive MP4).

use std::io;
use std::sync::Arc;

use progress::Report;

mod api;
mod dmc;
mod dms;
mod download;
mod formats_list;
mod progress_loop;
mod session;
mod thumb;

pub use api::{ApiData, ApiSession, Client, ClientConfig, Credentials};
pub use download::{SaveOptions, sanitize_filename, save_filepath};
pub use thumb::ThumbInfo;

#[derive(Debug, thiserror::Error)]
pub enum NicoError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("no embedded api data on watch page")]
    NoApiData,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("session rejected ({status}): {message}")]
    SessionStatus { status: i64, message: String },

    #[error("unknown content delivery method")]
    UnknownDeliveryMethod,

    #[error("uneven audio/video streams: {audio} != {video}")]
    UnevenStreams { audio: usize, video: usize },

    #[error(transparent)]
    Format(#[from] formats::FormatError),

    #[error(transparent)]
    Hls(#[from] hls::HlsError),

    #[error(transparent)]
    Defragment(#[from] mp4_fix::DefragError),

    #[error(transparent)]
    Mp4(#[from] mp4box::Mp4Error),

    #[error("payload decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("download deadline exceeded")]
    DeadlineExceeded,
}

impl NicoError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        NicoError::Protocol {
            reason: reason.into(),
        }
    }

    /// Errors the worker retry policy must not retry: cancellation and
    /// deadline expiry, bad selectors, and deterministic assembly failures
    /// (mismatched streams, malformed containers, defragmenting).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NicoError::Format(formats::FormatError::Unknown { .. })
                | NicoError::Cancelled
                | NicoError::DeadlineExceeded
                | NicoError::UnevenStreams { .. }
                | NicoError::Defragment(_)
                | NicoError::Mp4(_)
        )
    }
}

pub(crate) type Reporter = Arc<dyn Report>;
