//! Media format descriptors shared across the download pipeline.
//!
//! A [`Format`] pairs one audio and one video rendition of the same work.
//! The selection logic in [`select`] resolves a user-supplied constraint
//! (`max`, a human-readable size, or a literal rendition pair) against the
//! ascending-bitrate format list a protocol backend produced.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod select;
mod size;
mod table;

pub use select::{Selection, select_format, strip_archive};
pub use size::{human_size_format, human_size_parse, matches_human_size};
pub use table::render_table;

/// Errors produced while resolving a format selector.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FormatError {
    /// The selector does not identify any known format.
    #[error("unknown format `{selector}`")]
    Unknown { selector: String },

    /// No format fits under the requested size; the smallest available one
    /// is carried so the caller can suggest retrying with the force flag.
    #[error("smallest available format is larger than requested constraint")]
    Suggest { smallest: Box<Format> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Ogg,
    Opus,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Ogg => "ogg",
            AudioCodec::Opus => "opus",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        };
        f.write_str(s)
    }
}

/// One audio rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub id: String,
    pub codec: AudioCodec,
    /// Bits per second.
    pub bitrate: u64,
    pub samplerate: u64,
}

/// One video rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub id: String,
    pub codec: VideoCodec,
    /// Bits per second.
    pub bitrate: u64,
    pub width: u64,
    pub height: u64,
}

/// A downloadable (video, audio) pair.
///
/// `id` is `<video id>--<audio id>` with any `archive_` prefix stripped from
/// either side; it uniquely identifies the pair within one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub id: String,
    pub container: Container,
    pub audio: AudioFormat,
    pub video: VideoFormat,
    pub duration: Duration,
}

impl Format {
    /// File size estimate in bytes from total bitrate and duration.
    pub fn size_estimate(&self) -> u64 {
        let bits_per_second = self.audio.bitrate + self.video.bitrate;
        self.duration.as_secs() * bits_per_second / 8
    }

    /// Combined bitrate used for ordering listings.
    pub fn total_bitrate(&self) -> u64 {
        self.audio.bitrate + self.video.bitrate
    }
}
