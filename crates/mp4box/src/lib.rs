//! ISOBMFF ("MP4") box codec for the download pipeline.
//!
//! This is not a general-purpose MP4 library. It models exactly the box
//! subset the pipeline touches — the `moov` sample-table family for
//! progressive output, the `moof` fragment family for segmented input, and
//! the `sidx`/`styp`/`udta` periphery — with raw passthrough for everything
//! else. Boxes decode into owned structs, can be freely mutated, and encode
//! back with recomputed sizes.

use std::io;

mod boxes;
mod combine;
mod file;
mod frag;
mod header;

pub use boxes::*;
pub use combine::{combine_init_segments, combine_media_segments};
pub use file::{Fragment, MdatBox, Mp4File, SegmentBlock};
pub use frag::{FragmentBuilder, FullSample, SampleSpan, traf_full_samples, traf_sample_spans};
pub use header::{BoxHeader, FourCC};

#[derive(Debug, thiserror::Error)]
pub enum Mp4Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed box structure: {reason}")]
    Parse { reason: String },

    #[error("unsupported construct: {reason}")]
    Unsupported { reason: String },
}

impl Mp4Error {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        Mp4Error::Parse {
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Mp4Error::Unsupported {
            reason: reason.into(),
        }
    }
}
