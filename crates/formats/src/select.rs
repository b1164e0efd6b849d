// Format selection against a user-supplied constraint.

use std::time::Duration;

use crate::size::{SIZE_SELECTOR, parse_parts};
use crate::{Format, FormatError};

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub audio_id: String,
    pub video_id: String,
    /// Index into the ascending-bitrate input list.
    pub index: usize,
    pub duration: Duration,
}

/// Strips the `archive_` rendition prefix if present.
pub fn strip_archive(id: &str) -> &str {
    id.strip_prefix("archive_").unwrap_or(id)
}

enum Constraint {
    Size { bytes: u64, force: bool },
    Literal(String),
}

fn parse_selector(selector: &str) -> Result<Constraint, FormatError> {
    match selector {
        "" | "max" | "inf" => {
            return Ok(Constraint::Size {
                bytes: u64::MAX,
                force: false,
            });
        }
        _ => {}
    }

    if let Some(caps) = SIZE_SELECTOR.captures(selector) {
        let bytes = parse_parts(&caps[1], &caps[2], 1024.0);
        if bytes == 0 {
            return Err(FormatError::Unknown {
                selector: selector.to_owned(),
            });
        }

        return Ok(Constraint::Size {
            bytes,
            force: &caps[3] == "!",
        });
    }

    let Some((video, audio)) = selector.split_once("--") else {
        return Err(FormatError::Unknown {
            selector: selector.to_owned(),
        });
    };

    Ok(Constraint::Literal(format!(
        "{}--{}",
        strip_archive(video),
        strip_archive(audio)
    )))
}

fn selection(formats: &[Format], index: usize) -> Selection {
    let f = &formats[index];

    Selection {
        audio_id: f.audio.id.clone(),
        video_id: f.video.id.clone(),
        index,
        duration: f.duration,
    }
}

/// Picks a format from the ascending-bitrate list `formats`.
///
/// Selector grammar:
/// - `""`, `"max"`, `"inf"`: the largest format.
/// - `<number>[bkmg]?[!]?`: the largest format whose size estimate fits
///   strictly under the given byte count; `!` falls back to the smallest
///   format when nothing fits, otherwise [`FormatError::Suggest`] carries
///   the smallest one.
/// - `vID--aID`: that exact pair (`archive_` prefixes are ignored).
pub fn select_format(formats: &[Format], selector: &str) -> Result<Selection, FormatError> {
    let constraint = parse_selector(selector)?;

    match constraint {
        Constraint::Literal(target) => {
            for i in (0..formats.len()).rev() {
                if formats[i].id == target {
                    return Ok(selection(formats, i));
                }
            }

            Err(FormatError::Unknown {
                selector: selector.to_owned(),
            })
        }
        Constraint::Size { bytes, force } => {
            for i in (0..formats.len()).rev() {
                if formats[i].size_estimate() < bytes {
                    return Ok(selection(formats, i));
                }
            }

            let Some(smallest) = formats.first() else {
                return Err(FormatError::Unknown {
                    selector: selector.to_owned(),
                });
            };

            if force {
                return Ok(selection(formats, 0));
            }

            Err(FormatError::Suggest {
                smallest: Box::new(smallest.clone()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioCodec, AudioFormat, Container, VideoCodec, VideoFormat};

    fn fmt(vid: &str, aid: &str, vbits: u64, abits: u64, secs: u64) -> Format {
        Format {
            id: format!("{}--{}", strip_archive(vid), strip_archive(aid)),
            container: Container::Mp4,
            audio: AudioFormat {
                id: aid.to_owned(),
                codec: AudioCodec::Aac,
                bitrate: abits,
                samplerate: 44100,
            },
            video: VideoFormat {
                id: vid.to_owned(),
                codec: VideoCodec::H264,
                bitrate: vbits,
                width: 1280,
                height: 720,
            },
            duration: Duration::from_secs(secs),
        }
    }

    // 1000 s at the given total bitrates: ~30 MB, ~80 MB, ~200 MB.
    fn ladder() -> Vec<Format> {
        vec![
            fmt("v-low", "a-low", 200_000, 40_000, 1000),
            fmt("v-mid", "a-mid", 600_000, 71_000, 1000),
            fmt("v-high", "archive_a-high", 1_600_000, 78_000, 1000),
        ]
    }

    #[test]
    fn max_returns_last() {
        let formats = ladder();
        let sel = select_format(&formats, "max").unwrap();
        assert_eq!(sel.index, formats.len() - 1);
        assert_eq!(sel.video_id, "v-high");

        for selector in ["", "inf"] {
            assert_eq!(select_format(&formats, selector).unwrap().index, 2);
        }
    }

    #[test]
    fn size_picks_largest_fitting() {
        let formats = ladder();
        let sel = select_format(&formats, "100M").unwrap();
        assert_eq!(sel.video_id, "v-mid");
    }

    #[test]
    fn size_below_smallest_suggests() {
        let formats = ladder();
        let err = select_format(&formats, "20M").unwrap_err();
        match err {
            FormatError::Suggest { smallest } => assert_eq!(smallest.video.id, "v-low"),
            other => panic!("expected suggest, got {other:?}"),
        }
    }

    #[test]
    fn force_falls_back_to_smallest() {
        let formats = ladder();
        let sel = select_format(&formats, "20M!").unwrap();
        assert_eq!(sel.index, 0);
        assert_eq!(sel.video_id, "v-low");
    }

    #[test]
    fn literal_matches_exactly_ignoring_archive_prefix() {
        let formats = ladder();
        let sel = select_format(&formats, "v-high--a-high").unwrap();
        assert_eq!(sel.audio_id, "archive_a-high");

        let sel = select_format(&formats, "archive_v-high--archive_a-high").unwrap();
        assert_eq!(sel.video_id, "v-high");

        assert!(matches!(
            select_format(&formats, "v-none--a-none"),
            Err(FormatError::Unknown { .. })
        ));
    }

    #[test]
    fn empty_list_is_unknown() {
        assert!(matches!(
            select_format(&[], "max"),
            Err(FormatError::Unknown { .. })
        ));
    }
}
