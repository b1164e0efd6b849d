// Thumbnail info endpoint: the metadata the publish path needs.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::api::html_unescape;
use crate::{Client, NicoError};

static TITLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<title>([^<]*)</title>").unwrap());
static WATCH_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<watch_url>([^<]*)</watch_url>").unwrap());
static LENGTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<length>([^<]*)</length>").unwrap());

/// Subset of the `getthumbinfo` response used when composing posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbInfo {
    pub video_id: String,
    pub title: String,
    pub watch_url: String,
    pub length: Duration,
}

/// Parses `h:mm:ss`-style colon durations, zero on malformed input.
fn parse_colon_duration(s: &str) -> Duration {
    let mut total = 0u64;
    let mut unit = 1u64;

    for part in s.split(':').rev() {
        let Ok(value) = part.parse::<u64>() else {
            return Duration::ZERO;
        };

        total += value * unit;
        unit *= 60;
    }

    Duration::from_secs(total)
}

impl Client {
    /// Fetches title, canonical URL and duration for a video id.
    pub async fn thumb_info(&self, video_id: &str) -> Result<ThumbInfo, NicoError> {
        let url = format!("{}{}", self.config.thumb_base, video_id);
        let body = self.get_text(&url).await?;

        let capture = |re: &Regex| {
            re.captures(&body)
                .and_then(|caps| caps.get(1))
                .map(|m| html_unescape(m.as_str()))
                .unwrap_or_default()
        };

        let length = parse_colon_duration(&capture(&LENGTH));

        Ok(ThumbInfo {
            video_id: video_id.to_owned(),
            title: capture(&TITLE),
            watch_url: capture(&WATCH_URL),
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_durations() {
        assert_eq!(parse_colon_duration("5:20"), Duration::from_secs(320));
        assert_eq!(parse_colon_duration("1:02:03"), Duration::from_secs(3723));
        assert_eq!(parse_colon_duration("45"), Duration::from_secs(45));
        assert_eq!(parse_colon_duration("bogus"), Duration::ZERO);
    }
}
