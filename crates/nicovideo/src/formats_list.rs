// Format enumeration: available audio x video renditions.

use std::time::Duration;

use formats::{AudioCodec, AudioFormat, Container, Format, VideoCodec, VideoFormat, strip_archive};

use crate::api::ApiData;

impl ApiData {
    /// Enumerates the downloadable (video, audio) pairs, ascending by total
    /// bitrate.
    pub fn list_formats(&self) -> Vec<Format> {
        let duration = Duration::from_secs(self.video.duration);

        let audios: Vec<AudioFormat> = self
            .media
            .audios()
            .iter()
            .filter(|a| a.is_available)
            .map(|a| AudioFormat {
                id: a.id.clone(),
                codec: AudioCodec::Aac,
                bitrate: a.bitrate(),
                samplerate: a.sampling_rate(),
            })
            .collect();

        let videos: Vec<VideoFormat> = self
            .media
            .videos()
            .iter()
            .filter(|v| v.is_available)
            .map(|v| VideoFormat {
                id: v.id.clone(),
                codec: VideoCodec::H264,
                bitrate: v.bitrate(),
                width: v.width(),
                height: v.height(),
            })
            .collect();

        let mut formats = Vec::with_capacity(videos.len() * audios.len());

        for video in &videos {
            for audio in &audios {
                formats.push(Format {
                    id: format!(
                        "{}--{}",
                        strip_archive(&video.id),
                        strip_archive(&audio.id)
                    ),
                    container: Container::Mp4,
                    audio: audio.clone(),
                    video: video.clone(),
                    duration,
                });
            }
        }

        formats.sort_by_key(Format::total_bitrate);
        formats
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{ApiAudioRendition, ApiData, ApiVideoRendition};

    fn data() -> ApiData {
        let mut data = ApiData::default();
        data.video.duration = 100;

        data.media.domand.videos = vec![
            ApiVideoRendition {
                id: "archive_video-high".into(),
                is_available: true,
                bitrate: 2_000_000,
                ..Default::default()
            },
            ApiVideoRendition {
                id: "video-low".into(),
                is_available: true,
                bitrate: 500_000,
                ..Default::default()
            },
            ApiVideoRendition {
                id: "video-broken".into(),
                is_available: false,
                bitrate: 9_000_000,
                ..Default::default()
            },
        ];
        data.media.domand.audios = vec![ApiAudioRendition {
            id: "audio-aac".into(),
            is_available: true,
            bitrate: 192_000,
            ..Default::default()
        }];

        data
    }

    #[test]
    fn cartesian_product_of_available_renditions() {
        let formats = data().list_formats();

        // Unavailable renditions are excluded; 2 videos x 1 audio remain.
        assert_eq!(formats.len(), 2);

        // Ascending total bitrate.
        assert_eq!(formats[0].id, "video-low--audio-aac");
        assert_eq!(formats[1].id, "video-high--audio-aac");

        // archive_ prefixes are stripped in the id but kept on renditions.
        assert_eq!(formats[1].video.id, "archive_video-high");

        assert_eq!(formats[0].duration.as_secs(), 100);
    }
}
