//! HLS playlist handling for segmented downloads.
//!
//! The master playlist yields one audio rendition URI, one video variant
//! URI and the advertised average bandwidth; each media playlist yields a
//! chunk plan: an init chunk from `#EXT-X-MAP`, media chunks in playlist
//! order, and the AES-128-CBC key/IV they are encrypted with.

use m3u8_rs::{AlternativeMediaType, KeyMethod, Playlist};

mod decrypt;

pub use decrypt::SegmentDecryptor;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HlsError {
    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },
}

pub(crate) fn playlist_error(reason: impl Into<String>) -> HlsError {
    HlsError::Playlist {
        reason: reason.into(),
    }
}

/// Streams selected out of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSelection {
    pub audio_url: String,
    pub video_url: String,
    /// `AVERAGE-BANDWIDTH` of the selected variant, bits per second.
    pub average_bandwidth: u64,
}

/// Picks the audio rendition and the video variant out of a master
/// playlist.
pub fn parse_master(data: &[u8]) -> Result<MasterSelection, HlsError> {
    let playlist = m3u8_rs::parse_playlist_res(data)
        .map_err(|e| playlist_error(format!("master playlist: {e:?}")))?;

    let Playlist::MasterPlaylist(master) = playlist else {
        return Err(playlist_error("expected a master playlist"));
    };

    let audio_url = master
        .alternatives
        .iter()
        .find(|alt| alt.media_type == AlternativeMediaType::Audio)
        .and_then(|alt| alt.uri.clone())
        .ok_or_else(|| playlist_error("master playlist without an audio rendition"))?;

    let variant = master
        .variants
        .iter()
        .find(|v| !v.is_i_frame)
        .ok_or_else(|| playlist_error("master playlist without a video variant"))?;

    Ok(MasterSelection {
        audio_url,
        video_url: variant.uri.clone(),
        average_bandwidth: variant.average_bandwidth.unwrap_or(variant.bandwidth),
    })
}

/// One downloadable chunk of a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub url: String,
    /// Init chunks are written as-is; media chunks may need decryption.
    pub is_init: bool,
}

/// AES-128-CBC key reference shared by every media chunk of one playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub url: String,
    pub iv: [u8; 16],
}

/// A media playlist reduced to its downloadable chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Init chunk first when the playlist carries `#EXT-X-MAP`.
    pub chunks: Vec<MediaChunk>,
    pub key: Option<KeySpec>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Extracts the chunk plan from a media playlist.
pub fn parse_media(data: &[u8]) -> Result<ChunkPlan, HlsError> {
    let playlist = m3u8_rs::parse_playlist_res(data)
        .map_err(|e| playlist_error(format!("media playlist: {e:?}")))?;

    let Playlist::MediaPlaylist(media) = playlist else {
        return Err(playlist_error("expected a media playlist"));
    };

    let mut chunks = Vec::with_capacity(media.segments.len() + 1);
    let mut key = None;

    for segment in &media.segments {
        if let Some(map) = &segment.map {
            chunks.push(MediaChunk {
                url: map.uri.clone(),
                is_init: true,
            });
        }

        if let Some(seg_key) = &segment.key
            && key.is_none()
        {
            if seg_key.method != KeyMethod::AES128 {
                return Err(playlist_error(format!(
                    "unsupported key method {:?}",
                    seg_key.method
                )));
            }

            let url = seg_key
                .uri
                .clone()
                .ok_or_else(|| playlist_error("encryption key without URI"))?;

            let iv_hex = seg_key
                .iv
                .as_deref()
                .ok_or_else(|| playlist_error("encryption key without IV"))?;

            let mut iv = [0u8; 16];
            hex::decode_to_slice(iv_hex.trim_start_matches("0x"), &mut iv)
                .map_err(|e| playlist_error(format!("bad IV `{iv_hex}`: {e}")))?;

            key = Some(KeySpec { url, iv });
        }

        chunks.push(MediaChunk {
            url: segment.uri.clone(),
            is_init: false,
        });
    }

    Ok(ChunkPlan { chunks, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio-aac\",NAME=\"Main\",DEFAULT=YES,URI=\"audio/playlist.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=2100000,AVERAGE-BANDWIDTH=1950000,CODECS=\"avc1.640020,mp4a.40.2\",RESOLUTION=1280x720,AUDIO=\"audio-aac\"\n\
video/playlist.m3u8\n";

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-MAP:URI=\"init.cmfv\"\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.invalid/k1\",IV=0x00112233445566778899aabbccddeeff\n\
#EXTINF:6.0,\n\
seg1.cmfv\n\
#EXTINF:6.0,\n\
seg2.cmfv\n\
#EXTINF:4.2,\n\
seg3.cmfv\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn master_selection_extracts_streams_and_bandwidth() {
        let selection = parse_master(MASTER.as_bytes()).unwrap();
        assert_eq!(selection.audio_url, "audio/playlist.m3u8");
        assert_eq!(selection.video_url, "video/playlist.m3u8");
        assert_eq!(selection.average_bandwidth, 1_950_000);
    }

    #[test]
    fn media_plan_has_init_first_and_key() {
        let plan = parse_media(MEDIA.as_bytes()).unwrap();

        assert_eq!(plan.chunks.len(), 4);
        assert!(plan.chunks[0].is_init);
        assert_eq!(plan.chunks[0].url, "init.cmfv");
        assert!(!plan.chunks[1].is_init);
        assert_eq!(plan.chunks[3].url, "seg3.cmfv");

        let key = plan.key.expect("key present");
        assert_eq!(key.url, "https://keys.example.invalid/k1");
        assert_eq!(key.iv[0], 0x00);
        assert_eq!(key.iv[15], 0xff);
    }

    #[test]
    fn media_playlist_without_key_yields_plain_chunks() {
        let plain = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:6\n\
#EXTINF:6.0,\n\
seg1.cmfv\n\
#EXT-X-ENDLIST\n";

        let plan = parse_media(plain.as_bytes()).unwrap();
        assert_eq!(plan.chunks.len(), 1);
        assert!(plan.key.is_none());
    }

    #[test]
    fn master_without_audio_rendition_is_rejected() {
        let bad = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=2100000\n\
video/playlist.m3u8\n";

        assert!(parse_master(bad.as_bytes()).is_err());
    }
}
