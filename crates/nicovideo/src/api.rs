// Watch-page protocol: authentication and the embedded ApiData payload.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{NicoError, Reporter};

static SERVER_RESPONSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="server-response"\s+content="([^"]+)""#).unwrap());

static OTP_FORM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"action="(/mfa[^"]*)""#).unwrap());

const DEFAULT_LOGIN_URL: &str = "https://account.nicovideo.jp/api/v1/login";
const DEFAULT_WATCH_API_BASE: &str = "https://nvapi.nicovideo.jp";
const DEFAULT_THUMB_BASE: &str = "https://ext.nicovideo.jp/api/getthumbinfo/";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) nicoarc/0.4";

/// Login credentials. The `invalid` latch is process-wide: once the site
/// rejects them, re-authentication is never attempted again.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Option<Credentials>,
    pub login_url: String,
    pub watch_api_base: String,
    pub thumb_base: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            credentials: None,
            login_url: DEFAULT_LOGIN_URL.to_owned(),
            watch_api_base: DEFAULT_WATCH_API_BASE.to_owned(),
            thumb_base: DEFAULT_THUMB_BASE.to_owned(),
        }
    }
}

struct AuthState {
    credentials: Credentials,
    invalid: bool,
}

/// nicovideo protocol client. Cheap to clone; the credential latch is
/// shared across clones.
#[derive(Clone)]
pub struct Client {
    pub(crate) http: reqwest::Client,
    pub(crate) config: ClientConfig,
    auth: Option<Arc<Mutex<AuthState>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, NicoError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()?;

        let auth = config.credentials.clone().map(|credentials| {
            Arc::new(Mutex::new(AuthState {
                credentials,
                invalid: false,
            }))
        });

        Ok(Client { http, config, auth })
    }

    pub(crate) async fn get_text(&self, url: &str) -> Result<String, NicoError> {
        Ok(self.http.get(url).send().await?.text().await?)
    }

    pub(crate) async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, NicoError> {
        Ok(self.http.get(url).send().await?.bytes().await?.to_vec())
    }

    /// Resolves a watch URL into its embedded [`ApiData`], authenticating
    /// when the page demands it.
    pub async fn fetch_api_data(
        &self,
        url: &str,
        reporter: &Reporter,
    ) -> Result<ApiData, NicoError> {
        reporter.submit("Downloading video metadata...", false);

        let mut page = self.get_text(url).await?;

        let anonymous = page.contains("'not_login'") || page.contains("NEED_LOGIN");
        if anonymous && self.can_authenticate() && self.authenticate(reporter).await? {
            page = self.get_text(url).await?;
        }

        let content = SERVER_RESPONSE
            .captures(&page)
            .and_then(|caps| caps.get(1))
            .ok_or(NicoError::NoApiData)?;

        let decoded = html_unescape(content.as_str());

        #[derive(Deserialize)]
        struct Envelope {
            data: EnvelopeData,
        }

        #[derive(Deserialize)]
        struct EnvelopeData {
            response: ApiData,
        }

        let envelope: Envelope = serde_json::from_str(&decoded)?;
        let mut data = envelope.data.response;
        data.created = Utc::now();

        debug!(video = %data.video.id, title = %data.video.title, "api data fetched");

        Ok(data)
    }

    /// Forces an authentication round, caching the session cookie.
    pub async fn cache_auth(&self, reporter: &Reporter) -> Result<(), NicoError> {
        self.authenticate(reporter).await.map(|_| ())
    }

    fn can_authenticate(&self) -> bool {
        self.auth
            .as_ref()
            .is_some_and(|auth| !auth.lock().unwrap().invalid)
    }

    fn mark_invalid(&self) {
        if let Some(auth) = &self.auth {
            auth.lock().unwrap().invalid = true;
        }
    }

    async fn authenticate(&self, reporter: &Reporter) -> Result<bool, NicoError> {
        let Some(auth) = &self.auth else {
            return Ok(false);
        };

        let credentials = auth.lock().unwrap().credentials.clone();

        reporter.submit("Logging in...", false);

        let response = self
            .http
            .post(&self.config.login_url)
            .form(&[
                ("mail_tel", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.mark_invalid();
                reporter.submit("Invalid credentials", true);
                return Err(e.into());
            }
        };

        // A failed login redirects back with a `message` query parameter.
        let rejected = response
            .url()
            .query_pairs()
            .any(|(key, value)| key == "message" && !value.is_empty());
        if rejected {
            self.mark_invalid();
            reporter.submit("Invalid credentials", true);
            return Err(NicoError::InvalidCredentials);
        }

        let body = response.text().await?;

        if body.contains(r#"name="otp""#) {
            return self.authenticate_otp(&body, reporter).await;
        }

        Ok(true)
    }

    async fn authenticate_otp(&self, body: &str, reporter: &Reporter) -> Result<bool, NicoError> {
        if !reporter.can_read() {
            return Ok(false);
        }

        let Some(action) = OTP_FORM.captures(body).and_then(|caps| caps.get(1)) else {
            return Ok(false);
        };

        let Ok(mut base) = url::Url::parse(&self.config.login_url) else {
            return Ok(false);
        };
        base.set_path("");
        base.set_query(None);

        let target = format!("{}{}", base.as_str().trim_end_matches('/'), action.as_str());

        reporter.submit(
            "Nicovideo has requested a one-time password to perform login.",
            true,
        );
        reporter.submit(
            "Please check your email and input the 6-digit code on the next line:",
            true,
        );

        let otp = loop {
            let line = reporter.read_line().await?;
            let candidate = line.trim().to_owned();

            if candidate.is_empty() {
                return Ok(false);
            }

            if candidate.len() == 6 && candidate.chars().all(|c| c.is_ascii_digit()) {
                break candidate;
            }

            reporter.submit(
                "Did not recognize input, enter a 6-digit code or an empty line to skip",
                true,
            );
        };

        let response = self
            .http
            .post(&target)
            .form(&[
                ("otp", otp.as_str()),
                ("loginBtn", "Login"),
                ("is_mfa_trusted_device", "true"),
                ("device_name", "nicoarc"),
            ])
            .send()
            .await;

        match response {
            Ok(r) => Ok(r.status().is_success()),
            Err(e) => {
                self.mark_invalid();
                reporter.submit("Invalid credentials", true);
                warn!(error = %e, "otp confirmation failed");
                Ok(false)
            }
        }
    }
}

/// Minimal HTML entity unescape for the watch-page meta payload.
pub(crate) fn html_unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let Some(end) = rest.find(';').filter(|&e| e <= 12) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..end];
        let replacement = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse().ok()
                    }
                })
                .and_then(char::from_u32),
        };

        match replacement {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Embedded watch-page descriptor: the video, its renditions and how the
/// content is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiData {
    /// Stamped at fetch time; drives the staleness check.
    #[serde(default = "epoch")]
    pub created: DateTime<Utc>,
    pub client: ApiClient,
    pub video: ApiVideo,
    pub media: ApiMedia,
}

impl Default for ApiData {
    fn default() -> Self {
        ApiData {
            created: epoch(),
            client: ApiClient::default(),
            video: ApiVideo::default(),
            media: ApiMedia::default(),
        }
    }
}

impl ApiData {
    /// A descriptor is stale once its content key window has passed.
    ///
    /// Only Delivery sessions carry a `contentKeyTimeout`; Domand
    /// descriptors have none and are always stale, so every download
    /// re-fetches them.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let timeout = self.media.delivery.movie.session.content_key_timeout as i64;

        (now - self.created).num_seconds() >= timeout
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiClient {
    pub watch_id: String,
    pub watch_track_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiVideo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub registered_at: String,
    /// Seconds.
    pub duration: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiMedia {
    pub domand: ApiDomand,
    pub delivery: ApiDelivery,
}

impl ApiMedia {
    pub fn is_domand(&self) -> bool {
        !self.domand.videos.is_empty()
    }

    pub fn audios(&self) -> &[ApiAudioRendition] {
        if self.is_domand() {
            &self.domand.audios
        } else {
            &self.delivery.movie.audios
        }
    }

    pub fn videos(&self) -> &[ApiVideoRendition] {
        if self.is_domand() {
            &self.domand.videos
        } else {
            &self.delivery.movie.videos
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiDomand {
    pub access_right_key: String,
    pub audios: Vec<ApiAudioRendition>,
    pub videos: Vec<ApiVideoRendition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiDelivery {
    pub movie: ApiMovie,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiMovie {
    pub audios: Vec<ApiAudioRendition>,
    pub videos: Vec<ApiVideoRendition>,
    pub session: ApiSession,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiAudioRendition {
    pub id: String,
    pub is_available: bool,
    pub bitrate: u64,
    pub sampling_rate: u64,
    pub metadata: ApiAudioMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiAudioMetadata {
    pub bitrate: u64,
    pub sampling_rate: u64,
}

impl ApiAudioRendition {
    pub fn bitrate(&self) -> u64 {
        if self.bitrate != 0 {
            self.bitrate
        } else {
            self.metadata.bitrate
        }
    }

    pub fn sampling_rate(&self) -> u64 {
        if self.sampling_rate != 0 {
            self.sampling_rate
        } else {
            self.metadata.sampling_rate
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiVideoRendition {
    pub id: String,
    pub is_available: bool,
    pub bitrate: u64,
    pub width: u64,
    pub height: u64,
    pub metadata: ApiVideoMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiVideoMetadata {
    pub label: String,
    pub bitrate: u64,
    pub resolution: ApiResolution,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiResolution {
    pub width: u64,
    pub height: u64,
}

impl ApiVideoRendition {
    pub fn bitrate(&self) -> u64 {
        if self.bitrate != 0 {
            self.bitrate
        } else {
            self.metadata.bitrate
        }
    }

    pub fn width(&self) -> u64 {
        if self.width != 0 {
            self.width
        } else {
            self.metadata.resolution.width
        }
    }

    pub fn height(&self) -> u64 {
        if self.height != 0 {
            self.height
        } else {
            self.metadata.resolution.height
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSession {
    pub auth_types: HashMap<String, String>,
    pub recipe_id: String,
    pub player_id: String,
    pub service_user_id: String,
    pub token: String,
    pub signature: String,
    pub content_id: String,
    pub videos: Vec<String>,
    pub audios: Vec<String>,
    pub urls: Vec<ApiSessionUrl>,
    pub heartbeat_lifetime: u64,
    /// Seconds.
    pub content_key_timeout: u64,
    pub priority: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSessionUrl {
    pub url: String,
    pub is_well_known_port: bool,
    pub is_ssl: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_handles_named_and_numeric_entities() {
        assert_eq!(
            html_unescape("{&quot;a&quot;:&#91;1,2&#93;,&quot;t&quot;:&quot;x &amp; y&quot;}"),
            r#"{"a":[1,2],"t":"x & y"}"#
        );
        assert_eq!(html_unescape("a &lt; b &gt; c &#x26; d"), "a < b > c & d");
        assert_eq!(html_unescape("no entities"), "no entities");
        assert_eq!(html_unescape("broken &unknown; stays"), "broken &unknown; stays");
        assert_eq!(html_unescape("dangling &"), "dangling &");
    }

    #[test]
    fn api_data_decodes_domand_payload() {
        let payload = r#"{
            "client": {"watchId": "sm9", "watchTrackId": "track-1"},
            "video": {"id": "sm9", "title": "t", "description": "d",
                      "registeredAt": "2007-03-06T00:33:00+09:00", "duration": 320},
            "media": {
                "domand": {
                    "accessRightKey": "ark-1",
                    "videos": [{"id": "video-h264-720p", "isAvailable": true,
                                "bitrate": 2000000, "width": 1280, "height": 720}],
                    "audios": [{"id": "audio-aac-192kbps", "isAvailable": true,
                                "bitrate": 192000, "samplingRate": 48000}]
                }
            }
        }"#;

        let data: ApiData = serde_json::from_str(payload).unwrap();
        assert!(data.media.is_domand());
        assert_eq!(data.media.videos()[0].bitrate(), 2_000_000);
        assert_eq!(data.media.audios()[0].sampling_rate(), 48_000);
        assert_eq!(data.video.duration, 320);
        assert_eq!(data.client.watch_track_id, "track-1");
    }

    #[test]
    fn metadata_fallbacks_resolve() {
        let rendition: ApiVideoRendition = serde_json::from_str(
            r#"{"id": "v", "isAvailable": true,
                "metadata": {"bitrate": 12345, "resolution": {"width": 640, "height": 360}}}"#,
        )
        .unwrap();

        assert_eq!(rendition.bitrate(), 12_345);
        assert_eq!(rendition.width(), 640);
        assert_eq!(rendition.height(), 360);
    }

    #[test]
    fn staleness_uses_session_window() {
        let mut data = ApiData::default();
        data.media.delivery.movie.session.content_key_timeout = 600;
        data.created = Utc::now();
        assert!(!data.is_stale(Utc::now()));

        data.created = Utc::now() - chrono::Duration::seconds(601);
        assert!(data.is_stale(Utc::now()));

        // Deserialized cached payloads keep their stamp.
        let json = serde_json::to_string(&data).unwrap();
        let parsed: ApiData = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_stale(Utc::now()));
    }

    #[test]
    fn domand_descriptors_are_always_stale() {
        let mut data = ApiData::default();
        data.media.domand.access_right_key = "ark-1".into();
        data.media.domand.videos.push(Default::default());

        // No content key window exists for Domand; even a fresh fetch is
        // re-fetched by the next download.
        data.created = Utc::now();
        assert!(data.is_stale(Utc::now()));
    }
}
