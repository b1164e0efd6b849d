// DMC session establishment and heartbeats.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::api::{ApiSession, ApiSessionUrl};
use crate::{Client, NicoError, Reporter};

mod yes_no {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "yes" } else { "no" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "yes" => Ok(true),
            "no" => Ok(false),
            other => Err(D::Error::custom(format!("expected yes/no, got `{other}`"))),
        }
    }
}

#[derive(Serialize)]
struct SessionRequest {
    session: SessionRequestSession,
}

#[derive(Serialize)]
struct SessionRequestSession {
    content_src_id_sets: Vec<SrcIdSet>,
    content_id: String,
    content_type: &'static str,
    content_uri: &'static str,
    recipe_id: String,
    timing_constraint: &'static str,
    client_info: ClientInfo,
    session_operation_auth: OperationAuth,
    protocol: Protocol,
    content_auth: ContentAuth,
    keep_method: KeepMethod,
    priority: f64,
}

#[derive(Serialize)]
struct ClientInfo {
    player_id: String,
}

#[derive(Serialize)]
struct ContentAuth {
    auth_type: String,
    service_id: &'static str,
    service_user_id: String,
    content_key_timeout: u64,
}

#[derive(Serialize)]
struct SrcIdSet {
    content_src_ids: Vec<SrcId>,
}

#[derive(Serialize)]
struct SrcId {
    src_id_to_mux: SrcMux,
}

#[derive(Serialize)]
struct SrcMux {
    audio_src_ids: Vec<String>,
    video_src_ids: Vec<String>,
}

#[derive(Serialize)]
struct KeepMethod {
    heartbeat: Heartbeat,
}

#[derive(Serialize)]
struct Heartbeat {
    lifetime: u64,
}

#[derive(Serialize)]
struct Protocol {
    name: &'static str,
    parameters: ProtocolParameters,
}

#[derive(Serialize)]
struct ProtocolParameters {
    http_parameters: HttpParameters,
}

#[derive(Serialize)]
struct HttpParameters {
    parameters: HttpDownloadParameters,
}

#[derive(Serialize)]
struct HttpDownloadParameters {
    http_output_download_parameters: HttpOutputParameters,
}

#[derive(Serialize)]
struct HttpOutputParameters {
    #[serde(with = "yes_no")]
    use_ssl: bool,
    #[serde(with = "yes_no")]
    use_well_known_port: bool,
}

#[derive(Serialize)]
struct OperationAuth {
    session_operation_auth_by_signature: AuthSignature,
}

#[derive(Serialize)]
struct AuthSignature {
    signature: String,
    token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionResponse {
    pub meta: SessionResponseMeta,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct SessionResponseMeta {
    pub status: i64,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SessionResponseData {
    session: SessionResponseSession,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SessionResponseSession {
    id: String,
    content_uri: String,
}

/// An established DMC session: the progressive content URI plus the state
/// the heartbeat keeps re-posting.
#[derive(Debug)]
pub(crate) struct DmcSession {
    pub id: String,
    pub content_uri: String,
    /// Raw `data` object; the heartbeat PUTs it back verbatim.
    pub data: Value,
}

fn request_envelope(
    session: &ApiSession,
    first_url: &ApiSessionUrl,
    audio_id: &str,
    video_id: &str,
) -> SessionRequest {
    SessionRequest {
        session: SessionRequestSession {
            client_info: ClientInfo {
                player_id: session.player_id.clone(),
            },
            content_auth: ContentAuth {
                auth_type: session.auth_types.get("http").cloned().unwrap_or_default(),
                content_key_timeout: session.content_key_timeout,
                service_id: "nicovideo",
                service_user_id: session.service_user_id.clone(),
            },
            content_id: session.content_id.clone(),
            content_src_id_sets: vec![SrcIdSet {
                content_src_ids: vec![SrcId {
                    src_id_to_mux: SrcMux {
                        audio_src_ids: vec![audio_id.to_owned()],
                        video_src_ids: vec![video_id.to_owned()],
                    },
                }],
            }],
            content_type: "movie",
            content_uri: "",
            keep_method: KeepMethod {
                heartbeat: Heartbeat {
                    lifetime: session.heartbeat_lifetime,
                },
            },
            priority: session.priority,
            protocol: Protocol {
                name: "http",
                parameters: ProtocolParameters {
                    http_parameters: HttpParameters {
                        parameters: HttpDownloadParameters {
                            http_output_download_parameters: HttpOutputParameters {
                                use_ssl: first_url.is_ssl,
                                use_well_known_port: first_url.is_well_known_port,
                            },
                        },
                    },
                },
            },
            recipe_id: session.recipe_id.clone(),
            session_operation_auth: OperationAuth {
                session_operation_auth_by_signature: AuthSignature {
                    signature: session.signature.clone(),
                    token: session.token.clone(),
                },
            },
            timing_constraint: "unlimited",
        },
    }
}

impl Client {
    pub(crate) async fn create_session(
        &self,
        session: &ApiSession,
        audio_id: &str,
        video_id: &str,
    ) -> Result<DmcSession, NicoError> {
        let first_url = session
            .urls
            .first()
            .ok_or_else(|| NicoError::protocol("delivery session without urls"))?;

        let mut url = Url::parse(&first_url.url)
            .map_err(|e| NicoError::protocol(format!("bad session url: {e}")))?;
        url.query_pairs_mut().append_pair("_format", "json");

        let envelope = request_envelope(session, first_url, audio_id, video_id);

        let response: SessionResponse = self
            .http
            .post(url)
            .json(&envelope)
            .send()
            .await?
            .json()
            .await?;

        if response.meta.status / 100 != 2 {
            return Err(NicoError::SessionStatus {
                status: response.meta.status,
                message: response.meta.message,
            });
        }

        let parsed: SessionResponseData = serde_json::from_value(response.data.clone())?;

        debug!(session = %parsed.session.id, "dmc session established");

        Ok(DmcSession {
            id: parsed.session.id,
            content_uri: parsed.session.content_uri,
            data: response.data,
        })
    }

    /// Keeps the session alive until cancellation, then deletes it.
    ///
    /// The final DELETE runs under its own one-minute budget so caller
    /// cancellation cannot interrupt server-side cleanup.
    pub(crate) async fn session_keepalive(
        &self,
        session: &ApiSession,
        mut dmc: DmcSession,
        token: CancellationToken,
        reporter: Reporter,
    ) {
        let Some(first_url) = session.urls.first() else {
            return;
        };

        let interval = Duration::from_secs(session.heartbeat_lifetime / 3000);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.session_put(&first_url.url, &dmc).await {
                        Ok(Some(data)) => dmc.data = data,
                        Ok(None) => return,
                        Err(e) => {
                            reporter.submit(&format!("keepalive error: {e}"), true);
                            warn!(error = %e, "session keepalive failed");
                            return;
                        }
                    }
                }
                _ = token.cancelled() => {
                    if let Err(e) = self.session_delete(&first_url.url, &dmc).await {
                        reporter.submit(&format!("keepalive error: {e}"), true);
                        warn!(error = %e, "session delete failed");
                    }
                    return;
                }
            }
        }
    }

    async fn session_put(&self, base: &str, dmc: &DmcSession) -> Result<Option<Value>, NicoError> {
        let mut url = Url::parse(base)
            .map_err(|e| NicoError::protocol(format!("bad session url: {e}")))?;
        url.set_path(&format!("{}/{}", url.path().trim_end_matches('/'), dmc.id));
        url.query_pairs_mut()
            .append_pair("_method", "PUT")
            .append_pair("_format", "json");

        let response: SessionResponse = self
            .http
            .post(url)
            .json(&dmc.data)
            .send()
            .await?
            .json()
            .await?;

        if response.meta.status / 100 != 2 {
            return Ok(None);
        }

        Ok(Some(response.data))
    }

    async fn session_delete(&self, base: &str, dmc: &DmcSession) -> Result<(), NicoError> {
        let mut url = Url::parse(base)
            .map_err(|e| NicoError::protocol(format!("bad session url: {e}")))?;
        url.set_path(&format!("{}/{}", url.path().trim_end_matches('/'), dmc.id));
        url.query_pairs_mut().append_pair("_method", "DELETE");

        self.http
            .post(url)
            .json(&dmc.data)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_matches_wire_shape() {
        let mut session = ApiSession {
            recipe_id: "recipe".into(),
            player_id: "player".into(),
            service_user_id: "user".into(),
            token: "tok".into(),
            signature: "sig".into(),
            content_id: "sm9".into(),
            heartbeat_lifetime: 120_000,
            content_key_timeout: 600,
            priority: 0.8,
            ..Default::default()
        };
        session.auth_types.insert("http".into(), "ht2".into());
        session.urls.push(ApiSessionUrl {
            url: "https://api.dmc.nico/api/sessions".into(),
            is_well_known_port: true,
            is_ssl: true,
        });

        let envelope = request_envelope(&session, &session.urls[0], "aac-64", "h264-360p");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["session"]["content_id"], "sm9");
        assert_eq!(value["session"]["timing_constraint"], "unlimited");
        assert_eq!(value["session"]["content_auth"]["auth_type"], "ht2");
        assert_eq!(
            value["session"]["content_src_id_sets"][0]["content_src_ids"][0]["src_id_to_mux"]
                ["audio_src_ids"][0],
            "aac-64"
        );
        assert_eq!(
            value["session"]["protocol"]["parameters"]["http_parameters"]["parameters"]
                ["http_output_download_parameters"]["use_ssl"],
            "yes"
        );
        assert_eq!(
            value["session"]["keep_method"]["heartbeat"]["lifetime"],
            120_000
        );
    }

    #[test]
    fn yes_no_round_trip() {
        #[derive(Serialize, Deserialize)]
        struct Flag {
            #[serde(with = "yes_no")]
            value: bool,
        }

        let json = serde_json::to_string(&Flag { value: false }).unwrap();
        assert_eq!(json, r#"{"value":"no"}"#);

        let parsed: Flag = serde_json::from_str(r#"{"value":"yes"}"#).unwrap();
        assert!(parsed.value);
    }
}
