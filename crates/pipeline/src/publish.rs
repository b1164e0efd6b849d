// Microblog publishing: media upload then status create, bearer-authed.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("publish rejected with HTTP {status} during {operation}")]
    Rejected {
        status: reqwest::StatusCode,
        operation: &'static str,
    },
}

/// Client for the downstream microblog API. Tokens are consumed opaquely.
pub struct PublishClient {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    id: String,
}

impl PublishClient {
    pub fn new() -> Result<Self, PublishError> {
        Ok(PublishClient {
            http: reqwest::Client::builder().build()?,
        })
    }

    /// Uploads the media file and posts a status referencing it.
    pub async fn publish(
        &self,
        host: &str,
        token: &str,
        file_path: &Path,
        status: &str,
    ) -> Result<(), PublishError> {
        let media_id = self.upload_media(host, token, file_path).await?;
        self.create_status(host, token, status, &media_id).await
    }

    async fn upload_media(
        &self,
        host: &str,
        token: &str,
        file_path: &Path,
    ) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(file_path).await?;
        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.mp4".to_owned());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("video/mp4")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{host}/api/v1/media"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PublishError::Rejected {
                status: response.status(),
                operation: "media upload",
            });
        }

        let media: MediaResponse = response.json().await?;
        debug!(media_id = %media.id, "media uploaded");

        Ok(media.id)
    }

    async fn create_status(
        &self,
        host: &str,
        token: &str,
        status: &str,
        media_id: &str,
    ) -> Result<(), PublishError> {
        let body = serde_json::json!({
            "status": status,
            "content_type": "text/html",
            "media_ids": [media_id],
        });

        let response = self
            .http
            .post(format!("{host}/api/v1/statuses"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PublishError::Rejected {
                status: response.status(),
                operation: "status create",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn publish_uploads_then_posts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/media"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "media-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sm9-max.mp4");
        std::fs::write(&file, b"mp4bytes").unwrap();

        let client = PublishClient::new().unwrap();
        client
            .publish(&server.uri(), "tok-1", &file, "title https://example.invalid/sm9")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upload_failure_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/media"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sm9-max.mp4");
        std::fs::write(&file, b"mp4bytes").unwrap();

        let client = PublishClient::new().unwrap();
        let err = client
            .publish(&server.uri(), "tok", &file, "s")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Rejected {
                operation: "media upload",
                ..
            }
        ));
    }
}
