use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CliError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub nicovideo: NicovideoConfig,
    pub pipeline: PipelineSection,
    pub publish: Option<PublishSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379/0".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct NicovideoConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub save_dir: PathBuf,
    pub public_base: String,
    pub retention_secs: u64,
    pub download_deadline_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        PipelineSection {
            save_dir: PathBuf::from("downloads"),
            public_base: String::new(),
            retention_secs: 24 * 3600,
            download_deadline_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishSection {
    pub host: String,
    pub token: String,
}

impl AppConfig {
    /// Loads the TOML config, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<AppConfig, CliError> {
        let Some(path) = path else {
            return Ok(AppConfig::default());
        };

        let raw = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;

        toml::from_str(&raw).map_err(|source| CliError::ConfigParse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn pipeline_config(&self) -> pipeline::PipelineConfig {
        pipeline::PipelineConfig {
            save_dir: self.pipeline.save_dir.clone(),
            public_base: self.pipeline.public_base.clone(),
            retention: Duration::from_secs(self.pipeline.retention_secs),
            download_deadline: Duration::from_secs(self.pipeline.download_deadline_secs),
            publish: self.publish.as_ref().map(|p| pipeline::PublishTarget {
                host: p.host.clone(),
                token: p.token.clone(),
            }),
            ..pipeline::PipelineConfig::default()
        }
    }

    pub fn client_config(&self) -> nicovideo::ClientConfig {
        let credentials = match (&self.nicovideo.username, &self.nicovideo.password) {
            (Some(username), Some(password)) => Some(nicovideo::Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        nicovideo::ClientConfig {
            credentials,
            ..nicovideo::ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [redis]
            url = "redis://cache:6379/1"

            [nicovideo]
            username = "user@example.invalid"
            password = "hunter2"

            [pipeline]
            save_dir = "/srv/videos"
            public_base = "https://dl.example.invalid"
            retention_secs = 86400
            download_deadline_secs = 3600

            [publish]
            host = "https://pleroma.example.invalid"
            token = "opaque"
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.redis.url, "redis://cache:6379/1");
        assert_eq!(config.pipeline.save_dir, PathBuf::from("/srv/videos"));
        assert!(config.publish.is_some());

        let pc = config.pipeline_config();
        assert_eq!(pc.retention, Duration::from_secs(86400));
        assert!(config.client_config().credentials.is_some());
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/0");
        assert!(config.publish.is_none());
        assert!(config.client_config().credentials.is_none());
    }
}
