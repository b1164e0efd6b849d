// Task payloads carried through the durable log.
//
// Every payload serializes with a stable `kind` discriminator and rides its
// own per-kind stream, so a record landing in the wrong stream decodes to a
// mismatched variant and is treated as poison by the worker.

use serde::{Deserialize, Serialize};

/// Stream scope: streams are keyed `task.<scope>.<kind>`.
pub const TASK_SCOPE: &str = "nico";

pub const KIND_LIST: &str = "list";
pub const KIND_DOWNLOAD: &str = "download";
pub const KIND_CLEANUP: &str = "cleanup";
pub const KIND_PUBLISH: &str = "publish";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    List(ListTask),
    Download(DownloadTask),
    Cleanup(CleanupTask),
    Publish(PublishTask),
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::List(_) => KIND_LIST,
            TaskPayload::Download(_) => KIND_DOWNLOAD,
            TaskPayload::Cleanup(_) => KIND_CLEANUP,
            TaskPayload::Publish(_) => KIND_PUBLISH,
        }
    }
}

/// Where a task reports back to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListTask {
    #[serde(flatten)]
    pub message: MessageRef,
    pub user_id: String,
    pub video_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<String>,
    #[serde(default)]
    pub post: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    #[serde(flatten)]
    pub message: MessageRef,
    pub video_url: String,
    pub format: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<String>,
    /// Cached watch-page descriptor, refreshed by the downloader if stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub estimate: u64,
    #[serde(default)]
    pub post: bool,
    #[serde(default)]
    pub preview: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTask {
    #[serde(flatten)]
    pub message: MessageRef,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTask {
    #[serde(flatten)]
    pub message: MessageRef,
    pub video_url: String,
    pub file_path: String,
    pub host: String,
    pub auth: String,
    #[serde(default)]
    pub preview: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_kind_discriminator() {
        let payload = TaskPayload::Download(DownloadTask {
            message: MessageRef {
                guild_id: "g".into(),
                channel_id: "c".into(),
                message_id: "m".into(),
            },
            video_url: "https://www.nicovideo.jp/watch/sm9".into(),
            format: "max".into(),
            user_id: "u".into(),
            ..DownloadTask::default()
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "download");
        assert_eq!(json["video_url"], "https://www.nicovideo.jp/watch/sm9");
        // The message reference flattens into the payload.
        assert_eq!(json["channel_id"], "c");

        let parsed: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), KIND_DOWNLOAD);
        assert_eq!(parsed, payload);
    }

    #[test]
    fn wrong_kind_is_a_decode_mismatch_not_a_panic() {
        let cleanup = serde_json::json!({
            "kind": "cleanup",
            "guild_id": "g", "channel_id": "c", "message_id": "m",
            "file_path": "/data/x.mp4"
        });

        let parsed: TaskPayload = serde_json::from_value(cleanup).unwrap();
        assert!(matches!(parsed, TaskPayload::Cleanup(_)));
    }
}
