//! Orchestration of the download pipeline.
//!
//! Four long-running workers each consume one task kind from the durable
//! log: *list* renders the format table, *download* runs the media client
//! under a cancellable deadline, *cleanup* expires finished files, and
//! *publish* posts artifacts to a microblog API. Cross-component glue — the
//! retry policy, the stop-reaction cancellation registry, the backoff gate
//! and the observer seam — lives here and nowhere else.

use std::sync::Arc;

mod backoff;
mod config;
mod observer;
mod publish;
mod tasks;
mod workers;

pub use backoff::BackoffGate;
pub use config::{PipelineConfig, PublishTarget};
pub use observer::{
    EMOJI_ARROW_UP, EMOJI_NEGATIVE, EMOJI_STOP, Observer, ObserverError, TracingObserver,
};
pub use publish::{PublishClient, PublishError};
pub use tasks::{
    CleanupTask, DownloadTask, KIND_CLEANUP, KIND_DOWNLOAD, KIND_LIST, KIND_PUBLISH, ListTask,
    MessageRef, PublishTask, TASK_SCOPE, TaskPayload,
};
pub use workers::{Orchestrator, format_file_id, valid_watch_url};

/// Shared handle to the durable task log.
pub type TaskLogHandle = Arc<tasklog::TaskLog>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Nico(#[from] nicovideo::NicoError),

    #[error(transparent)]
    TaskLog(#[from] tasklog::TaskLogError),

    #[error(transparent)]
    Publish(#[from] publish::PublishError),

    #[error(transparent)]
    Observer(#[from] observer::ObserverError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("not a nicovideo watch URL: {url}")]
    InvalidUrl { url: String },
}
