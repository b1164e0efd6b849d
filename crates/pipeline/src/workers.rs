// The four worker loops: list, download, cleanup, publish.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nicovideo::{NicoError, SaveOptions, sanitize_filename, save_filepath};
use progress::{Report, Reporter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::backoff::BackoffGate;
use crate::config::PipelineConfig;
use crate::observer::{EMOJI_ARROW_UP, EMOJI_NEGATIVE, EMOJI_STOP, Observer};
use crate::publish::PublishClient;
use crate::tasks::{
    CleanupTask, DownloadTask, KIND_CLEANUP, KIND_DOWNLOAD, KIND_LIST, KIND_PUBLISH, ListTask,
    MessageRef, PublishTask, TaskPayload,
};
use crate::{PipelineError, TaskLogHandle};

const RETRY_LIMIT: u32 = 3;
const RETRY_RESET_WINDOW: Duration = Duration::from_secs(30);

/// Watch URLs accepted by the pipeline edge.
pub fn valid_watch_url(url: &str) -> bool {
    Url::parse(url).is_ok_and(|u| {
        u.scheme().starts_with("http")
            && u.host_str().is_some_and(|host| host.ends_with("nicovideo.jp"))
    })
}

/// File id prefix shared by the idempotency check and the save path.
pub fn format_file_id(video_id: &str, format: &str) -> String {
    if format.is_empty() {
        format!("{video_id}-max")
    } else {
        format!("{video_id}-{}", sanitize_filename(format))
    }
}

/// Finds a finished download matching the file id prefix.
fn glob_find(dir: &Path, file_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.starts_with(file_id) && !name.ends_with(".part") && !name.ends_with(".ass") {
            return Some(entry.path());
        }
    }

    None
}

fn subtitle_filename(path: &str, lang: &str) -> String {
    path.replace(".mp4", &format!(".{lang}.ass"))
}

fn subs_exist(task: &DownloadTask, path: &Path) -> bool {
    let Some(lang) = &task.subs else {
        return true;
    };

    let candidate = subtitle_filename(&path.to_string_lossy(), lang);
    std::fs::metadata(candidate).is_ok()
}

fn is_terminal(err: &PipelineError) -> bool {
    match err {
        PipelineError::Nico(e) => {
            e.is_terminal() || matches!(e, NicoError::Format(formats::FormatError::Suggest { .. }))
        }
        _ => false,
    }
}

/// Runs `action` with at most three retries; the retry counter resets when
/// the previous failure is older than the reset window.
async fn try_perform<T, F, Fut>(mut action: F) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut failures = 0u32;
    let mut last_failure = Instant::now();

    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) if is_terminal(&err) => return Err(err),
            Err(err) => {
                if last_failure.elapsed() < RETRY_RESET_WINDOW {
                    failures += 1;
                } else {
                    failures = 0;
                }
                last_failure = Instant::now();

                if failures >= RETRY_LIMIT {
                    return Err(err);
                }

                warn!(error = %err, attempt = failures, "retrying task action");
            }
        }
    }
}

struct ActiveDownload {
    message: MessageRef,
    token: CancellationToken,
}

/// Owns the four worker loops and the cross-loop state.
pub struct Orchestrator {
    log: TaskLogHandle,
    client: nicovideo::Client,
    observer: Arc<dyn Observer>,
    publisher: PublishClient,
    backoff: BackoffGate,
    config: PipelineConfig,
    active: Mutex<Option<ActiveDownload>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        log: TaskLogHandle,
        client: nicovideo::Client,
        observer: Arc<dyn Observer>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let backoff = BackoffGate::new(log.store().clone(), config.backoff_initial);

        Ok(Orchestrator {
            log,
            client,
            observer,
            publisher: PublishClient::new()?,
            backoff,
            config,
            active: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Validates and enqueues a payload, returning `(id, pending_count)`.
    pub async fn enqueue(
        &self,
        payload: &TaskPayload,
        delay: Duration,
        timeout: Duration,
    ) -> Result<(String, u64), PipelineError> {
        let url = match payload {
            TaskPayload::List(t) => Some(t.video_url.as_str()),
            TaskPayload::Download(t) => Some(t.video_url.as_str()),
            _ => None,
        };

        if let Some(url) = url
            && !valid_watch_url(url)
        {
            return Err(PipelineError::InvalidUrl {
                url: url.to_owned(),
            });
        }

        Ok(self
            .log
            .enqueue(payload.kind(), payload, delay, timeout)
            .await?)
    }

    /// Cancels the in-flight download attached to `message`, if any. Wired
    /// to the stop reaction by the chat collaborator.
    pub fn cancel_download(&self, channel_id: &str, message_id: &str) -> bool {
        let active = self.active.lock().unwrap();

        if let Some(active) = active.as_ref()
            && active.message.channel_id == channel_id
            && active.message.message_id == message_id
        {
            active.token.cancel();
            return true;
        }

        false
    }

    /// Runs all four loops until the shutdown token fires.
    pub async fn run(&self) {
        tokio::join!(
            self.worker_loop(KIND_LIST),
            self.worker_loop(KIND_DOWNLOAD),
            self.worker_loop(KIND_CLEANUP),
            self.worker_loop(KIND_PUBLISH),
        );
    }

    async fn worker_loop(&self, kind: &'static str) {
        while !self.shutdown.is_cancelled() {
            match self.step(kind).await {
                Ok(_) => {}
                Err(e) => {
                    // Storage trouble: log and re-poll after a beat.
                    error!(kind, error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One dequeue-handle-ack round. Returns whether a task was handled.
    pub async fn step(&self, kind: &'static str) -> Result<bool, PipelineError> {
        let dequeued: Option<(String, TaskPayload)> =
            self.log.dequeue(kind, self.config.dequeue_block).await?;

        let Some((id, payload)) = dequeued else {
            return Ok(false);
        };

        match (kind, payload) {
            (KIND_LIST, TaskPayload::List(task)) => self.handle_list(&id, task).await,
            (KIND_DOWNLOAD, TaskPayload::Download(task)) => self.handle_download(&id, task).await,
            (KIND_CLEANUP, TaskPayload::Cleanup(task)) => self.handle_cleanup(&id, task).await,
            (KIND_PUBLISH, TaskPayload::Publish(task)) => self.handle_publish(&id, task).await,
            (_, other) => {
                warn!(kind, got = other.kind(), %id, "mismatched task kind dropped");
                self.ack(kind, &id).await;
            }
        }

        Ok(true)
    }

    async fn ack(&self, kind: &str, id: &str) {
        if let Err(e) = self.log.ack(kind, id).await {
            error!(kind, id, error = %e, "acking task failed");
        }
    }

    async fn update_message(&self, message: &MessageRef, text: &str) {
        if text.is_empty() {
            return;
        }

        if let Err(e) = self
            .observer
            .edit_message(&message.channel_id, &message.message_id, text)
            .await
        {
            error!(error = %e, "editing message failed");
        }
    }

    /// Bridges a rate-limited reporter onto message edits.
    fn spawn_reporter(&self, message: MessageRef, prefix: String) -> Arc<dyn Report> {
        let (reporter, mut rx) = Reporter::channel(self.config.report_rate, 1);
        let observer = self.observer.clone();

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let line = if prefix.is_empty() {
                    text
                } else {
                    format!("{prefix} {text}")
                };

                if let Err(e) = observer
                    .edit_message(&message.channel_id, &message.message_id, &line)
                    .await
                {
                    error!(error = %e, "updating progress message failed");
                }
            }
        });

        Arc::new(reporter)
    }

    async fn await_backoff(&self) {
        if let Some(remaining) = self.backoff.remaining().await {
            tokio::time::sleep(remaining).await;
        }
    }

    // --- list ---

    async fn handle_list(&self, id: &str, task: ListTask) {
        let result = try_perform(|| self.list_formats_action(&task)).await;

        if let Err(e) = result {
            error!(error = %e, url = %task.video_url, "listing formats failed");
            self.update_message(&task.message, "Listing formats error")
                .await;
        }

        self.ack(KIND_LIST, id).await;
    }

    async fn list_formats_action(&self, task: &ListTask) -> Result<(), PipelineError> {
        self.await_backoff().await;

        let reporter = self.spawn_reporter(task.message.clone(), String::new());
        let formats = self.client.list_formats(&task.video_url, &reporter).await;

        match formats {
            Ok(formats) => {
                self.backoff.record_success().await;
                let table = formats::render_table(&formats);
                self.update_message(&task.message, &format!("```{table}```"))
                    .await;
                Ok(())
            }
            Err(e) => {
                if matches!(e, NicoError::Network { .. }) {
                    self.backoff.record_failure().await;
                }
                Err(e.into())
            }
        }
    }

    // --- download ---

    async fn handle_download(&self, id: &str, task: DownloadTask) {
        let Some(video_id) = task.video_url.rsplit('/').next().filter(|s| !s.is_empty())
        else {
            self.ack(KIND_DOWNLOAD, id).await;
            return;
        };

        let file_id = format_file_id(video_id, &task.format);

        if let Some(existing) = glob_find(&self.config.save_dir, &file_id)
            && subs_exist(&task, &existing)
        {
            self.download_send(&task, &existing).await;
            self.ack(KIND_DOWNLOAD, id).await;
            let _ = self
                .observer
                .unreact(&task.message.channel_id, &task.message.message_id, EMOJI_STOP)
                .await;
            return;
        }

        let token = CancellationToken::new();
        let deadline_hit = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let token = token.clone();
            let deadline_hit = deadline_hit.clone();
            let deadline = self.config.download_deadline;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        deadline_hit.store(true, std::sync::atomic::Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        *self.active.lock().unwrap() = Some(ActiveDownload {
            message: task.message.clone(),
            token: token.clone(),
        });

        let result = try_perform(|| self.download_video(&token, id, &task)).await;

        token.cancel();

        let _ = self
            .observer
            .unreact(&task.message.channel_id, &task.message.message_id, EMOJI_STOP)
            .await;

        *self.active.lock().unwrap() = None;

        self.ack(KIND_DOWNLOAD, id).await;

        let result = match result {
            Err(PipelineError::Nico(NicoError::Cancelled))
                if deadline_hit.load(std::sync::atomic::Ordering::SeqCst) =>
            {
                Err(PipelineError::Nico(NicoError::DeadlineExceeded))
            }
            other => other,
        };

        match result {
            Ok(path) => {
                self.schedule_cleanup(&task, &path).await;
                self.download_send(&task, &path).await;
            }
            Err(e) => self.download_error(&task, e).await,
        }
    }

    async fn download_video(
        &self,
        token: &CancellationToken,
        id: &str,
        task: &DownloadTask,
    ) -> Result<PathBuf, PipelineError> {
        self.await_backoff().await;
        tokio::fs::create_dir_all(&self.config.save_dir).await?;

        let output = save_filepath(&self.config.save_dir, &task.video_url, &task.format);

        let reporter = self.spawn_reporter(task.message.clone(), format!("{id} [downloading]"));
        let opts = SaveOptions {
            reporter: reporter.clone(),
            subtitles: task.subs.iter().cloned().collect(),
        };

        let cached = task
            .data
            .as_ref()
            .and_then(|value| serde_json::to_vec(value).ok());

        let saved = self
            .client
            .save_format(
                token,
                &task.video_url,
                &task.format,
                &output.to_string_lossy(),
                true,
                cached.as_deref(),
                &opts,
            )
            .await;

        match saved {
            Ok(path) => {
                self.backoff.record_success().await;
                Ok(path)
            }
            Err(e) => {
                reporter.submit(&format!("ERROR: {e}"), true);
                if matches!(e, NicoError::Network { .. }) {
                    self.backoff.record_failure().await;
                }
                Err(e.into())
            }
        }
    }

    async fn schedule_cleanup(&self, task: &DownloadTask, path: &Path) {
        let main_path = path.to_string_lossy().into_owned();
        let mut paths = vec![main_path.clone()];

        if let Some(lang) = &task.subs {
            paths.push(subtitle_filename(&main_path, lang));
        }

        for file_path in paths {
            let cleanup = TaskPayload::Cleanup(CleanupTask {
                message: task.message.clone(),
                file_path,
            });

            if let Err(e) = self
                .enqueue(&cleanup, self.config.retention, Duration::ZERO)
                .await
            {
                error!(error = %e, "scheduling cleanup failed");
            }
        }
    }

    async fn download_send(&self, task: &DownloadTask, path: &Path) {
        // Let the last in-flight progress edit land first.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let uri = format!("{}/{base}", self.config.public_base);

        let mut text = format!(
            "Downloaded as {uri} file will be deleted after {}",
            humanize_period(self.config.retention)
        );

        if let Some(lang) = &task.subs {
            text.push_str(&format!(
                "\ndanmaku subtitles: {}",
                subtitle_filename(&uri, lang)
            ));
        }

        if !task.preview {
            self.update_message(&task.message, &text).await;
        }

        if task.post {
            self.publish_enqueue(task, path).await;
        }
    }

    async fn download_error(&self, task: &DownloadTask, err: PipelineError) {
        match &err {
            PipelineError::Nico(NicoError::Cancelled) => {
                self.update_message(&task.message, "Cancelled").await;
            }
            PipelineError::Nico(NicoError::DeadlineExceeded) => {
                self.update_message(
                    &task.message,
                    "Video took more than 1h to download, repeat request to resume \
                     within next 24h before it is deleted",
                )
                .await;
            }
            PipelineError::Nico(NicoError::Format(formats::FormatError::Suggest {
                smallest,
            })) => {
                let estimate =
                    formats::human_size_format(smallest.size_estimate() as f64);
                self.update_message(
                    &task.message,
                    &format!(
                        "Smallest format available: {} - est. {}, repeat with ! to force",
                        smallest.id,
                        estimate.trim()
                    ),
                )
                .await;
            }
            _ => {
                error!(error = %err, url = %task.video_url, "downloading video failed");
                self.update_message(&task.message, "Downloading error").await;
            }
        }
    }

    async fn publish_enqueue(&self, task: &DownloadTask, path: &Path) {
        let Some(publish) = &self.config.publish else {
            return;
        };

        let payload = TaskPayload::Publish(PublishTask {
            message: task.message.clone(),
            video_url: task.video_url.clone(),
            file_path: path.to_string_lossy().into_owned(),
            host: publish.host.clone(),
            auth: publish.token.clone(),
            preview: task.preview,
        });

        if let Err(e) = self.enqueue(&payload, Duration::ZERO, Duration::ZERO).await {
            error!(error = %e, "scheduling publish failed");
        }
    }

    // --- cleanup ---

    async fn handle_cleanup(&self, id: &str, task: CleanupTask) {
        let _ = tokio::fs::remove_file(&task.file_path).await;

        self.update_message(&task.message, "Downloaded video deleted due to expiration")
            .await;

        info!(path = %task.file_path, "expired download removed");

        self.ack(KIND_CLEANUP, id).await;
    }

    // --- publish ---

    async fn handle_publish(&self, id: &str, task: PublishTask) {
        // Publishing is fire-and-forget: ack first, a failed post is not
        // retried.
        self.ack(KIND_PUBLISH, id).await;

        let result = self.publish_post(&task).await;

        let emoji = match &result {
            Ok(()) => EMOJI_ARROW_UP,
            Err(e) => {
                error!(error = %e, "posting status failed");
                EMOJI_NEGATIVE
            }
        };

        if let Err(e) = self
            .observer
            .react(&task.message.channel_id, &task.message.message_id, emoji)
            .await
        {
            error!(error = %e, "reacting failed");
        }
    }

    async fn publish_post(&self, task: &PublishTask) -> Result<(), PipelineError> {
        let video_id = task
            .video_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();

        let thumb = self.client.thumb_info(&video_id).await?;
        let status = format!("{}\n{}", thumb.title, task.video_url);

        if task.preview {
            let base = Path::new(&task.file_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let uri = format!("{}/{base}", self.config.public_base);

            self.update_message(&task.message, &format!("```{status}```\n{uri}"))
                .await;
            return Ok(());
        }

        self.publisher
            .publish(&task.host, &task.auth, Path::new(&task.file_path), &status)
            .await?;

        Ok(())
    }
}

/// `1h`, `90m`-style rendering of the retention period.
fn humanize_period(period: Duration) -> String {
    let secs = period.as_secs();

    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_constraint() {
        assert!(valid_watch_url("https://www.nicovideo.jp/watch/sm9"));
        assert!(valid_watch_url("http://nicovideo.jp/watch/sm9"));
        assert!(valid_watch_url("https://sp.nicovideo.jp/watch/sm9"));

        assert!(!valid_watch_url("https://example.com/watch/sm9"));
        assert!(!valid_watch_url("ftp://nicovideo.jp/watch/sm9"));
        assert!(!valid_watch_url("https://nicovideo.jp.evil.com/watch/sm9"));
        assert!(!valid_watch_url("not a url"));
    }

    #[test]
    fn file_id_shapes() {
        assert_eq!(format_file_id("sm9", ""), "sm9-max");
        assert_eq!(format_file_id("sm9", "max"), "sm9-max");
        assert_eq!(format_file_id("sm9", "50M!"), "sm9-50M");
        assert_eq!(format_file_id("sm9", "v--a"), "sm9-v--a");
    }

    #[test]
    fn glob_find_skips_partials_and_subtitles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sm9-max-v--a.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("sm9-max-v--a.ja.ass"), b"x").unwrap();
        assert!(glob_find(dir.path(), "sm9-max").is_none());

        std::fs::write(dir.path().join("sm9-max-v--a.mp4"), b"x").unwrap();
        let found = glob_find(dir.path(), "sm9-max").unwrap();
        assert!(found.to_string_lossy().ends_with("sm9-max-v--a.mp4"));

        assert!(glob_find(dir.path(), "sm10-max").is_none());
    }

    #[test]
    fn subtitle_sibling_naming() {
        assert_eq!(
            subtitle_filename("/data/sm9-max.mp4", "ja"),
            "/data/sm9-max.ja.ass"
        );
    }

    #[tokio::test]
    async fn retry_stops_after_three_rapid_failures() {
        let mut attempts = 0u32;
        let result: Result<(), PipelineError> = try_perform(|| {
            attempts += 1;
            async { Err(PipelineError::Nico(NicoError::UnknownDeliveryMethod)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3); // rapid failures exhaust the retry budget
    }

    #[tokio::test]
    async fn retry_aborts_immediately_on_terminal_errors() {
        let mut attempts = 0u32;
        let result: Result<(), PipelineError> = try_perform(|| {
            attempts += 1;
            async { Err(PipelineError::Nico(NicoError::Cancelled)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn retry_aborts_on_deterministic_assembly_failures() {
        // Mismatched chunk counts cannot heal on retry.
        let mut attempts = 0u32;
        let result: Result<(), PipelineError> = try_perform(|| {
            attempts += 1;
            async {
                Err(PipelineError::Nico(NicoError::UnevenStreams {
                    audio: 2,
                    video: 3,
                }))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn period_rendering() {
        assert_eq!(humanize_period(Duration::from_secs(3600 * 24)), "24h");
        assert_eq!(humanize_period(Duration::from_secs(90 * 60)), "90m");
        assert_eq!(humanize_period(Duration::from_secs(45)), "45s");
    }
}
