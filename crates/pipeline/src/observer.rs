// The narrow seam to whatever chat surface displays task progress.

use async_trait::async_trait;
use tracing::info;

pub const EMOJI_STOP: &str = "\u{23f9}";
pub const EMOJI_ARROW_UP: &str = "\u{2b06}";
pub const EMOJI_NEGATIVE: &str = "\u{274c}";

#[derive(Debug, thiserror::Error)]
#[error("observer error: {reason}")]
pub struct ObserverError {
    pub reason: String,
}

/// User-visible side effects of the worker loops.
///
/// Implemented by the chat collaborator; the pipeline only ever edits the
/// originating message and toggles reactions on it.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ObserverError>;

    async fn react(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ObserverError>;

    async fn unreact(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ObserverError>;
}

/// Observer that just logs, for headless runs.
pub struct TracingObserver;

#[async_trait]
impl Observer for TracingObserver {
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ObserverError> {
        info!(channel_id, message_id, text, "message update");
        Ok(())
    }

    async fn react(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ObserverError> {
        info!(channel_id, message_id, emoji, "reaction added");
        Ok(())
    }

    async fn unreact(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ObserverError> {
        info!(channel_id, message_id, emoji, "reaction removed");
        Ok(())
    }
}
