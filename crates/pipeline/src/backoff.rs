// Typed accessor over the shared protocol backoff keys.
//
// The backoff state lives in the same key/value store as the task streams
// so every worker process observes the same window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tasklog::StreamStore;
use tracing::warn;

const KEY_BACKOFF: &str = "nico_backoff";
const KEY_BACKED: &str = "nico_backed";

pub struct BackoffGate {
    store: Arc<dyn StreamStore>,
    initial: Duration,
}

impl BackoffGate {
    pub fn new(store: Arc<dyn StreamStore>, initial: Duration) -> Self {
        BackoffGate { store, initial }
    }

    async fn current(&self) -> (Duration, DateTime<Utc>) {
        let backoff = match self.store.kv_get(KEY_BACKOFF).await {
            Ok(Some(raw)) => raw.parse().map(Duration::from_secs).unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let backed = match self.store.kv_get(KEY_BACKED).await {
            Ok(Some(raw)) => raw
                .parse::<DateTime<Utc>>()
                .unwrap_or(DateTime::UNIX_EPOCH),
            _ => DateTime::UNIX_EPOCH,
        };

        (backoff, backed)
    }

    /// Remaining backoff window, if one is in force.
    pub async fn remaining(&self) -> Option<Duration> {
        let (backoff, backed) = self.current().await;
        let until = backed + chrono::Duration::from_std(backoff).ok()?;
        let now = Utc::now();

        if until <= now {
            return None;
        }

        let remaining = (until - now).to_std().ok()?;
        warn!(?remaining, "awaiting protocol backoff");
        Some(remaining)
    }

    /// Doubles (or starts) the backoff window after a protocol failure.
    pub async fn record_failure(&self) {
        let (backoff, _) = self.current().await;

        let next = if backoff.is_zero() {
            self.initial
        } else {
            backoff * 2
        };

        let _ = self
            .store
            .kv_set(KEY_BACKOFF, &next.as_secs().to_string())
            .await;
        let _ = self
            .store
            .kv_set(KEY_BACKED, &Utc::now().to_rfc3339())
            .await;

        warn!(backoff_secs = next.as_secs(), "protocol backing off");
    }

    /// Clears the window after a successful round trip.
    pub async fn record_success(&self) {
        let _ = self.store.kv_set(KEY_BACKOFF, "").await;
        let _ = self.store.kv_set(KEY_BACKED, "").await;
    }
}

#[cfg(test)]
mod tests {
    use tasklog::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn failure_starts_then_doubles_window() {
        let store: Arc<dyn StreamStore> = Arc::new(MemoryStore::new());
        let gate = BackoffGate::new(store.clone(), Duration::from_secs(60));

        assert!(gate.remaining().await.is_none());

        gate.record_failure().await;
        let first = gate.remaining().await.expect("window in force");
        assert!(first <= Duration::from_secs(60));

        gate.record_failure().await;
        let doubled = store.kv_get("nico_backoff").await.unwrap().unwrap();
        assert_eq!(doubled, "120");

        gate.record_success().await;
        assert!(gate.remaining().await.is_none());
    }
}
