//! Rate-limited diagnostic reporting from long-running operations.
//!
//! A [`Reporter`] bridges a worker and whatever surface displays its
//! progress. Messages submitted faster than the configured rate are dropped,
//! and delivery never blocks the producer: a slow or absent consumer must
//! not stall a download. `force` bypasses the rate limiter (but not the
//! bounded buffer).

use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tracing::trace;

/// Sink for worker diagnostics.
#[async_trait]
pub trait Report: Send + Sync {
    /// Submits a message; dropped when rate-limited or the buffer is full.
    fn submit(&self, msg: &str, force: bool);

    /// Whether [`Report::read_line`] can produce input (interactive runs).
    fn can_read(&self) -> bool {
        false
    }

    /// Reads one line of user input. Only meaningful when [`Report::can_read`]
    /// returns true.
    async fn read_line(&self) -> io::Result<String> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no input source"))
    }
}

/// Discards everything. For fire-and-forget callers.
pub struct NullReport;

#[async_trait]
impl Report for NullReport {
    fn submit(&self, _msg: &str, _force: bool) {}
}

struct Limiter {
    rate: Duration,
    last: Option<Instant>,
    acc: Duration,
}

impl Limiter {
    /// Cooperative limiter: elapsed time accumulates between submissions and
    /// a message passes once the accumulator reaches `rate`.
    fn admit(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let elapsed = match self.last.replace(now) {
            Some(last) => now.duration_since(last),
            None => self.rate,
        };

        self.acc += elapsed;

        if self.acc < self.rate {
            return force;
        }

        self.acc = Duration::ZERO;
        true
    }
}

struct Shared {
    limiter: Mutex<Limiter>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

/// Channel-backed [`Report`] implementation.
pub struct Reporter {
    shared: Shared,
    stdin: Option<tokio::sync::Mutex<BufReader<Stdin>>>,
}

impl Reporter {
    /// Creates a reporter delivering at most one message per `rate` into a
    /// buffer of `capacity`. The receiver side is returned alongside.
    pub fn channel(rate: Duration, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);

        let reporter = Reporter {
            shared: Shared {
                limiter: Mutex::new(Limiter {
                    rate,
                    last: None,
                    acc: Duration::ZERO,
                }),
                tx: Mutex::new(Some(tx)),
            },
            stdin: None,
        };

        (reporter, rx)
    }

    /// Attaches the process stdin so interactive prompts can read input.
    pub fn with_stdin(mut self) -> Self {
        self.stdin = Some(tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin())));
        self
    }

    /// Closes the channel; later submissions become no-ops. Idempotent.
    pub fn close(&self) {
        self.shared.tx.lock().unwrap().take();
    }
}

#[async_trait]
impl Report for Reporter {
    fn submit(&self, msg: &str, force: bool) {
        if !self.shared.limiter.lock().unwrap().admit(force) {
            return;
        }

        let tx = self.shared.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return;
        };

        if tx.try_send(msg.to_owned()).is_err() {
            trace!(msg, "progress message dropped");
        }
    }

    fn can_read(&self) -> bool {
        self.stdin.is_some()
    }

    async fn read_line(&self) -> io::Result<String> {
        let Some(stdin) = &self.stdin else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no input source"));
        };

        let mut line = String::new();
        stdin.lock().await.read_line(&mut line).await?;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_message_passes_and_burst_is_limited() {
        let (reporter, mut rx) = Reporter::channel(Duration::from_secs(10), 4);

        reporter.submit("one", false);
        reporter.submit("two", false);
        reporter.submit("three", false);

        assert_eq!(rx.try_recv().unwrap(), "one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn force_bypasses_rate_limit() {
        let (reporter, mut rx) = Reporter::channel(Duration::from_secs(10), 4);

        reporter.submit("one", false);
        reporter.submit("urgent", true);

        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "urgent");
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (reporter, mut rx) = Reporter::channel(Duration::ZERO, 1);

        reporter.submit("kept", true);
        reporter.submit("dropped", true);

        assert_eq!(rx.try_recv().unwrap(), "kept");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let (reporter, mut rx) = Reporter::channel(Duration::ZERO, 1);

        reporter.close();
        reporter.close();
        reporter.submit("late", true);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reporter_without_stdin_cannot_read() {
        let (reporter, _rx) = Reporter::channel(Duration::ZERO, 1);
        assert!(!reporter.can_read());
        assert!(reporter.read_line().await.is_err());
    }
}
