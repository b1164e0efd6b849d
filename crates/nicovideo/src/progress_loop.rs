// Once-a-second download progress derived from the growing file.

use std::path::PathBuf;
use std::time::Duration;

use formats::human_size_format;
use tokio_util::sync::CancellationToken;

use crate::Reporter;

/// Stats the file every second and reports percentage, speed and ETA.
pub(crate) async fn report_progress(
    path: PathBuf,
    total: u64,
    reporter: Reporter,
    token: CancellationToken,
) {
    let Ok(meta) = tokio::fs::metadata(&path).await else {
        return;
    };
    let mut last_size = meta.len();

    let total_human = human_size_format(total as f64);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = token.cancelled() => return,
        }

        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return;
        };

        let size = meta.len();
        let diff = size.saturating_sub(last_size);
        last_size = size;

        if diff == 0 {
            continue;
        }

        let percent = (size as f64 / total as f64 * 100.0).min(100.0);
        let speed = human_size_format(diff as f64);
        let remain = total.saturating_sub(size) / diff;
        let (minutes, seconds) = (remain / 60, remain % 60);

        reporter.submit(
            &format!("{percent:2.1}% of {total_human} at {speed}/s ETA {minutes:02}:{seconds:02}"),
            false,
        );
    }
}
