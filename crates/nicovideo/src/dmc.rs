// DMC strategy: one ranged HTTP download with session keepalive.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ApiData;
use crate::progress_loop::report_progress;
use crate::{Client, NicoError, Reporter};

fn content_range_total(response: &reqwest::Response) -> Result<u64, NicoError> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| NicoError::protocol("invalid session: no content-range"))?;

    let (_, total) = header
        .rsplit_once('/')
        .ok_or_else(|| NicoError::protocol("invalid session: malformed content-range"))?;

    total
        .trim()
        .parse()
        .map_err(|_| NicoError::protocol("invalid session: malformed content-range"))
}

/// Streams the progressive rendition into `file`, resuming from its
/// current length.
pub(crate) async fn download_dmc(
    client: &Client,
    file: &mut tokio::fs::File,
    path: &Path,
    data: &ApiData,
    audio_id: &str,
    video_id: &str,
    token: &CancellationToken,
    reporter: &Reporter,
) -> Result<(), NicoError> {
    let session = &data.media.delivery.movie.session;
    let dmc = client.create_session(session, audio_id, video_id).await?;

    let size = file.seek(SeekFrom::End(0)).await?;

    let mut response = client
        .http
        .get(&dmc.content_uri)
        .header(reqwest::header::RANGE, format!("bytes={size}-"))
        .send()
        .await?;

    let total = content_range_total(&response)?;

    // The keepalive owns the session teardown: cancelling the token makes
    // it DELETE the server-side session under its own 60 s budget.
    {
        let client = client.clone();
        let session = session.clone();
        let token = token.clone();
        let reporter = reporter.clone();
        tokio::spawn(async move {
            client.session_keepalive(&session, dmc, token, reporter).await;
        });
    }

    if total == size {
        debug!(total, "file already complete");
        return Ok(());
    }

    tokio::spawn(report_progress(
        path.to_owned(),
        total,
        reporter.clone(),
        token.clone(),
    ));

    loop {
        let chunk = tokio::select! {
            chunk = response.chunk() => chunk?,
            _ = token.cancelled() => return Err(NicoError::Cancelled),
        };

        let Some(chunk) = chunk else {
            break;
        };

        file.write_all(&chunk).await?;
    }

    file.flush().await?;

    Ok(())
}
