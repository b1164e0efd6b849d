// DMS strategy: segmented HLS-style delivery with encrypted chunks.
//
// The access-rights handshake yields a master playlist; audio and video
// media playlists are reduced to chunk plans of equal length. Two fetch
// workers service a chunk channel; each (video, audio) pair is combined
// into one multi-track piece of the staging file, followed by a 16-byte
// resume trailer that the next chunk overwrites.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use hls::{ChunkPlan, MediaChunk, SegmentDecryptor};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::api::ApiData;
use crate::progress_loop::report_progress;
use crate::{Client, NicoError, Reporter};

const TRAILER_LEN: i64 = 16;
const TRAILER_MAGIC: &[u8; 4] = b"1919";
const FETCH_WORKERS: usize = 2;

struct ChunkJob {
    url: Url,
    decryptor: Option<SegmentDecryptor>,
    done: oneshot::Sender<Result<Vec<u8>, NicoError>>,
}

async fn fetch_chunk(
    http: &reqwest::Client,
    url: &Url,
    decryptor: Option<&SegmentDecryptor>,
) -> Result<Vec<u8>, NicoError> {
    let mut data = http
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?
        .to_vec();

    if let Some(decryptor) = decryptor {
        // Decryption is CPU work; keep it off the fetch executor.
        let decryptor = decryptor.clone();
        data = tokio::task::spawn_blocking(move || {
            decryptor.decrypt(&mut data).map(|()| data)
        })
        .await
        .map_err(|e| NicoError::protocol(format!("decryption task failed: {e}")))??;
    }

    Ok(data)
}

async fn chunk_worker(
    http: reqwest::Client,
    work: Arc<Mutex<mpsc::Receiver<ChunkJob>>>,
    token: CancellationToken,
) {
    loop {
        let job = {
            let mut work = work.lock().await;
            tokio::select! {
                job = work.recv() => job,
                _ = token.cancelled() => None,
            }
        };

        let Some(job) = job else {
            return;
        };

        let result = tokio::select! {
            result = fetch_chunk(&http, &job.url, job.decryptor.as_ref()) => result,
            _ = token.cancelled() => Err(NicoError::Cancelled),
        };

        let _ = job.done.send(result);
    }
}

fn resolve(base: &Url, href: &str) -> Result<Url, NicoError> {
    base.join(href)
        .map_err(|e| NicoError::protocol(format!("cannot resolve `{href}`: {e}")))
}

fn trailer(index: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    BigEndian::write_u32(&mut out[0..4], TRAILER_LEN as u32);
    out[4..8].copy_from_slice(TRAILER_MAGIC);
    BigEndian::write_u64(&mut out[8..16], index);
    out
}

/// Reads the resume trailer, if the file ends with one, and positions the
/// file accordingly. Returns the chunk index to start from.
async fn resume_index(file: &mut tokio::fs::File) -> Result<usize, NicoError> {
    let size = file.seek(SeekFrom::End(0)).await?;

    if size > TRAILER_LEN as u64 {
        file.seek(SeekFrom::End(-TRAILER_LEN)).await?;

        let mut buf = [0u8; 16];
        file.read_exact(&mut buf).await?;

        if BigEndian::read_u32(&buf[0..4]) == TRAILER_LEN as u32 && &buf[4..8] == TRAILER_MAGIC {
            return Ok(BigEndian::read_u64(&buf[8..16]) as usize + 1);
        }

        file.seek(SeekFrom::Start(0)).await?;
    }

    Ok(0)
}

impl Client {
    /// Performs the access-rights handshake, returning the master playlist
    /// URL.
    async fn access_rights(
        &self,
        data: &ApiData,
        audio_id: &str,
        video_id: &str,
    ) -> Result<String, NicoError> {
        let url = format!(
            "{}/v1/watch/{}/access-rights/hls?actionTrackId={}",
            self.config.watch_api_base, data.client.watch_id, data.client.watch_track_id
        );

        #[derive(Deserialize)]
        struct Envelope {
            data: EnvelopeData,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct EnvelopeData {
            content_url: String,
        }

        let body = serde_json::json!({ "outputs": [[video_id, audio_id]] });

        let envelope: Envelope = self
            .http
            .post(&url)
            .header("x-access-right-key", &data.media.domand.access_right_key)
            .header("x-frontend-id", "6")
            .header("x-frontend-version", "0")
            .header("x-request-with", "https://www.nicovideo.jp")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(envelope.data.content_url)
    }

    async fn chunk_plan(&self, playlist_url: &Url) -> Result<ChunkPlan, NicoError> {
        let body = self.get_bytes(playlist_url.as_str()).await?;
        Ok(hls::parse_media(&body)?)
    }

    async fn plan_decryptor(
        &self,
        playlist_url: &Url,
        plan: &ChunkPlan,
    ) -> Result<Option<SegmentDecryptor>, NicoError> {
        let Some(key) = &plan.key else {
            return Ok(None);
        };

        let key_url = resolve(playlist_url, &key.url)?;
        let key_bytes = self.get_bytes(key_url.as_str()).await?;

        Ok(Some(SegmentDecryptor::new(&key_bytes, key.iv)?))
    }
}

struct StreamPlan {
    playlist_url: Url,
    plan: ChunkPlan,
    decryptor: Option<SegmentDecryptor>,
}

impl StreamPlan {
    fn job(
        &self,
        chunk: &MediaChunk,
        done: oneshot::Sender<Result<Vec<u8>, NicoError>>,
    ) -> Result<ChunkJob, NicoError> {
        Ok(ChunkJob {
            url: resolve(&self.playlist_url, &chunk.url)?,
            decryptor: (!chunk.is_init)
                .then(|| self.decryptor.clone())
                .flatten(),
            done,
        })
    }
}

/// Downloads the segmented rendition into the staging file, resuming from
/// the recorded chunk index.
pub(crate) async fn download_dms(
    client: &Client,
    file: &mut tokio::fs::File,
    path: &Path,
    data: &ApiData,
    audio_id: &str,
    video_id: &str,
    duration_secs: u64,
    token: &CancellationToken,
    reporter: &Reporter,
) -> Result<(), NicoError> {
    let content_url = client.access_rights(data, audio_id, video_id).await?;
    let master_url = Url::parse(&content_url)
        .map_err(|e| NicoError::protocol(format!("bad master playlist url: {e}")))?;

    let master = hls::parse_master(&client.get_bytes(master_url.as_str()).await?)?;

    let audio_url = resolve(&master_url, &master.audio_url)?;
    let video_url = resolve(&master_url, &master.video_url)?;

    let audio_plan = client.chunk_plan(&audio_url).await?;
    let video_plan = client.chunk_plan(&video_url).await?;

    if audio_plan.len() != video_plan.len() {
        return Err(NicoError::UnevenStreams {
            audio: audio_plan.len(),
            video: video_plan.len(),
        });
    }

    let audio = StreamPlan {
        decryptor: client.plan_decryptor(&audio_url, &audio_plan).await?,
        playlist_url: audio_url,
        plan: audio_plan,
    };
    let video = StreamPlan {
        decryptor: client.plan_decryptor(&video_url, &video_plan).await?,
        playlist_url: video_url,
        plan: video_plan,
    };

    let (work_tx, work_rx) = mpsc::channel::<ChunkJob>(FETCH_WORKERS);
    let work_rx = Arc::new(Mutex::new(work_rx));

    for _ in 0..FETCH_WORKERS {
        tokio::spawn(chunk_worker(
            client.http.clone(),
            work_rx.clone(),
            token.clone(),
        ));
    }

    let estimate = master.average_bandwidth * duration_secs / 8;
    tokio::spawn(report_progress(
        path.to_owned(),
        estimate,
        reporter.clone(),
        token.clone(),
    ));

    let start = resume_index(file).await?;
    if start > 0 {
        debug!(start, "resuming segmented download");
    }

    for index in start..video.plan.len() {
        if index > 0 {
            file.seek(SeekFrom::End(-TRAILER_LEN)).await?;
        }

        let video_chunk = &video.plan.chunks[index];
        let audio_chunk = &audio.plan.chunks[index];

        let (video_done, video_result) = oneshot::channel();
        let (audio_done, audio_result) = oneshot::channel();

        for job in [
            video.job(video_chunk, video_done)?,
            audio.job(audio_chunk, audio_done)?,
        ] {
            if work_tx.send(job).await.is_err() {
                return Err(NicoError::Cancelled);
            }
        }

        let recv = |done: oneshot::Receiver<Result<Vec<u8>, NicoError>>| async move {
            done.await.map_err(|_| NicoError::Cancelled)?
        };

        let video_data = tokio::select! {
            result = recv(video_result) => result?,
            _ = token.cancelled() => return Err(NicoError::Cancelled),
        };
        let audio_data = tokio::select! {
            result = recv(audio_result) => result?,
            _ = token.cancelled() => return Err(NicoError::Cancelled),
        };

        let parts = [Bytes::from(video_data), Bytes::from(audio_data)];

        let combined = if video_chunk.is_init {
            mp4box::combine_init_segments(&parts)?
        } else {
            mp4box::combine_media_segments(&parts)?
        };

        file.write_all(&combined).await?;
        file.write_all(&trailer(index as u64)).await?;
        file.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests;
