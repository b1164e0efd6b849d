// The save contract: resolve, select, stage, dispatch, finalize.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use formats::{matches_human_size, select_format, strip_archive};
use mp4_fix::TrackMetadata;
use progress::{NullReport, Report};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::api::ApiData;
use crate::{Client, NicoError, dmc, dms};

/// Options for [`Client::save_format`].
pub struct SaveOptions {
    pub reporter: Arc<dyn Report>,
    /// Subtitle languages requested alongside the download. Handled by the
    /// caller; carried here so strategies can surface them in diagnostics.
    pub subtitles: Vec<String>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            reporter: Arc::new(NullReport),
            subtitles: Vec::new(),
        }
    }
}

/// Strips shell- and filesystem-hostile characters, bounds the name to 128
/// bytes and keeps it valid UTF-8.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '\0' | '"' | '\\' | '\'' | '!'))
        .collect();

    while out.len() > 128 {
        out.pop();
    }

    out
}

/// Builds the save path `<dir>/<video id>-<format name>.mp4`, leaving a
/// `${fmt}` placeholder for selector-style format names.
pub fn save_filepath(save_dir: &Path, watch_url: &str, format: &str) -> PathBuf {
    let name = match format {
        "" | "max" | "inf" => "max-${fmt}".to_owned(),
        f if matches_human_size(f) => format!("{}-${{fmt}}", sanitize_filename(f)),
        other => sanitize_filename(other),
    };

    let id = Url::parse(watch_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .unwrap_or_default();

    save_dir.join(format!("{id}-{name}.mp4"))
}

fn staging_path(out_path: &Path, reuse: bool) -> PathBuf {
    if reuse {
        let mut os = out_path.as_os_str().to_owned();
        os.push(".part");
        PathBuf::from(os)
    } else {
        out_path.to_owned()
    }
}

/// Seeds the staging file from a finished sibling of the same encoding so
/// retries with a different size selector resume instead of refetching.
async fn seed_from_sibling(
    file: &mut tokio::fs::File,
    out_path: &Path,
    fmt_name: &str,
) -> Result<(), NicoError> {
    let Some(dir) = out_path.parent() else {
        return Ok(());
    };
    let Some(base) = out_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };

    let id_prefix = match base.split_once('-') {
        Some((id, _)) => format!("{id}-"),
        None => return Ok(()),
    };
    let part_name = format!("{base}.part");

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        let candidate = name.starts_with(&id_prefix)
            && name.contains(&format!("-{fmt_name}"))
            && name.contains(".mp4")
            && name != base
            && name != part_name;

        if !candidate {
            continue;
        }

        let mut source = tokio::fs::File::open(entry.path()).await?;
        tokio::io::copy(&mut source, file).await?;

        debug!(seed = name, "staging file seeded from sibling");
        return Ok(());
    }

    Ok(())
}

impl Client {
    /// Lists the formats available for a watch URL.
    pub async fn list_formats(
        &self,
        url: &str,
        reporter: &Arc<dyn Report>,
    ) -> Result<Vec<formats::Format>, NicoError> {
        let data = self.fetch_api_data(url, reporter).await?;
        Ok(data.list_formats())
    }

    /// Downloads the selected format of `watch_url` into `out_path`
    /// (`${fmt}` expands to the resolved format name), returning the final
    /// file path.
    ///
    /// `reuse` stages into `<out>.part` and seeds from finished siblings;
    /// `cached` carries a previously fetched descriptor which is refreshed
    /// when stale.
    pub async fn save_format(
        &self,
        token: &CancellationToken,
        watch_url: &str,
        format_id: &str,
        out_path: &str,
        reuse: bool,
        cached: Option<&[u8]>,
        opts: &SaveOptions,
    ) -> Result<PathBuf, NicoError> {
        let reporter = &opts.reporter;

        let mut data: ApiData = cached
            .and_then(|raw| serde_json::from_slice(raw).ok())
            .unwrap_or_default();

        if data.is_stale(Utc::now()) {
            data = self.fetch_api_data(watch_url, reporter).await?;
        }

        let formats = data.list_formats();
        let selection = select_format(&formats, format_id)?;

        let fmt_name = format!(
            "{}--{}",
            strip_archive(&selection.video_id),
            strip_archive(&selection.audio_id)
        );

        let out_path = PathBuf::from(out_path.replace("${fmt}", &fmt_name));
        let staging = staging_path(&out_path, reuse);

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&staging)
            .await?;

        if reuse {
            seed_from_sibling(&mut file, &out_path, &fmt_name).await?;
        }

        let is_domand = !data.media.domand.access_right_key.is_empty();
        let has_session = !data.media.delivery.movie.session.urls.is_empty();

        // Child token: completing or failing the save stops the progress
        // loop and lets the DMC keepalive delete its session.
        let save_token = token.child_token();

        let result = if is_domand {
            dms::download_dms(
                self,
                &mut file,
                &staging,
                &data,
                &selection.audio_id,
                &selection.video_id,
                selection.duration.as_secs(),
                &save_token,
                reporter,
            )
            .await
        } else if has_session {
            dmc::download_dmc(
                self,
                &mut file,
                &staging,
                &data,
                &selection.audio_id,
                &selection.video_id,
                &save_token,
                reporter,
            )
            .await
        } else {
            Err(NicoError::UnknownDeliveryMethod)
        };

        save_token.cancel();
        drop(file);
        result?;

        if is_domand {
            self.finalize_domand(&staging, &out_path, &data).await?;
        } else if reuse {
            tokio::fs::rename(&staging, &out_path).await?;
        }

        info!(path = %out_path.display(), "download finished");

        Ok(out_path)
    }

    /// Rewrites the fragmented staging file into the progressive output and
    /// removes the staging file.
    async fn finalize_domand(
        &self,
        staging: &Path,
        out_path: &Path,
        data: &ApiData,
    ) -> Result<(), NicoError> {
        let metadata = TrackMetadata {
            copyright: Some(format!(
                "https://www.nicovideo.jp/watch/{}",
                data.video.id
            )),
            title: Some(data.video.title.clone()),
            comment: Some(data.video.description.clone()),
            date: Some(data.video.registered_at.clone()),
        };

        // Defragmenting the staging file onto itself would corrupt it.
        let same_file = staging == out_path;
        let target = if same_file {
            out_path.with_extension("mp4.tmp")
        } else {
            out_path.to_owned()
        };

        let staging = staging.to_owned();
        let source = staging.clone();
        let defrag_target = target.clone();

        tokio::task::spawn_blocking(move || -> Result<(), NicoError> {
            let mut src = std::fs::File::open(&source)?;
            let mut dst = std::fs::File::create(&defrag_target)?;
            mp4_fix::defragment(&mut src, &mut dst, &metadata)?;
            Ok(())
        })
        .await
        .map_err(|e| NicoError::protocol(format!("defragment task failed: {e}")))??;

        if same_file {
            tokio::fs::rename(&target, out_path).await?;
        } else {
            tokio::fs::remove_file(&staging).await.ok();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_and_bounds() {
        assert_eq!(sanitize_filename("a/b\\c\"d'e!f"), "abcdef");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");

        let long = "x".repeat(200);
        assert_eq!(sanitize_filename(&long).len(), 128);

        // Multi-byte characters are cut on a boundary.
        let wide = "あ".repeat(60); // 180 bytes
        let cut = sanitize_filename(&wide);
        assert!(cut.len() <= 128);
        assert!(cut.chars().all(|c| c == 'あ'));
    }

    #[test]
    fn save_filepath_shapes() {
        let dir = Path::new("/data");

        assert_eq!(
            save_filepath(dir, "https://www.nicovideo.jp/watch/sm9", "max"),
            Path::new("/data/sm9-max-${fmt}.mp4")
        );
        assert_eq!(
            save_filepath(dir, "https://www.nicovideo.jp/watch/sm9", "50M!"),
            Path::new("/data/sm9-50M-${fmt}.mp4")
        );
        assert_eq!(
            save_filepath(dir, "https://www.nicovideo.jp/watch/sm9", "v-720--a-192"),
            Path::new("/data/sm9-v-720--a-192.mp4")
        );
    }

    #[test]
    fn staging_only_when_reusing() {
        let out = Path::new("/data/sm9-max.mp4");
        assert_eq!(
            staging_path(out, true),
            Path::new("/data/sm9-max.mp4.part")
        );
        assert_eq!(staging_path(out, false), out);
    }
}
