use super::Fetcher;
use crate::errors::{AppError, Result};
use crate::retry::{retry, BackoffPolicy, RetryOptions};
use crate::search::SourceHandle;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Downloads audio via yt-dlp into a per-download temp directory, then
/// moves the result into place. Failures never leave a partial file at the
/// destination path.
pub struct YtDlpFetcher {
    ytdlp_path: String,
    audio_bitrate_kbps: u32,
    fetch_timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(audio_bitrate_kbps: u32, fetch_timeout: Duration) -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            audio_bitrate_kbps,
            fetch_timeout,
        }
    }

    pub fn with_ytdlp_path(mut self, path: String) -> Self {
        self.ytdlp_path = path;
        self
    }

    async fn run_ytdlp(&self, url: &str, output_template: &Path) -> Result<()> {
        let postprocessor_args = format!("ffmpeg:-b:a {}k", self.audio_bitrate_kbps);

        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.arg(url)
            .args(["-x", "-f", "bestaudio/best"])
            .args(["--audio-format", "mp3"])
            .args(["--audio-quality", "0"])
            .args(["--postprocessor-args", &postprocessor_args])
            .args(["-o", &output_template.to_string_lossy()])
            .args(["--no-playlist", "--no-warnings", "--quiet"])
            .args(["--concurrent-fragments", "8"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the caller drops this future, the child must not outlive it.
            .kill_on_drop(true);

        debug!("[FETCH] Running yt-dlp for {}", url);

        let child = cmd
            .spawn()
            .map_err(|e| AppError::Fetch(format!("Failed to start yt-dlp: {}", e)))?;

        let output = tokio::time::timeout(self.fetch_timeout, child.wait_with_output())
            .await
            .map_err(|_| AppError::Fetch(format!("Download timed out: {}", url)))?
            .map_err(|e| AppError::Fetch(format!("yt-dlp failed to run: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Fetch(format!("yt-dlp failed: {}", stderr)));
        }

        Ok(())
    }

    async fn find_downloaded_file(&self, temp_dir: &Path) -> Result<PathBuf> {
        let mut entries = tokio::fs::read_dir(temp_dir).await?;
        let mut fallback = None;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("mp3") => return Ok(path),
                Some("m4a" | "opus" | "webm" | "ogg" | "wav" | "flac") => {
                    fallback = Some(path);
                }
                _ => {}
            }
        }

        fallback.ok_or_else(|| {
            AppError::Fetch("No audio file found after download".to_string())
        })
    }
}

#[async_trait::async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, handle: &SourceHandle, dest: &Path) -> Result<()> {
        let output_dir = dest
            .parent()
            .ok_or_else(|| AppError::FatalIo("Invalid output path".to_string()))?;

        // Unique scratch directory per download so concurrent workers never
        // collide on yt-dlp's intermediate files.
        let temp_dir = output_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| AppError::FatalIo(format!("Cannot create temp directory: {}", e)))?;

        let template = temp_dir.join("audio.%(ext)s");
        let result = self.run_ytdlp(&handle.url, &template).await;

        let moved = match result {
            Ok(()) => {
                let downloaded = self.find_downloaded_file(&temp_dir).await;
                match downloaded {
                    Ok(source_file) => {
                        // Renames can fail transiently while an AV scanner or
                        // indexer holds the fresh file open.
                        let options =
                            RetryOptions::new(5, BackoffPolicy::Delay(Duration::from_millis(200)));
                        retry(options, "move downloaded file", || async {
                            tokio::fs::rename(&source_file, dest).await?;
                            Ok(())
                        })
                        .await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            warn!("[FETCH] Failed to remove temp directory {:?}: {}", temp_dir, e);
        }

        moved?;
        info!("[FETCH] Downloaded {} -> {:?}", handle.url, dest);
        Ok(())
    }
}
