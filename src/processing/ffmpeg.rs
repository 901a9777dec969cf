use super::PostProcessor;
use crate::errors::{AppError, Result};
use crate::spotify::TrackMetadata;
use log::{debug, info, warn};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(120);
const ART_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// ffmpeg-backed post-processor: ID3 tags, album art, optional loudness
/// normalization.
pub struct FfmpegProcessor {
    ffmpeg_path: String,
    client: reqwest::Client,
    normalize: bool,
    target_bitrate_kbps: u32,
}

impl FfmpegProcessor {
    pub fn new(target_bitrate_kbps: u32, normalize: bool) -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            client: reqwest::Client::builder()
                .timeout(ART_DOWNLOAD_TIMEOUT)
                .user_agent("spotify-dl/1.0")
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            normalize,
            target_bitrate_kbps,
        }
    }

    pub fn with_ffmpeg_path(mut self, path: String) -> Self {
        self.ffmpeg_path = path;
        self
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<()> {
        let child = Command::new(&self.ffmpeg_path)
            .args(["-y", "-loglevel", "error"])
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Processing(format!("Failed to start ffmpeg: {}", e)))?;

        let output = tokio::time::timeout(FFMPEG_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| AppError::Processing("ffmpeg timed out".to_string()))?
            .map_err(|e| AppError::Processing(format!("ffmpeg failed to run: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Processing(format!("ffmpeg failed: {}", stderr)));
        }

        Ok(())
    }

    /// Rewrites the file in place through a sibling temp path.
    async fn rewrite(&self, path: &Path, mid_args: Vec<String>) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| AppError::Processing("Invalid file path".to_string()))?;
        let temp_out = dir.join(format!(".proc-{}.mp3", uuid::Uuid::new_v4()));

        let mut args = vec!["-i".to_string(), path.to_string_lossy().to_string()];
        args.extend(mid_args);
        args.push(temp_out.to_string_lossy().to_string());

        match self.run_ffmpeg(args).await {
            Ok(()) => {
                tokio::fs::rename(&temp_out, path).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_out).await;
                Err(e)
            }
        }
    }

    async fn download_art(&self, art_url: &str) -> Result<tempfile::NamedTempFile> {
        let response = self.client.get(art_url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Processing(format!(
                "Album art download returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;

        let file = tempfile::Builder::new().suffix(".jpg").tempfile()?;
        tokio::fs::write(file.path(), &bytes).await?;
        debug!("[EMBED] Downloaded {} bytes of album art", bytes.len());
        Ok(file)
    }

    fn tag_args(metadata: &TrackMetadata, art_path: Option<&Path>) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(art) = art_path {
            args.push("-i".to_string());
            args.push(art.to_string_lossy().to_string());
            args.extend(["-map", "0:a", "-map", "1:0"].map(String::from));
        } else {
            args.extend(["-map", "0:a"].map(String::from));
        }

        args.extend(["-c", "copy", "-id3v2_version", "3"].map(String::from));
        args.push("-metadata".to_string());
        args.push(format!("title={}", metadata.name));
        args.push("-metadata".to_string());
        args.push(format!("artist={}", metadata.artist));
        args.push("-metadata".to_string());
        args.push(format!("album={}", metadata.album));

        if let Some(release_date) = &metadata.release_date {
            if let Some(year) = release_date.split('-').next() {
                args.push("-metadata".to_string());
                args.push(format!("date={}", year));
            }
        }

        if art_path.is_some() {
            args.extend(
                [
                    "-metadata:s:v",
                    "title=Album cover",
                    "-metadata:s:v",
                    "comment=Cover (front)",
                    "-disposition:v",
                    "attached_pic",
                ]
                .map(String::from),
            );
        }

        args
    }

    async fn embed_tags(&self, path: &Path, metadata: &TrackMetadata) -> Result<()> {
        // Art failures fall back to a tags-only write.
        let art_file = match &metadata.album_art_url {
            Some(url) => match self.download_art(url).await {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("[EMBED] Failed to download album art: {}", e);
                    None
                }
            },
            None => None,
        };

        let args = Self::tag_args(metadata, art_file.as_ref().map(|f| f.path()));
        self.rewrite(path, args).await?;

        info!("[EMBED] Embedded metadata: {}", metadata.filename());
        Ok(())
    }

    async fn normalize_audio(&self, path: &Path) -> Result<()> {
        self.rewrite(
            path,
            vec![
                "-af".to_string(),
                "loudnorm=I=-16:TP=-1.5:LRA=11".to_string(),
                "-b:a".to_string(),
                format!("{}k", self.target_bitrate_kbps),
            ],
        )
        .await
    }
}

#[async_trait::async_trait]
impl PostProcessor for FfmpegProcessor {
    async fn tag(&self, path: &Path, metadata: &TrackMetadata) -> Result<()> {
        if !path.exists() {
            return Err(AppError::Processing(format!("File does not exist: {:?}", path)));
        }

        self.embed_tags(path, metadata).await?;

        if self.normalize {
            if let Err(e) = self.normalize_audio(path).await {
                warn!("[EMBED] Audio normalization failed: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> TrackMetadata {
        TrackMetadata {
            track_id: "abc".to_string(),
            name: "One More Time".to_string(),
            artist: "Daft Punk".to_string(),
            album: "Discovery".to_string(),
            album_art_url: None,
            isrc: None,
            duration_ms: 320_000,
            release_date: Some("2001-03-07".to_string()),
        }
    }

    #[test]
    fn tag_args_without_art() {
        let args = FfmpegProcessor::tag_args(&test_metadata(), None);
        assert!(args.contains(&"title=One More Time".to_string()));
        assert!(args.contains(&"artist=Daft Punk".to_string()));
        assert!(args.contains(&"album=Discovery".to_string()));
        assert!(args.contains(&"date=2001".to_string()));
        assert!(!args.contains(&"attached_pic".to_string()));
    }

    #[test]
    fn tag_args_with_art_maps_cover_stream() {
        let args = FfmpegProcessor::tag_args(&test_metadata(), Some(Path::new("/tmp/cover.jpg")));
        assert!(args.contains(&"/tmp/cover.jpg".to_string()));
        assert!(args.contains(&"attached_pic".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "-map").count(), 2);
    }

    #[tokio::test]
    async fn tagging_missing_file_errors() {
        let processor = FfmpegProcessor::new(320, false);
        let result = processor.tag(Path::new("/nonexistent/file.mp3"), &test_metadata()).await;
        assert!(matches!(result, Err(AppError::Processing(_))));
    }
}
