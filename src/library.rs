use crate::downloader::validate::Validator;
use crate::downloader::QualityThresholds;
use crate::errors::Result;
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "ogg", "opus", "wav"];

/// Per-file report row produced by a library scan.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub file_size: u64,
    pub bitrate_kbps: u32,
    pub duration_secs: Option<u64>,
    pub valid: bool,
    pub reason: Option<String>,
}

impl ReportEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Inspects every audio file in the directory against the quality
/// thresholds. A missing directory is an empty library, not an error.
pub async fn scan(dir: &Path, thresholds: QualityThresholds) -> Result<Vec<ReportEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let validator = Validator::new(thresholds);
    let mut entries = Vec::new();

    let mut dir_entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = dir_entries.next_entry().await? {
        let path = entry.path();
        if !is_audio_file(&path) {
            continue;
        }

        let validation = validator.validate(&path).await?;
        let duration_secs = if validation.passed {
            validator.probe_duration(&path).await.map(|d| d as u64)
        } else {
            None
        };

        entries.push(ReportEntry {
            path,
            file_size: validation.file_size,
            bitrate_kbps: validation.bitrate_kbps,
            duration_secs,
            valid: validation.passed,
            reason: validation.reason,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Removes files that fail validation, plus scratch directories abandoned
/// by interrupted downloads. Returns the number removed. Running it again
/// on a clean library removes nothing.
pub async fn cleanup(dir: &Path, thresholds: QualityThresholds) -> Result<usize> {
    let mut removed = 0;

    for entry in scan(dir, thresholds).await? {
        if entry.valid {
            continue;
        }
        info!(
            "[LIBRARY] Removing {:?}: {}",
            entry.path,
            entry.reason.as_deref().unwrap_or("failed validation")
        );
        tokio::fs::remove_file(&entry.path).await?;
        removed += 1;
    }

    removed += remove_stale_scratch_dirs(dir).await?;

    Ok(removed)
}

/// Fetch workers download into `.tmp-*` directories; one left behind means
/// a download was interrupted before its own cleanup ran.
async fn remove_stale_scratch_dirs(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;

    let mut dir_entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = dir_entries.next_entry().await? {
        let path = entry.path();
        let is_scratch = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(".tmp-"))
            .unwrap_or(false);
        if path.is_dir() && is_scratch {
            info!("[LIBRARY] Removing stale scratch directory {:?}", path);
            tokio::fs::remove_dir_all(&path).await?;
            removed += 1;
        }
    }

    Ok(removed)
}

fn is_audio_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    // Scratch files from in-flight downloads start with a dot.
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
    {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn thresholds() -> QualityThresholds {
        QualityThresholds {
            min_file_size_bytes: 10_000,
            min_bitrate_kbps: 0,
        }
    }

    fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        path
    }

    #[tokio::test]
    async fn scan_reports_valid_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "good.mp3", 50_000);
        write_file(dir.path(), "truncated.mp3", 500);
        write_file(dir.path(), "notes.txt", 500);

        let entries = scan(dir.path(), thresholds()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let good = entries.iter().find(|e| e.file_name() == "good.mp3").unwrap();
        assert!(good.valid);

        let bad = entries.iter().find(|e| e.file_name() == "truncated.mp3").unwrap();
        assert!(!bad.valid);
        assert!(bad.reason.as_deref().unwrap().contains("File size"));
    }

    #[tokio::test]
    async fn cleanup_removes_only_invalid_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(dir.path(), "good.mp3", 50_000);
        let bad = write_file(dir.path(), "truncated.mp3", 500);

        assert_eq!(cleanup(dir.path(), thresholds()).await.unwrap(), 1);
        assert!(good.exists());
        assert!(!bad.exists());

        assert_eq!(cleanup(dir.path(), thresholds()).await.unwrap(), 0);
        assert!(good.exists());
    }

    #[tokio::test]
    async fn missing_directory_scans_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = scan(&dir.path().join("nope"), thresholds()).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_abandoned_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(dir.path(), "good.mp3", 50_000);

        let scratch = dir.path().join(".tmp-5f3a1c2e");
        std::fs::create_dir(&scratch).unwrap();
        write_file(&scratch, "audio.mp3", 120_000);

        assert_eq!(cleanup(dir.path(), thresholds()).await.unwrap(), 1);
        assert!(!scratch.exists());
        assert!(good.exists());

        assert_eq!(cleanup(dir.path(), thresholds()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scratch_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), ".proc-abc.mp3", 500);

        let entries = scan(dir.path(), thresholds()).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(cleanup(dir.path(), thresholds()).await.unwrap(), 0);
    }
}
