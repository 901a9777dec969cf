use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub min_file_size_bytes: u64,
    pub min_bitrate_kbps: u32,
    pub preferred_quality: AudioQuality,
    pub fetch_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub normalize: bool,
    /// Resolved through PATH unless overridden with an absolute path.
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AudioQuality {
    Low,    // 128 kbps
    Medium, // 192 kbps
    High,   // 256 kbps
    Best,   // 320 kbps
}

impl AudioQuality {
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            AudioQuality::Low => 128,
            AudioQuality::Medium => 192,
            AudioQuality::High => 256,
            AudioQuality::Best => 320,
        }
    }
}

impl std::str::FromStr for AudioQuality {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(AudioQuality::Low),
            "medium" => Ok(AudioQuality::Medium),
            "high" => Ok(AudioQuality::High),
            "best" => Ok(AudioQuality::Best),
            other => Err(AppError::InvalidInput(format!(
                "Unknown quality '{}'. Valid values: low, medium, high, best",
                other
            ))),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            max_workers: 4,
            max_attempts: 3,
            min_file_size_bytes: 500_000,
            min_bitrate_kbps: 128,
            preferred_quality: AudioQuality::Best,
            fetch_timeout_secs: 300,
            search_timeout_secs: 30,
            normalize: false,
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let config_dir = config_path
            .parent()
            .ok_or_else(|| AppError::Config("Invalid config path".to_string()))?;

        if !config_dir.exists() {
            std::fs::create_dir_all(config_dir)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("spotify-dl").join("config.json"))
    }
}
