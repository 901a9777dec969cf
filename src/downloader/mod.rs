pub mod coordinator;
pub mod validate;
pub mod ytdlp;

use crate::errors::Result;
use crate::search::SourceHandle;
use crate::spotify::TrackMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One track-level unit of work within a job. Owned exclusively by a single
/// worker while an attempt is in flight; hand-off happens only at the
/// Pending boundary.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub id: String,
    pub metadata: TrackMetadata,
    pub source: Option<SourceHandle>,
    pub output_path: Option<PathBuf>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl DownloadItem {
    pub fn new(metadata: TrackMetadata) -> Self {
        Self {
            id: metadata.track_id.clone(),
            metadata,
            source: None,
            output_path: None,
            status: ItemStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Resolving,
    Fetching,
    Validating,
    Complete,
    Failed,
    Cancelled,
}

/// The full set of items requested together.
#[derive(Debug)]
pub struct DownloadJob {
    pub items: Vec<DownloadItem>,
    pub workers: usize,
    pub output_dir: PathBuf,
    pub thresholds: QualityThresholds,
}

impl DownloadJob {
    pub fn new(tracks: Vec<TrackMetadata>, output_dir: PathBuf) -> Self {
        Self {
            items: tracks.into_iter().map(DownloadItem::new).collect(),
            workers: 4,
            output_dir,
            thresholds: QualityThresholds::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: QualityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Minimum acceptable file size / bitrate for a downloaded file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_file_size_bytes: u64,
    pub min_bitrate_kbps: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 500_000,
            min_bitrate_kbps: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub file_size: u64,
    pub bitrate_kbps: u32,
    pub reason: Option<String>,
}

/// Final per-item outcome reported when the job finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub status: ItemStatus,
    pub title: String,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Aggregate result of a job: every item ends up here as Complete, Failed
/// or Cancelled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub outcomes: HashMap<String, ItemOutcome>,
}

impl JobResult {
    pub fn complete_count(&self) -> usize {
        self.count(ItemStatus::Complete)
    }

    pub fn failed_count(&self) -> usize {
        self.count(ItemStatus::Failed)
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(ItemStatus::Cancelled)
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }
}

/// Retrieves raw audio for a resolved source handle to a local path.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, handle: &SourceHandle, dest: &Path) -> Result<()>;
}
