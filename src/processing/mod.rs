pub mod ffmpeg;

pub use ffmpeg::FfmpegProcessor;

use crate::errors::Result;
use crate::spotify::TrackMetadata;
use std::path::Path;

/// Embeds tags and album art into a downloaded file, plus any configured
/// audio post-steps. Art or normalization failures degrade to warnings;
/// only a broken tag write fails the call.
#[async_trait::async_trait]
pub trait PostProcessor: Send + Sync {
    async fn tag(&self, path: &Path, metadata: &TrackMetadata) -> Result<()>;
}
