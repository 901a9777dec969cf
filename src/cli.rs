use crate::config::{AppConfig, AudioQuality};
use crate::downloader::coordinator::Coordinator;
use crate::downloader::ytdlp::YtDlpFetcher;
use crate::downloader::{DownloadJob, ItemStatus, JobResult, QualityThresholds};
use crate::errors::Result;
use crate::library;
use crate::processing::FfmpegProcessor;
use crate::search::YtDlpResolver;
use crate::server::{self, AppState};
use crate::spotify::SpotifyClient;
use crate::utils::{format_duration_ms, format_file_size};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "spotify-dl", version, about = "Download Spotify tracks, playlists and albums")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output directory (overrides the configured default)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Audio quality: low, medium, high, best
    #[arg(short, long, global = true, value_parser = parse_quality)]
    pub quality: Option<AudioQuality>,

    /// Apply loudness normalization after download
    #[arg(long, global = true)]
    pub normalize: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download a single track
    Track {
        /// Spotify track URL, URI or id
        url: String,
    },
    /// Download all tracks in a playlist
    Playlist {
        /// Spotify playlist URL, URI or id
        url: String,
        /// Concurrent download workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Download all tracks on an album
    Album {
        /// Spotify album URL, URI or id
        url: String,
        /// Concurrent download workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Report on the downloaded library
    Info {
        /// Directory to inspect (defaults to the output directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Remove files that fail quality validation
    Cleanup {
        /// Directory to clean (defaults to the output directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Run the HTTP API
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn parse_quality(value: &str) -> std::result::Result<AudioQuality, String> {
    value.parse().map_err(|e| format!("{}", e))
}

/// Runs the parsed command. Returns the process exit code: zero only when
/// every requested item succeeded.
pub async fn run(cli: Cli, mut config: AppConfig) -> Result<i32> {
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    if let Some(quality) = cli.quality {
        config.preferred_quality = quality;
    }
    if cli.normalize {
        config.normalize = true;
    }

    match cli.command {
        Command::Track { url } => {
            let spotify = SpotifyClient::from_env()?;
            let tracks = vec![spotify.get_track(&url).await?];
            download(tracks, &config, 1).await
        }
        Command::Playlist { url, workers } => {
            let spotify = SpotifyClient::from_env()?;
            let tracks = spotify.get_playlist_tracks(&url).await?;
            download(tracks, &config, workers.unwrap_or(config.max_workers)).await
        }
        Command::Album { url, workers } => {
            let spotify = SpotifyClient::from_env()?;
            let tracks = spotify.get_album_tracks(&url).await?;
            download(tracks, &config, workers.unwrap_or(config.max_workers)).await
        }
        Command::Info { dir } => {
            let dir = dir.unwrap_or_else(|| config.output_dir.clone());
            let entries = library::scan(&dir, thresholds(&config)).await?;
            if entries.is_empty() {
                println!("No audio files in {:?}", dir);
            } else {
                print_library_table(&entries);
            }
            Ok(0)
        }
        Command::Cleanup { dir } => {
            let dir = dir.unwrap_or_else(|| config.output_dir.clone());
            let removed = library::cleanup(&dir, thresholds(&config)).await?;
            println!("Removed {} invalid file(s) from {:?}", removed, dir);
            Ok(0)
        }
        Command::Serve { port } => {
            let spotify = SpotifyClient::from_env()?;
            server::serve(AppState::new(spotify, config), port).await?;
            Ok(0)
        }
    }
}

fn thresholds(config: &AppConfig) -> QualityThresholds {
    QualityThresholds {
        min_file_size_bytes: config.min_file_size_bytes,
        min_bitrate_kbps: config.min_bitrate_kbps,
    }
}

async fn download(
    tracks: Vec<crate::spotify::TrackMetadata>,
    config: &AppConfig,
    workers: usize,
) -> Result<i32> {
    if tracks.is_empty() {
        println!("Nothing to download.");
        return Ok(0);
    }
    let total = tracks.len();
    println!("Downloading {} track(s) to {:?}", total, config.output_dir);

    let bitrate = config.preferred_quality.bitrate_kbps();
    let coordinator = Coordinator::new(
        Arc::new(
            YtDlpResolver::new(Duration::from_secs(config.search_timeout_secs))
                .with_ytdlp_path(config.ytdlp_path.clone()),
        ),
        Arc::new(
            YtDlpFetcher::new(bitrate, Duration::from_secs(config.fetch_timeout_secs))
                .with_ytdlp_path(config.ytdlp_path.clone()),
        ),
        Arc::new(
            FfmpegProcessor::new(bitrate, config.normalize)
                .with_ffmpeg_path(config.ffmpeg_path.clone()),
        ),
        config.max_attempts,
    )
    .with_timeouts(
        Duration::from_secs(config.search_timeout_secs * 6),
        Duration::from_secs(config.fetch_timeout_secs),
    );

    // Ctrl-C stops new items; in-flight downloads finish.
    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[CLI] Interrupt received, finishing in-flight downloads");
            cancel.cancel();
        }
    });

    let progress = coordinator.progress();
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let bar_task = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let snapshot = progress.snapshot().await;
                bar.set_position(snapshot.done() as u64);
                if let Some(message) = snapshot.messages.values().next() {
                    bar.set_message(message.clone());
                }
            }
        })
    };

    let job = DownloadJob::new(tracks, config.output_dir.clone())
        .with_workers(workers)
        .with_thresholds(thresholds(config));
    let result = coordinator.run(job).await;

    bar_task.abort();
    bar.finish_and_clear();
    let result = result?;

    print_summary_table(&result);
    println!(
        "Done: {} complete, {} failed, {} cancelled",
        result.complete_count(),
        result.failed_count(),
        result.cancelled_count()
    );

    if result.complete_count() == result.outcomes.len() {
        Ok(0)
    } else {
        Ok(1)
    }
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Track")]
    title: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn print_summary_table(result: &JobResult) {
    let mut rows: Vec<SummaryRow> = result
        .outcomes
        .values()
        .map(|outcome| SummaryRow {
            title: outcome.title.clone(),
            status: format!("{:?}", outcome.status),
            attempts: outcome.attempts,
            detail: match outcome.status {
                ItemStatus::Complete => outcome
                    .path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
                _ => outcome.error.clone().unwrap_or_default(),
            },
        })
        .collect();
    rows.sort_by(|a, b| a.title.cmp(&b.title));

    println!("{}", Table::new(rows));
}

#[derive(Tabled)]
struct LibraryRow {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Bitrate")]
    bitrate: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Valid")]
    valid: String,
}

fn print_library_table(entries: &[library::ReportEntry]) {
    let rows: Vec<LibraryRow> = entries
        .iter()
        .map(|entry| LibraryRow {
            file: entry.file_name(),
            size: format_file_size(entry.file_size),
            bitrate: format!("{} kbps", entry.bitrate_kbps),
            duration: entry
                .duration_secs
                .map(|s| format_duration_ms(s * 1000))
                .unwrap_or_else(|| "-".to_string()),
            valid: if entry.valid {
                "yes".to_string()
            } else {
                entry.reason.clone().unwrap_or_else(|| "no".to_string())
            },
        })
        .collect();

    println!("{}", Table::new(rows));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_playlist_with_workers() {
        let cli = Cli::parse_from(["spotify-dl", "playlist", "spotify:playlist:abc", "-w", "8"]);
        match cli.command {
            Command::Playlist { url, workers } => {
                assert_eq!(url, "spotify:playlist:abc");
                assert_eq!(workers, Some(8));
            }
            _ => panic!("expected playlist command"),
        }
    }

    #[test]
    fn parses_global_overrides() {
        let cli = Cli::parse_from([
            "spotify-dl",
            "track",
            "spotify:track:abc",
            "-o",
            "/tmp/music",
            "-q",
            "high",
            "--normalize",
        ]);
        assert_eq!(cli.output, Some(PathBuf::from("/tmp/music")));
        assert_eq!(cli.quality, Some(AudioQuality::High));
        assert!(cli.normalize);
    }

    #[test]
    fn rejects_unknown_quality() {
        assert!(Cli::try_parse_from(["spotify-dl", "track", "x", "-q", "ultra"]).is_err());
    }
}
