pub mod cache;
pub mod ytdlp;

pub use ytdlp::YtDlpResolver;

use crate::errors::Result;
use crate::spotify::TrackMetadata;
use serde::{Deserialize, Serialize};

/// A resolved audio source with its match confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHandle {
    pub url: String,
    pub title: String,
    pub duration_secs: u64,
    pub view_count: u64,
    pub quality_score: f64,
}

/// Maps track metadata to a concrete audio source. The scoring heuristic is
/// an implementation detail of each resolver.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, metadata: &TrackMetadata) -> Result<SourceHandle>;
}

/// Search queries for a track, in priority order. Later entries trade
/// precision for recall.
pub fn generate_search_queries(metadata: &TrackMetadata) -> Vec<String> {
    let mut queries = Vec::new();

    queries.push(format!("{} {}", metadata.artist, metadata.name));
    queries.push(format!("{} {} official audio", metadata.artist, metadata.name));
    queries.push(format!("{} {}", metadata.name, metadata.artist));

    if let Some(isrc) = &metadata.isrc {
        queries.push(isrc.clone());
    }

    queries.push(format!("{} {} lyrics", metadata.artist, metadata.name));
    queries.push(format!("{} audio", metadata.name));
    queries.push(format!("{} {}", metadata.name, metadata.album));
    queries.push(format!("{} full song", metadata.name));

    if let Some(first_artist) = metadata.artist.split(',').next() {
        let first_artist = first_artist.trim();
        if first_artist != metadata.artist {
            queries.push(format!("{} {}", first_artist, metadata.name));
        }
    }

    queries
}

/// A single candidate from a flat-playlist search, before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandidate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub view_count: Option<u64>,
}

const DURATION_TOLERANCE: f64 = 0.30;

const OFFICIAL_KEYWORDS: &[&str] = &["official", "audio", "lyrics", "hd", "hq", "full"];
const BAD_KEYWORDS: &[&str] = &[
    "cover",
    "remix",
    "live",
    "karaoke",
    "instrumental",
    "acoustic",
    "slowed",
    "reverb",
];

/// Weighted match score in [0.1, 1.0]: title relevance 50%, duration
/// proximity 25%, popularity 15%, official/bad keywords 10%.
pub fn score_candidate(candidate: &RawCandidate, metadata: &TrackMetadata) -> f64 {
    let mut score = 0.0;
    let title = candidate.title.as_deref().unwrap_or("").to_lowercase();
    let target_duration = metadata.duration_ms as f64 / 1000.0;

    let artist_lower = metadata.artist.to_lowercase();
    let track_lower = metadata.name.to_lowercase();

    let mut title_score: f64 = 0.0;
    for word in artist_lower.split_whitespace().chain(track_lower.split_whitespace()) {
        if word.len() > 2 && title.contains(word) {
            title_score += 0.25;
        }
    }
    score += title_score.min(1.0) * 0.5;

    let duration = candidate.duration.unwrap_or(0.0);
    if duration > 0.0 && target_duration > 0.0 {
        let duration_diff = (duration - target_duration).abs() / target_duration.max(1.0);
        let duration_score = if duration_diff <= DURATION_TOLERANCE {
            1.0 - duration_diff / DURATION_TOLERANCE
        } else {
            (0.5 - duration_diff * 0.3).max(0.0)
        };
        score += duration_score * 0.25;
    } else {
        score += 0.1;
    }

    let view_count = candidate.view_count.unwrap_or(0);
    if view_count > 0 {
        let popularity_score = (((view_count + 1) as f64).log10() / 8.0).min(1.0);
        score += popularity_score * 0.15;
    } else {
        score += 0.05;
    }

    let mut keyword_score: f64 = 0.5;
    for keyword in OFFICIAL_KEYWORDS {
        if title.contains(keyword) {
            keyword_score = (keyword_score + 0.1).min(1.0);
        }
    }
    for keyword in BAD_KEYWORDS {
        if title.contains(keyword) && !track_lower.contains(keyword) {
            keyword_score = (keyword_score - 0.15).max(0.0);
        }
    }
    score += keyword_score * 0.1;

    score.clamp(0.1, 1.0)
}

/// Picks the highest-scoring candidate, or None if the list is empty.
pub fn find_best_match(
    candidates: &[RawCandidate],
    metadata: &TrackMetadata,
) -> Option<SourceHandle> {
    let target_duration = (metadata.duration_ms / 1000) as u64;

    candidates
        .iter()
        .filter_map(|candidate| {
            let score = score_candidate(candidate, metadata);
            let video_id = candidate.id.clone().or_else(|| {
                candidate
                    .url
                    .as_deref()
                    .and_then(|u| u.split("watch?v=").last())
                    .map(|s| s.to_string())
            })?;
            let url = candidate
                .url
                .clone()
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", video_id));

            Some(SourceHandle {
                url,
                title: candidate.title.clone().unwrap_or_else(|| "Unknown".to_string()),
                duration_secs: candidate
                    .duration
                    .map(|d| d as u64)
                    .filter(|d| *d > 0)
                    .unwrap_or(target_duration),
                view_count: candidate.view_count.unwrap_or(0),
                quality_score: score,
            })
        })
        .max_by(|a, b| {
            a.quality_score
                .partial_cmp(&b.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
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
            isrc: Some("GBDUW0000059".to_string()),
            duration_ms: 320_000,
            release_date: Some("2001-03-07".to_string()),
        }
    }

    fn candidate(title: &str, duration: f64, views: u64) -> RawCandidate {
        RawCandidate {
            id: Some("vid1".to_string()),
            url: None,
            title: Some(title.to_string()),
            duration: Some(duration),
            view_count: Some(views),
        }
    }

    #[test]
    fn query_ladder_starts_precise_and_includes_isrc() {
        let queries = generate_search_queries(&test_metadata());
        assert_eq!(queries[0], "Daft Punk One More Time");
        assert_eq!(queries[1], "Daft Punk One More Time official audio");
        assert!(queries.contains(&"GBDUW0000059".to_string()));
    }

    #[test]
    fn query_ladder_adds_first_artist_for_collaborations() {
        let mut metadata = test_metadata();
        metadata.artist = "Daft Punk, Pharrell Williams".to_string();
        let queries = generate_search_queries(&metadata);
        assert!(queries.contains(&"Daft Punk One More Time".to_string()));
    }

    #[test]
    fn exact_match_outscores_cover() {
        let metadata = test_metadata();
        let exact = candidate("Daft Punk - One More Time (Official Audio)", 320.0, 50_000_000);
        let cover = candidate("One More Time (Piano Cover)", 200.0, 1_000);

        let exact_score = score_candidate(&exact, &metadata);
        let cover_score = score_candidate(&cover, &metadata);
        assert!(exact_score > cover_score);
        assert!(exact_score > 0.7);
    }

    #[test]
    fn score_stays_in_range() {
        let metadata = test_metadata();
        let empty = RawCandidate {
            id: None,
            url: None,
            title: None,
            duration: None,
            view_count: None,
        };
        let score = score_candidate(&empty, &metadata);
        assert!((0.1..=1.0).contains(&score));
    }

    #[test]
    fn best_match_builds_watch_url_from_id() {
        let metadata = test_metadata();
        let best = find_best_match(&[candidate("Daft Punk One More Time", 320.0, 1000)], &metadata)
            .unwrap();
        assert_eq!(best.url, "https://www.youtube.com/watch?v=vid1");
        assert_eq!(best.duration_secs, 320);
    }

    #[test]
    fn best_match_empty_input() {
        assert!(find_best_match(&[], &test_metadata()).is_none());
    }
}
