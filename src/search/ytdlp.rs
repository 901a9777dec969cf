use super::cache::SearchCache;
use super::{find_best_match, generate_search_queries, RawCandidate, Resolver, SourceHandle};
use crate::errors::{AppError, Result};
use crate::spotify::TrackMetadata;
use log::{debug, info, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const SEARCH_RESULTS_PER_QUERY: usize = 10;
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Resolves tracks to audio sources by running yt-dlp searches over a
/// ladder of queries and scoring the candidates.
pub struct YtDlpResolver {
    ytdlp_path: String,
    max_queries: usize,
    min_quality_score: f64,
    search_timeout: Duration,
    cache: SearchCache,
}

impl YtDlpResolver {
    pub fn new(search_timeout: Duration) -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            max_queries: 5,
            min_quality_score: 0.3,
            search_timeout,
            cache: SearchCache::new(CACHE_TTL),
        }
    }

    pub fn with_ytdlp_path(mut self, path: String) -> Self {
        self.ytdlp_path = path;
        self
    }

    async fn execute_search(&self, query: &str) -> Result<Vec<RawCandidate>> {
        if let Some(cached) = self.cache.get(query).await {
            debug!("[SEARCH] Cache hit for query: {}", query);
            return Ok(cached);
        }

        let search_spec = format!("ytsearch{}:{}", SEARCH_RESULTS_PER_QUERY, query);
        debug!("[SEARCH] Running yt-dlp search: {}", search_spec);

        let child = Command::new(&self.ytdlp_path)
            .args([
                &search_spec,
                "--dump-json",
                "--flat-playlist",
                "--no-warnings",
                "--quiet",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Resolve(format!("Failed to start yt-dlp: {}", e)))?;

        let output = tokio::time::timeout(self.search_timeout, child.wait_with_output())
            .await
            .map_err(|_| AppError::Resolve(format!("Search timed out: {}", query)))?
            .map_err(|e| AppError::Resolve(format!("yt-dlp search failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Resolve(format!("yt-dlp search failed: {}", stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let candidates: Vec<RawCandidate> = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_str::<RawCandidate>(line) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    warn!("[SEARCH] Skipping unparseable result line: {}", e);
                    None
                }
            })
            .collect();

        self.cache.set(query.to_string(), candidates.clone()).await;
        Ok(candidates)
    }
}

#[async_trait::async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, metadata: &TrackMetadata) -> Result<SourceHandle> {
        let queries = generate_search_queries(metadata);
        let mut fallback: Option<SourceHandle> = None;

        for (i, query) in queries.iter().take(self.max_queries).enumerate() {
            info!("[SEARCH] Searching ({}/{}): {}", i + 1, self.max_queries, query);

            let candidates = match self.execute_search(query).await {
                Ok(candidates) if !candidates.is_empty() => candidates,
                Ok(_) => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    continue;
                }
                Err(e) => {
                    warn!("[SEARCH] Query failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    continue;
                }
            };

            if let Some(best) = find_best_match(&candidates, metadata) {
                if best.quality_score >= self.min_quality_score {
                    info!(
                        "[SEARCH] Found match: {} (score: {:.2})",
                        best.title, best.quality_score
                    );
                    return Ok(best);
                }

                let keep = match &fallback {
                    Some(current) => best.quality_score > current.quality_score,
                    None => true,
                };
                if keep {
                    fallback = Some(best);
                }
            }

            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        if let Some(best) = fallback {
            info!(
                "[SEARCH] Using best available match: {} (score: {:.2})",
                best.title, best.quality_score
            );
            return Ok(best);
        }

        Err(AppError::Resolve(format!(
            "No match found for: {}",
            metadata.search_query()
        )))
    }
}
