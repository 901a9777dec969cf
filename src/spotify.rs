use crate::errors::{AppError, Result};
use crate::retry::{retry, BackoffPolicy, RetryOptions};
use crate::utils::sanitize_track_filename;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Track-level metadata as returned by the Spotify Web API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackMetadata {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub album_art_url: Option<String>,
    pub isrc: Option<String>,
    pub duration_ms: u64,
    pub release_date: Option<String>,
}

impl TrackMetadata {
    /// Search query used by the match resolver.
    pub fn search_query(&self) -> String {
        format!("{} - {}", self.artist, self.name)
    }

    /// Filesystem-safe "Artist - Title" stem for the output file.
    pub fn filename(&self) -> String {
        sanitize_track_filename(&self.artist, &self.name)
    }
}

struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// Spotify Web API client using the client-credentials grant.
///
/// Credentials come from SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET. All API
/// calls go through the shared retry wrapper; 429 responses honor the
/// Retry-After header.
pub struct SpotifyClient {
    client: Client,
    client_id: String,
    client_secret: String,
    token: tokio::sync::Mutex<Option<AccessToken>>,
}

impl SpotifyClient {
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("SPOTIFY_CLIENT_ID").map_err(|_| {
            AppError::Auth("SPOTIFY_CLIENT_ID environment variable not set".to_string())
        })?;
        let client_secret = std::env::var("SPOTIFY_CLIENT_SECRET").map_err(|_| {
            AppError::Auth("SPOTIFY_CLIENT_SECRET environment variable not set".to_string())
        })?;

        Ok(Self::new(client_id, client_secret))
    }

    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("spotify-dl/1.0")
                .build()
                .unwrap_or_else(|_| Client::new()),
            client_id,
            client_secret,
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// Fetch metadata for a single track from a URL, URI or bare id.
    pub async fn get_track(&self, track_url: &str) -> Result<TrackMetadata> {
        let track_id = extract_id(track_url, "track")?;
        let url = format!("{}/tracks/{}", API_BASE, track_id);

        let json = self.api_get(&url).await?;
        parse_track(&json)
            .ok_or_else(|| AppError::InvalidInput("Malformed track response".to_string()))
    }

    /// Fetch all tracks from a playlist, following pagination.
    pub async fn get_playlist_tracks(&self, playlist_url: &str) -> Result<Vec<TrackMetadata>> {
        let playlist_id = extract_id(playlist_url, "playlist")?;
        let mut tracks = Vec::new();
        let mut offset = 0;
        let limit = 100;

        loop {
            let url = format!(
                "{}/playlists/{}/tracks?offset={}&limit={}",
                API_BASE, playlist_id, offset, limit
            );
            let json = self.api_get(&url).await?;

            if let Some(items) = json["items"].as_array() {
                for item in items {
                    let track = &item["track"];
                    if track.is_object() && !track["id"].is_null() {
                        if let Some(metadata) = parse_track(track) {
                            tracks.push(metadata);
                        } else {
                            warn!("[SPOTIFY] Skipping unparseable playlist entry");
                        }
                    }
                }
            }

            if json["next"].is_null() {
                break;
            }
            offset += limit;
        }

        info!("[SPOTIFY] Found {} tracks in playlist", tracks.len());
        Ok(tracks)
    }

    /// Fetch all tracks from an album. Album track entries omit art and
    /// ISRC, so art comes from the album object itself.
    pub async fn get_album_tracks(&self, album_url: &str) -> Result<Vec<TrackMetadata>> {
        let album_id = extract_id(album_url, "album")?;
        let url = format!("{}/albums/{}", API_BASE, album_id);
        let json = self.api_get(&url).await?;

        let album_name = json["name"].as_str().unwrap_or("Unknown").to_string();
        let album_art_url = json["images"]
            .as_array()
            .and_then(|images| images.first())
            .and_then(|img| img["url"].as_str())
            .map(|s| s.to_string());
        let release_date = json["release_date"].as_str().map(|s| s.to_string());

        let mut tracks = Vec::new();
        if let Some(items) = json["tracks"]["items"].as_array() {
            for item in items {
                let artist = join_artists(&item["artists"]);
                tracks.push(TrackMetadata {
                    track_id: item["id"].as_str().unwrap_or_default().to_string(),
                    name: item["name"].as_str().unwrap_or("Unknown").to_string(),
                    artist,
                    album: album_name.clone(),
                    album_art_url: album_art_url.clone(),
                    isrc: None,
                    duration_ms: item["duration_ms"].as_u64().unwrap_or(0),
                    release_date: release_date.clone(),
                });
            }
        }

        info!("[SPOTIFY] Found {} tracks in album", tracks.len());
        Ok(tracks)
    }

    async fn api_get(&self, url: &str) -> Result<Value> {
        let options = RetryOptions::new(3, BackoffPolicy::Exponential(Duration::from_secs(1)));

        retry(options, "Spotify API call", || async {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after_secs = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                warn!("[SPOTIFY] Rate limited, backing off {}s", retry_after_secs);
                return Err(AppError::RateLimit { retry_after_secs });
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(AppError::Auth(format!("Spotify API returned {}", status)));
            }
            if status.is_server_error() {
                return Err(AppError::Fetch(format!("Spotify API returned {}", status)));
            }
            if !status.is_success() {
                return Err(AppError::InvalidInput(format!(
                    "Spotify API returned {} for {}",
                    status, url
                )));
            }

            Ok(response.json::<Value>().await?)
        })
        .await
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;

        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(AppError::Auth(
                "Spotify rejected client credentials. Check SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET".to_string(),
            ));
        }

        let json: Value = response.json().await?;
        let token = json["access_token"]
            .as_str()
            .ok_or_else(|| AppError::Auth("Token response missing access_token".to_string()))?
            .to_string();
        let expires_in = json["expires_in"].as_u64().unwrap_or(3600);

        info!("[SPOTIFY] Authenticated with Spotify API");

        // Refresh one minute early to avoid using a token mid-expiry.
        *guard = Some(AccessToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });

        Ok(token)
    }
}

/// Extracts the Spotify ID from a URL, URI or bare id string.
pub fn extract_id(url: &str, content_type: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::InvalidInput("URL cannot be empty".to_string()));
    }

    if url.starts_with("spotify:") {
        let parts: Vec<&str> = url.split(':').collect();
        if parts.len() == 3 && parts[1] == content_type {
            return Ok(parts[2].to_string());
        }
        return Err(AppError::InvalidInput(format!(
            "Expected a {} URI, got: {}",
            content_type, url
        )));
    }

    if url.contains("open.spotify.com") {
        let parts: Vec<&str> = url.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            if *part == content_type && i + 1 < parts.len() {
                let id = parts[i + 1].split('?').next().unwrap_or_default();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        return Err(AppError::InvalidInput(format!(
            "Expected a {} URL, got: {}",
            content_type, url
        )));
    }

    // Treat anything else as a bare id.
    Ok(url.to_string())
}

fn join_artists(artists: &Value) -> String {
    artists
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|a| a["name"].as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "Unknown".to_string())
}

fn parse_track(track: &Value) -> Option<TrackMetadata> {
    let track_id = track["id"].as_str()?.to_string();
    let name = track["name"].as_str()?.to_string();
    let artist = join_artists(&track["artists"]);

    let album = track["album"]["name"].as_str().unwrap_or("Unknown").to_string();
    let album_art_url = track["album"]["images"]
        .as_array()
        .and_then(|images| images.first())
        .and_then(|img| img["url"].as_str())
        .map(|s| s.to_string());
    let isrc = track["external_ids"]["isrc"].as_str().map(|s| s.to_string());

    Some(TrackMetadata {
        track_id,
        name,
        artist,
        album,
        album_art_url,
        isrc,
        duration_ms: track["duration_ms"].as_u64().unwrap_or(0),
        release_date: track["album"]["release_date"].as_str().map(|s| s.to_string()),
    })
}
