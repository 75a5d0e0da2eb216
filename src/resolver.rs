use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serenity::async_trait;
use songbird::input::Input;
use songbird::ytdl;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ResolutionError;
use crate::models::{Requester, TrackInfo, UNKNOWN_TRACK_TITLE};

/// Turns user input into queueable tracks, and queued tracks into something
/// the audio connection can play.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    type Source: Send;

    /// Resolves free text, a video URL or a playlist URL. A bare phrase yields
    /// a single best match, a playlist yields its entries in order.
    async fn search(&self, query: &str, requester: &Requester) -> Result<Vec<TrackInfo>, ResolutionError>;

    /// Fetches a fresh stream for `track`. Only called right before playback.
    async fn materialize(&self, track: &TrackInfo) -> Result<Self::Source, ResolutionError>;
}

/// One line of `yt-dlp -j --flat-playlist` output.
///
/// Full extractions carry `webpage_url` (and an expiring stream in `url`),
/// flat playlist and search entries only carry the page in `url`.
#[derive(Deserialize)]
struct ExtractedEntry {
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
}

pub struct YtDlpResolver {
    program: String,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>) -> Self {
        YtDlpResolver { program: program.into() }
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    type Source = Input;

    async fn search(&self, query: &str, requester: &Requester) -> Result<Vec<TrackInfo>, ResolutionError> {
        let target = search_target(query);

        info!("Resolving {target}");

        let output = Command::new(&self.program)
            .arg("-j")
            .arg("--flat-playlist")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(&target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ResolutionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let tracks = parse_entries(&stdout, requester);

        if !tracks.is_empty() {
            return Ok(tracks);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();

        if output.status.success() || stderr.is_empty() {
            Err(ResolutionError::NotFound(query.to_string()))
        } else {
            Err(ResolutionError::Extraction(stderr.to_string()))
        }
    }

    async fn materialize(&self, track: &TrackInfo) -> Result<Input, ResolutionError> {
        ytdl(&track.url).await.map_err(|why| ResolutionError::Stream {
            title: track.title.clone(),
            reason: why.to_string(),
        })
    }
}

fn is_url(query: &str) -> bool {
    query.starts_with("https://") || query.starts_with("http://")
}

/// URLs go to the extractor untouched, anything else becomes a one-result search.
fn search_target(query: &str) -> String {
    let query = query.trim();

    if is_url(query) {
        query.to_string()
    } else {
        format!("ytsearch1:{query}")
    }
}

fn parse_entries(output: &str, requester: &Requester) -> Vec<TrackInfo> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let tracks = lines
        .iter()
        .filter_map(|line| {
            let entry: ExtractedEntry = serde_json::from_str(line).ok()?;
            let url = entry.webpage_url.or(entry.url)?;

            let duration = entry.duration.and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());

            Some(TrackInfo {
                url,
                title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
                requester: requester.clone(),
                duration,
            })
        })
        .collect::<Vec<TrackInfo>>();

    if tracks.len() < lines.len() {
        warn!("{} entries have been skipped due to errors during parsing", lines.len() - tracks.len());
    }

    tracks
}
