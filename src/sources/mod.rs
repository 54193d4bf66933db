//! # Sources
//!
//! Everything between a user-supplied locator and a queued [`MediaItem`]:
//! locator classification and the external Resolver Stage.

pub mod resolver;

use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, time::Duration};
use url::Url;

pub use resolver::{EnqueueReport, Resolver};

/// One resolvable, playable unit.
///
/// Deserializes straight from a resolver record (one JSON object per line,
/// yt-dlp `-j` field names) and round-trips through the persisted snapshot.
/// Everything is fixed once queued except `remaining`, which only the
/// playback loop updates while this item is playing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    #[serde(default, deserialize_with = "nullable_string")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub description: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub full_title: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub thumbnail: String,
    #[serde(
        default,
        alias = "webpage_url",
        deserialize_with = "nullable_string"
    )]
    pub source_url: String,
    /// Seconds. yt-dlp reports fractional or null durations.
    #[serde(default, deserialize_with = "whole_seconds")]
    pub duration: u64,
    #[serde(default)]
    pub added_by: String,
    #[serde(default)]
    pub remaining: u64,
}

impl MediaItem {
    /// Items without a source locator can never reach the pipeline.
    pub fn is_playable(&self) -> bool {
        !self.source_url.trim().is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    /// Same queued entry, ignoring the mutable `remaining` counter.
    pub fn same_entry(&self, other: &MediaItem) -> bool {
        self.id == other.id && self.source_url == other.source_url && self.added_by == other.added_by
    }
}

impl fmt::Display for MediaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Title: {}, ID: {}, AddedBy: {}",
            self.title, self.id, self.added_by
        )
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn whole_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = Option::<f64>::deserialize(deserializer)?;
    Ok(seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| s.round() as u64)
        .unwrap_or(0))
}

/// What the user asked for: a direct URL or a free-text search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Url(Url),
    Search(String),
}

impl Locator {
    const SEARCH_PREFIX: &'static str = "ytsearch";

    /// Returns `None` for empty or whitespace-only input.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(Locator::Url(url)),
            _ => Some(Locator::Search(input.to_string())),
        }
    }

    /// The argument handed to the Resolver Stage.
    pub fn resolver_arg(&self) -> String {
        match self {
            Locator::Url(url) => url.to_string(),
            Locator::Search(term) if term.starts_with(Self::SEARCH_PREFIX) => term.clone(),
            Locator::Search(term) => format!("{}:{}", Self::SEARCH_PREFIX, term),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_ytdlp_record() {
        let line = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","description":null,
            "full_title":"Rick Astley - Never Gonna Give You Up","thumbnail":"https://i.ytimg.com/x.jpg",
            "webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ","duration":212.6,"formats":[]}"#;

        let item: MediaItem = serde_json::from_str(line).unwrap();

        assert_eq!(item.id, "dQw4w9WgXcQ");
        assert_eq!(item.description, "");
        assert_eq!(item.source_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(item.duration, 213);
        assert_eq!(item.added_by, "");
        assert!(item.is_playable());
    }

    #[test]
    fn missing_source_is_not_playable() {
        let item: MediaItem = serde_json::from_str(r#"{"id":"x","title":"t","duration":null}"#).unwrap();
        assert_eq!(item.duration, 0);
        assert!(!item.is_playable());
    }

    #[test]
    fn snapshot_round_trip_keeps_requester() {
        let item = MediaItem {
            id: "a".into(),
            title: "A".into(),
            source_url: "https://example.com/a".into(),
            duration: 90,
            added_by: "voldy".into(),
            remaining: 12,
            ..Default::default()
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: MediaItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn locator_classification() {
        assert_eq!(Locator::parse("   "), None);
        assert_eq!(
            Locator::parse("https://youtu.be/abc").unwrap().resolver_arg(),
            "https://youtu.be/abc"
        );
        assert_eq!(
            Locator::parse("daft punk around the world").unwrap().resolver_arg(),
            "ytsearch:daft punk around the world"
        );
        assert_eq!(
            Locator::parse("ytsearch5:lofi").unwrap().resolver_arg(),
            "ytsearch5:lofi"
        );
        assert!(matches!(Locator::parse("file:///etc/passwd"), Some(Locator::Search(_))));
    }
}
