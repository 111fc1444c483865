//! Source Resolution
//!
//! Provider search and URL resolution live outside the core. The resolver
//! turns a free-form query or link into an immutable [`PlayableSource`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Content provider a source was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Youtube,
    Spotify,
    Soundcloud,
    /// Plain HTTP(S) link to a media file or stream.
    Direct,
    Other(String),
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Youtube => write!(f, "youtube"),
            Provider::Spotify => write!(f, "spotify"),
            Provider::Soundcloud => write!(f, "soundcloud"),
            Provider::Direct => write!(f, "direct"),
            Provider::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Whether the session should stream audio only or the video variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

/// Immutable descriptor of something that can be fetched and played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayableSource {
    pub provider: Provider,
    /// Download or stream locator understood by the fetcher.
    pub locator: String,
    pub title: String,
    /// Zero for live sources.
    pub duration_seconds: u64,
    pub is_live: bool,
}

impl PlayableSource {
    pub fn new(
        provider: Provider,
        locator: impl Into<String>,
        title: impl Into<String>,
        duration_seconds: u64,
    ) -> Self {
        Self {
            provider,
            locator: locator.into(),
            title: title.into(),
            duration_seconds,
            is_live: false,
        }
    }

    pub fn live(provider: Provider, locator: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            provider,
            locator: locator.into(),
            title: title.into(),
            duration_seconds: 0,
            is_live: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Nothing found for \"{0}\"")]
    NotFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Source is restricted: {0}")]
    Restricted(String),
}

impl ResolutionError {
    /// Only provider outages are worth asking the resolver again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::ProviderUnavailable(_))
    }
}

/// Resolves user queries into playable sources.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<PlayableSource, ResolutionError>;

    /// Expand a playlist link into at most `limit` sources.
    ///
    /// Resolvers without playlist support treat the query as a single item.
    async fn resolve_playlist(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PlayableSource>, ResolutionError> {
        let source = self.resolve(query).await?;
        Ok(vec![source].into_iter().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleResolver;

    #[async_trait]
    impl SourceResolver for SingleResolver {
        async fn resolve(&self, query: &str) -> Result<PlayableSource, ResolutionError> {
            if query.is_empty() {
                return Err(ResolutionError::NotFound(query.to_string()));
            }
            Ok(PlayableSource::new(Provider::Direct, query, "clip", 10))
        }
    }

    #[tokio::test]
    async fn test_default_playlist_resolution_wraps_single_item() {
        let resolver = SingleResolver;
        let items = resolver
            .resolve_playlist("https://host/a.mp3", 25)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].locator, "https://host/a.mp3");

        let none = resolver.resolve_playlist("https://host/a.mp3", 0).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_only_provider_outage_is_retryable() {
        assert!(ResolutionError::ProviderUnavailable("503".into()).is_retryable());
        assert!(!ResolutionError::NotFound("x".into()).is_retryable());
        assert!(!ResolutionError::Restricted("age".into()).is_retryable());
    }

    #[test]
    fn test_live_source_has_no_duration() {
        let source = PlayableSource::live(Provider::Youtube, "yt:live", "Radio");
        assert!(source.is_live);
        assert_eq!(source.duration_seconds, 0);
    }
}
