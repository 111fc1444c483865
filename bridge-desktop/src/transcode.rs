//! Transcoder for hosts whose sink accepts the downloaded container as-is.

use async_trait::async_trait;
use bridge_traits::fetch::{FetchFailure, TranscodeProfile, Transcoder};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Returns the input unchanged after checking it exists and is non-empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTranscoder;

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        profile: &TranscodeProfile,
    ) -> Result<PathBuf, FetchFailure> {
        let metadata = tokio::fs::metadata(input)
            .await
            .map_err(|e| FetchFailure::TranscodeError(format!("{}: {}", input.display(), e)))?;
        if metadata.len() == 0 {
            return Err(FetchFailure::TranscodeError(format!(
                "{} is empty",
                input.display()
            )));
        }
        trace!(file = %input.display(), format = %profile.format, "Passing file through");
        Ok(input.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_returns_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.opus");
        std::fs::write(&file, b"data").unwrap();

        let out = PassthroughTranscoder
            .transcode(&file, &TranscodeProfile::default())
            .await
            .unwrap();
        assert_eq!(out, file);
    }

    #[tokio::test]
    async fn test_missing_or_empty_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let profile = TranscodeProfile::default();

        let missing = dir.path().join("missing.opus");
        assert!(matches!(
            PassthroughTranscoder.transcode(&missing, &profile).await,
            Err(FetchFailure::TranscodeError(_))
        ));

        let empty = dir.path().join("empty.opus");
        std::fs::write(&empty, b"").unwrap();
        assert!(PassthroughTranscoder.transcode(&empty, &profile).await.is_err());
    }
}
