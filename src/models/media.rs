use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ingestion state of a media asset. Transitions are
/// `pending -> processing -> {ready | failed}`; a re-run goes back through
/// `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Processing => "processing",
            MediaStatus::Ready => "ready",
            MediaStatus::Failed => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MediaStatus::Ready)
    }

    /// Whether the ingestion state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MediaStatus) -> bool {
        use MediaStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Ready, Processing)
                | (Failed, Processing)
                | (Processing, Ready)
                | (Processing, Failed)
                // startup recovery of jobs that never got to run
                | (Pending, Failed)
        )
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MediaStatus::Pending),
            "processing" => Ok(MediaStatus::Processing),
            "ready" => Ok(MediaStatus::Ready),
            "failed" => Ok(MediaStatus::Failed),
            other => anyhow::bail!("unknown media status '{}'", other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaAsset {
    pub id: String,
    pub filename: String,
    pub stored_filename: String,
    pub status: MediaStatus,
    pub duration_secs: Option<f64>,
    pub face_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MediaAsset {
    /// Playable reference, relative to the server root.
    pub fn url(&self) -> String {
        format!("/uploads/{}", self.stored_filename)
    }
}

/// Response shape for get/list, with the playable url resolved.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaView {
    #[serde(flatten)]
    pub asset: MediaAsset,
    pub url: String,
}

impl From<MediaAsset> for MediaView {
    fn from(asset: MediaAsset) -> Self {
        let url = asset.url();
        Self { asset, url }
    }
}
