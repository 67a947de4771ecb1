use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a render job. `Created` exists only as the row default
/// before the controller commits a real initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Queued,
    Downloading,
    Validating,
    Rendering,
    Packaging,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Downloading => "DOWNLOADING",
            Self::Validating => "VALIDATING",
            Self::Rendering => "RENDERING",
            Self::Packaging => "PACKAGING",
            Self::Uploading => "UPLOADING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "CREATED" => Ok(Self::Created),
            "QUEUED" => Ok(Self::Queued),
            "DOWNLOADING" => Ok(Self::Downloading),
            "VALIDATING" => Ok(Self::Validating),
            "RENDERING" => Ok(Self::Rendering),
            "PACKAGING" => Ok(Self::Packaging),
            "UPLOADING" => Ok(Self::Uploading),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(Error::internal(format!("unknown job status: {other}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Output-encoding profile requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Web,
    Social,
    HighQuality,
    Custom,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Social => "social",
            Self::HighQuality => "high_quality",
            Self::Custom => "custom",
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "web" => Ok(Self::Web),
            "social" => Ok(Self::Social),
            "high_quality" => Ok(Self::HighQuality),
            "custom" => Ok(Self::Custom),
            other => Err(Error::validation(format!("unknown preset: {other}"))),
        }
    }
}

/// Configured GPU pool identifier. The estimator only ever selects between
/// these two classes; rates and speed factors stay configurable per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuClass {
    Rtx4090,
    A100,
}

impl GpuClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtx4090 => "rtx4090",
            Self::A100 => "a100",
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "rtx4090" => Ok(Self::Rtx4090),
            "a100" => Ok(Self::A100),
            other => Err(Error::internal(format!("unknown gpu class: {other}"))),
        }
    }
}

/// Per-job encoding overrides, honored only when the preset is `custom`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_mbps: Option<f64>,
}

/// Bundle checksum values that mean "do not verify".
pub fn is_sentinel_sha256(v: &str) -> bool {
    matches!(v, "pending" | "cache")
}

pub fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip_db_strings() {
        let statuses = [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Downloading,
            JobStatus::Validating,
            JobStatus::Rendering,
            JobStatus::Packaging,
            JobStatus::Uploading,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];
        for status in statuses {
            let db = status.as_db_str();
            let parsed = JobStatus::parse(db).expect("parse known status");
            assert_eq!(parsed, status, "roundtrip mismatch for status={db}");
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Rendering.is_terminal());
    }

    #[test]
    fn preset_parse_rejects_unknown() {
        assert!(Preset::parse("webm").is_err());
        assert_eq!(Preset::parse("high_quality").unwrap(), Preset::HighQuality);
    }

    #[test]
    fn sentinel_shas() {
        assert!(is_sentinel_sha256("pending"));
        assert!(is_sentinel_sha256("cache"));
        assert!(!is_sentinel_sha256(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
    }

    #[test]
    fn round_cents_to_two_decimals() {
        assert_eq!(round_cents(1.006), 1.01);
        assert_eq!(round_cents(1.004), 1.0);
        assert_eq!(round_cents(2.0), 2.0);
        assert_eq!(round_cents(0.125), 0.13);
    }
}
