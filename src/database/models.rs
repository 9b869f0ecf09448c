//! Row models for builds and artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build lifecycle. `Pending` rows are claimable; `Done`, `Failed` and
/// `TooManyAttempts` are terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Building,
    Done,
    Failed,
    TooManyAttempts,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Building => "building",
            BuildStatus::Done => "done",
            BuildStatus::Failed => "failed",
            BuildStatus::TooManyAttempts => "too_many_attempts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BuildStatus::Pending),
            "building" => Some(BuildStatus::Building),
            "done" => Some(BuildStatus::Done),
            "failed" => Some(BuildStatus::Failed),
            "too_many_attempts" => Some(BuildStatus::TooManyAttempts),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Done | BuildStatus::Failed | BuildStatus::TooManyAttempts
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: i64,
    pub project: String,
    /// 40-hex commit object id.
    pub revision: String,
    pub target: String,
    pub version: String,
    pub reason: String,
    pub status: String,
    pub agent: Option<String>,
    pub jobsecret: Option<String>,
    pub attempts: i64,
    pub no_output: bool,
    pub created: DateTime<Utc>,
    pub status_change: Option<DateTime<Utc>>,
    pub buildstart: Option<DateTime<Utc>>,
    pub buildend: Option<DateTime<Utc>>,
    pub progress_text: Option<String>,
}

/// Where an artifact body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Payload bytes are inline in the row.
    Embedded,
    /// Payload is a path relative to the project artifact directory.
    File,
    /// Payload is an object-store key.
    S3,
}

impl Storage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Storage::Embedded => "embedded",
            Storage::File => "file",
            Storage::S3 => "s3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "embedded" => Some(Storage::Embedded),
            "file" => Some(Storage::File),
            "s3" => Some(Storage::S3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: i64,
    pub build_id: i64,
    pub artifact_type: String,
    pub name: String,
    pub storage: String,
    pub payload: Vec<u8>,
    pub size: i64,
    pub md5: String,
    /// SHA-1 over the stored bytes; globally addresses the content.
    pub sha1: String,
    pub contenttype: Option<String>,
    pub encoding: Option<String>,
    pub origsize: i64,
    pub dlcount: i64,
    pub patchcount: i64,
    pub created: DateTime<Utc>,
}

/// Tombstone drained by the deleted-artifact reaper.
#[derive(Debug, Clone)]
pub struct DeletedArtifact {
    pub id: i64,
    pub name: String,
    pub storage: String,
    pub payload: Vec<u8>,
    pub project: String,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            BuildStatus::Pending,
            BuildStatus::Building,
            BuildStatus::Done,
            BuildStatus::Failed,
            BuildStatus::TooManyAttempts,
        ] {
            assert_eq!(BuildStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BuildStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Done.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::TooManyAttempts.is_terminal());
    }
}
