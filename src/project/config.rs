//! Per-project configuration model
//!
//! Loaded from `<project_config_dir>/<org>/<name>.json`. Readers hold an
//! immutable `Arc` snapshot; a reload swaps the snapshot while outstanding
//! readers keep seeing their own.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub pub_path: Option<String>,
    pub priv_path: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoConfig {
    /// Upstream fetch URL, also handed to agents as the job `repo` field.
    #[serde(rename = "pub")]
    pub upstream: Option<String>,
    pub refspec: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub ssh: SshConfig,
    /// Seconds between automatic repo refreshes. 0 disables the timer.
    #[serde(default)]
    pub refresh_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchConfig {
    /// Path-aware glob matched against branch names, first match wins.
    pub pattern: String,
    #[serde(default)]
    pub autobuild: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBuildmasterConfig {
    #[serde(default)]
    pub branches: Vec<BranchConfig>,
    #[serde(default)]
    pub targets: Vec<String>,
    /// `"s3"` stores artifact uploads in the object store instead of locally.
    pub storage: Option<String>,
    /// Append `-g<shorthash>` to derived versions.
    #[serde(default)]
    pub hash_in_revision: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackConfig {
    pub name: String,
    pub title: String,
    /// Path-aware glob matched against branch names.
    pub branch: String,
    /// Tracks without a description stay out of all.json.
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackArtifactConfig {
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Only titled artifacts appear in all.json.
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackTargetConfig {
    pub target: String,
    pub title: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<TrackArtifactConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTracksConfig {
    /// Filesystem directory or `s3://bucket/prefix` URI.
    pub manifest_dir: Option<String>,
    pub artifact_prefix: Option<String>,
    #[serde(default)]
    pub tracks: Vec<TrackConfig>,
    #[serde(default)]
    pub targets: Vec<TrackTargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub awsid: Option<String>,
    pub secret: Option<String>,
}

impl S3Config {
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.bucket, &self.awsid, &self.secret) {
            (Some(b), Some(a), Some(s)) => Some((b, a, s)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GithubConfig {
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Override for the bare mirror location.
    pub repo: Option<String>,
    #[serde(default)]
    pub gitrepo: GitRepoConfig,
    #[serde(default)]
    pub buildmaster: ProjectBuildmasterConfig,
    #[serde(default)]
    pub release_tracks: ReleaseTracksConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub github: GithubConfig,
    /// Override for the artifact file store.
    pub artifact_path: Option<String>,
    /// URLs poked (fire-and-forget GET) whenever the mirror picks up new refs.
    #[serde(default)]
    pub repo_update_notifications: Vec<String>,
    pub build_url_prefix: Option<String>,
}

impl ProjectConfig {
    /// First branch entry whose pattern matches, `*` not crossing `/`.
    pub fn find_branch_config(&self, branch: &str) -> Option<&BranchConfig> {
        self.buildmaster
            .branches
            .iter()
            .find(|bc| crate::project::branch_pattern_matches(&bc.pattern, branch))
    }

    /// URL of a build page, used in final status log lines.
    pub fn build_url(&self, id: i64) -> Option<String> {
        let pfx = self.build_url_prefix.as_deref()?;
        if pfx.is_empty() {
            return None;
        }
        let sep = if pfx.ends_with('/') { "" } else { "/" };
        Some(format!("{}{}{}", pfx, sep, id))
    }
}
