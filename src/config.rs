//! Service-level configuration for the buildmaster
//!
//! Per-project configuration lives in JSON files under `project_config_dir`
//! and is managed by the project registry, not here.

use crate::error::DoozerError;
use serde::Deserialize;
use std::collections::HashMap;

/// A build agent allowed to claim jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen port for the HTTP surface.
    pub port: u16,
    /// Upper bound in seconds for `getjob` long-polls. 0 returns immediately.
    pub longpoll_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            longpoll_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildmasterConfig {
    /// Minutes without a status report before a building job is reclaimed.
    pub buildtimeout: i64,
    /// Claim attempts before a build is given up as too_many_attempts.
    pub buildattempts: i64,
    /// Agents allowed to claim jobs, keyed by agent id.
    pub agents: HashMap<String, AgentConfig>,
}

impl Default for BuildmasterConfig {
    fn default() -> Self {
        Self {
            buildtimeout: 300,
            buildattempts: 3,
            agents: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub buildmaster: BuildmasterConfig,
    /// Root of the `<org>/<name>.json` project config tree.
    #[serde(default = "default_project_config_dir")]
    pub project_config_dir: String,
    /// Where bare git mirrors are kept when a project does not configure one.
    #[serde(default = "default_repos_dir")]
    pub repos: String,
    /// Fallback artifact file store, `<artifact_path>/<project>` per project.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
    /// Cache directory for generated bsdiff patches.
    #[serde(default = "default_patchstash")]
    pub patchstash: String,
    /// Base URL prepended to `/file/<sha1>` in manifests and the REST API.
    pub artifact_prefix: Option<String>,
    /// Unix socket for the line-oriented control interface.
    #[serde(default = "default_ctrl_socket")]
    pub ctrl_socket: String,
}

fn default_project_config_dir() -> String {
    "projects".to_string()
}

fn default_repos_dir() -> String {
    "/var/tmp/doozer-git-repos".to_string()
}

fn default_artifact_path() -> String {
    "/var/tmp/doozer-artifacts".to_string()
}

fn default_patchstash() -> String {
    "/var/tmp/doozer/patchstash".to_string()
}

fn default_ctrl_socket() -> String {
    "/var/run/doozer.sock".to_string()
}

impl AppConfig {
    /// Load from a config file plus `DOOZER_`-prefixed environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, DoozerError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("doozer").required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("DOOZER").separator("__"))
            .build()
            .map_err(|e| DoozerError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| DoozerError::Config(e.to_string()))
    }

    /// Secret for a configured agent, if any.
    pub fn agent_secret(&self, agent: &str) -> Option<&str> {
        self.buildmaster
            .agents
            .get(agent)
            .map(|a| a.secret.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"database_url": "sqlite::memory:",
                "buildmaster": {"agents": {"agent1": {"secret": "s3cr3t"}}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 9000);
        assert_eq!(cfg.http.longpoll_timeout, 60);
        assert_eq!(cfg.buildmaster.buildtimeout, 300);
        assert_eq!(cfg.buildmaster.buildattempts, 3);
        assert_eq!(cfg.agent_secret("agent1"), Some("s3cr3t"));
        assert_eq!(cfg.agent_secret("other"), None);
    }
}
