//! Shared state for the buildmaster process

use crate::config::AppConfig;
use crate::database::Database;
use crate::project::ProjectRegistry;
use std::path::PathBuf;

pub struct Core {
    pub config: AppConfig,
    pub db: Database,
    pub registry: ProjectRegistry,
    pub http_client: reqwest::Client,
    /// Serialises bsdiff patch generation.
    pub patch_lock: tokio::sync::Mutex<()>,
}

impl Core {
    pub fn new(config: AppConfig, db: Database) -> Self {
        let registry = ProjectRegistry::new(&config.project_config_dir);
        Self {
            config,
            db,
            registry,
            http_client: reqwest::Client::new(),
            patch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Artifact file store for a project, `<artifact_path>/<project>` unless
    /// the project overrides it.
    pub fn artifact_path(&self, project: &str) -> PathBuf {
        if let Some(cfg) = self.registry.get_cfg(project) {
            if let Some(p) = &cfg.artifact_path {
                return PathBuf::from(p);
            }
        }
        PathBuf::from(&self.config.artifact_path).join(project)
    }

    /// Location of a project's bare mirror.
    pub fn repo_path(&self, project: &str) -> PathBuf {
        if let Some(cfg) = self.registry.get_cfg(project) {
            if let Some(p) = &cfg.repo {
                return PathBuf::from(p);
            }
        }
        PathBuf::from(&self.config.repos).join(project)
    }
}
