//! Project registry
//!
//! Projects materialise when their config file appears under
//! `<project_config_dir>/<org>/<name>.json` and are torn down when it
//! disappears between rescans. The registry keeps the projects in a global
//! LRU order and hands out immutable config snapshots.

pub mod config;
pub mod worker;

pub use config::ProjectConfig;

use crate::error::DoozerError;
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;
use tracing::{error, info};

pub const JOB_UPDATE_REPO: u32 = 1 << 0;
pub const JOB_CHECK_FOR_BUILDS: u32 = 1 << 1;
pub const JOB_GENERATE_RELEASES: u32 = 1 << 2;
pub const JOB_NOTIFY_REPO_UPDATE: u32 = 1 << 3;

/// Branch patterns use path semantics: `*` never crosses a `/`.
pub fn branch_pattern_matches(pattern: &str, name: &str) -> bool {
    let opts = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::default()
    };
    Pattern::new(pattern)
        .map(|p| p.matches_with(name, opts))
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct ProjectState {
    pending_jobs: u32,
    worker_active: bool,
    refresh_interval: u64,
    next_refresh: Option<Instant>,
}

pub struct Project {
    pub id: String,
    state: Mutex<ProjectState>,
    /// Serialises all git operations on this project's mirror.
    pub repo_lock: tokio::sync::Mutex<()>,
}

impl Project {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(ProjectState::default()),
            repo_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Atomically take and clear the pending-job mask.
    fn take_pending(&self) -> u32 {
        let mut st = self.state.lock().unwrap();
        std::mem::take(&mut st.pending_jobs)
    }

    fn set_worker_active(&self, active: bool) {
        self.state.lock().unwrap().worker_active = active;
    }
}

struct Pconf {
    mtime: SystemTime,
    cfg: Arc<ProjectConfig>,
    mark: bool,
}

#[derive(Default)]
struct Inner {
    /// Front of the vec is the most recently touched project.
    projects: Vec<Arc<Project>>,
    pconfs: HashMap<String, Pconf>,
}

pub struct ProjectRegistry {
    project_config_dir: PathBuf,
    inner: Mutex<Inner>,
    /// Wakes the dispatcher whenever pending jobs or refresh timers change.
    pub notify: Notify,
}

impl ProjectRegistry {
    pub fn new<P: AsRef<Path>>(project_config_dir: P) -> Self {
        Self {
            project_config_dir: project_config_dir.as_ref().to_path_buf(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Look up a project, moving it to the LRU front.
    pub fn get(&self, id: &str) -> Option<Arc<Project>> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.projects.iter().position(|p| p.id == id)?;
        let p = inner.projects.remove(pos);
        inner.projects.insert(0, p.clone());
        Some(p)
    }

    /// Retained snapshot of a project's config. Outstanding snapshots survive
    /// reloads; new readers see the replacement.
    pub fn get_cfg(&self, id: &str) -> Option<Arc<ProjectConfig>> {
        let inner = self.inner.lock().unwrap();
        inner.pconfs.get(id).map(|pc| pc.cfg.clone())
    }

    pub fn all(&self) -> Vec<Arc<Project>> {
        self.inner.lock().unwrap().projects.clone()
    }

    pub fn schedule_job(&self, p: &Project, mask: u32) {
        {
            let mut st = p.state.lock().unwrap();
            st.pending_jobs |= mask;
        }
        self.notify.notify_waiters();
    }

    pub fn schedule_job_id(&self, id: &str, mask: u32) {
        if let Some(p) = self.get(id) {
            self.schedule_job(&p, mask);
        }
    }

    /// Scan the config tree, loading new and changed project configs and
    /// evicting projects whose file disappeared. Idempotent: an unchanged
    /// mtime produces no notification.
    pub fn reload(&self) -> Result<(), DoozerError> {
        let orgs = std::fs::read_dir(&self.project_config_dir).map_err(|e| {
            DoozerError::Config(format!(
                "Unable to scan project config dir {}: {}",
                self.project_config_dir.display(),
                e
            ))
        })?;

        let mut inner = self.inner.lock().unwrap();
        for pc in inner.pconfs.values_mut() {
            pc.mark = true;
        }

        for org in orgs.flatten() {
            let org_name = org.file_name().to_string_lossy().to_string();
            if org_name.starts_with('#') || org_name.starts_with('.') {
                continue;
            }
            if !org.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let files = match std::fs::read_dir(org.path()) {
                Ok(f) => f,
                Err(e) => {
                    error!("Unable to scan project config dir {}: {}", org_name, e);
                    continue;
                }
            };

            for f in files.flatten() {
                let fname = f.file_name().to_string_lossy().to_string();
                if fname.starts_with('#') || fname.starts_with('.') {
                    continue;
                }
                let Some(stem) = fname.strip_suffix(".json") else {
                    continue;
                };
                let id = format!("{}/{}", org_name, stem);
                self.load_conf(&mut inner, &id, &f.path());
            }
        }

        let gone: Vec<String> = inner
            .pconfs
            .iter()
            .filter(|(_, pc)| pc.mark)
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            info!("{}: Config unloaded", id);
            inner.pconfs.remove(&id);
            inner.projects.retain(|p| p.id != id);
        }

        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    fn load_conf(&self, inner: &mut Inner, id: &str, path: &Path) {
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                error!("Unable to stat {}: {}", path.display(), e);
                if let Some(pc) = inner.pconfs.get_mut(id) {
                    pc.mark = false;
                }
                return;
            }
        };

        if let Some(pc) = inner.pconfs.get_mut(id) {
            pc.mark = false;
            if pc.mtime == mtime {
                return;
            }
        }

        let json = match std::fs::read_to_string(path) {
            Ok(j) => j,
            Err(e) => {
                error!("Unable to read {}: {}", path.display(), e);
                error!("Config for project '{}' not updated", id);
                return;
            }
        };

        let cfg: ProjectConfig = match serde_json::from_str(&json) {
            Ok(c) => c,
            Err(e) => {
                error!("Unable to parse {}: {}", path.display(), e);
                error!("Config for project '{}' not updated", id);
                return;
            }
        };

        let refresh_interval = cfg.gitrepo.refresh_interval;
        inner.pconfs.insert(
            id.to_string(),
            Pconf {
                mtime,
                cfg: Arc::new(cfg),
                mark: false,
            },
        );

        let p = match inner.projects.iter().find(|p| p.id == id) {
            Some(p) => p.clone(),
            None => {
                let p = Arc::new(Project::new(id));
                inner.projects.insert(0, p.clone());
                info!("{}: Project initialized", id);
                p
            }
        };

        {
            let mut st = p.state.lock().unwrap();
            st.pending_jobs |=
                JOB_UPDATE_REPO | JOB_CHECK_FOR_BUILDS | JOB_GENERATE_RELEASES;
            st.refresh_interval = refresh_interval;
            st.next_refresh = if refresh_interval > 0 {
                Some(Instant::now() + Duration::from_secs(refresh_interval))
            } else {
                None
            };
        }

        info!("{}: Config loaded", id);
    }
}
