//! Per-project worker scheduling
//!
//! One dispatcher task watches every project's pending-job mask and refresh
//! deadline. A project with work and no active worker gets a detached worker
//! task that drains the mask and exits; at most one worker runs per project.

use crate::core::Core;
use crate::project::{
    Project, JOB_CHECK_FOR_BUILDS, JOB_GENERATE_RELEASES, JOB_NOTIFY_REPO_UPDATE, JOB_UPDATE_REPO,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub async fn run_dispatcher(core: Arc<Core>) {
    loop {
        let mut next_deadline: Option<Instant> = None;
        let mut to_spawn: Vec<Arc<Project>> = Vec::new();

        {
            let now = Instant::now();
            for p in core.registry.all() {
                let mut st = p.state.lock().unwrap();

                if let Some(nr) = st.next_refresh {
                    if now >= nr {
                        st.pending_jobs |= JOB_UPDATE_REPO;
                        st.next_refresh = Some(
                            now + std::time::Duration::from_secs(st.refresh_interval),
                        );
                    } else {
                        next_deadline = Some(match next_deadline {
                            Some(d) if d < nr => d,
                            _ => nr,
                        });
                    }
                }

                if st.pending_jobs != 0 && !st.worker_active {
                    st.worker_active = true;
                    to_spawn.push(p.clone());
                }
            }
        }

        if to_spawn.is_empty() {
            match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let _ = tokio::time::timeout(timeout, core.registry.notify.notified()).await;
                }
                None => core.registry.notify.notified().await,
            }
            continue;
        }

        for p in to_spawn {
            info!("{}: Starting worker task", p.id);
            let core = core.clone();
            tokio::spawn(async move {
                project_worker(core, p).await;
            });
        }
    }
}

async fn project_worker(core: Arc<Core>, p: Arc<Project>) {
    loop {
        let pending = p.take_pending();
        if pending == 0 {
            break;
        }

        if pending & JOB_UPDATE_REPO != 0 {
            if let Err(e) = crate::git::repo_sync(&core, &p).await {
                error!("{}: Repo sync failed: {}", p.id, e);
            }
        }

        if pending & JOB_NOTIFY_REPO_UPDATE != 0 {
            notify_repo_update(&core, &p).await;
        }

        if pending & JOB_CHECK_FOR_BUILDS != 0 {
            if let Err(e) = crate::buildmaster::check_for_builds(&core, &p).await {
                error!("{}: Build check failed: {}", p.id, e);
            }
        }

        if pending & JOB_GENERATE_RELEASES != 0 {
            if let Err(e) = crate::releasemaker::update_project(&core, &p).await {
                error!("{}: Release update failed: {}", p.id, e);
            }
        }
    }

    info!("{}: Stopping worker task", p.id);
    p.set_worker_active(false);
}

/// Fire-and-forget GET to every configured repo-update webhook.
async fn notify_repo_update(core: &Core, p: &Project) {
    let Some(cfg) = core.registry.get_cfg(&p.id) else {
        return;
    };

    for url in &cfg.repo_update_notifications {
        info!("{}: Invoking {}", p.id, url);
        if let Err(e) = core.http_client.get(url).send().await {
            error!("{}: Notification to {} failed: {}", p.id, url, e);
        }
    }
}
