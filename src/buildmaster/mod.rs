//! Dispatch core
//!
//! Discovers pending builds from branch tips, hands them to agents through
//! the claim RPC, and recycles claims whose agent went quiet.

pub mod api;

use crate::core::Core;
use crate::database::models::BuildStatus;
use crate::database::queries::Queries;
use crate::error::DoozerError;
use crate::project::{Project, JOB_GENERATE_RELEASES};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Enqueue pending builds for every autobuild branch tip that is missing a
/// build row for one of the configured targets. Only tips are considered,
/// never historical commits.
pub async fn check_for_builds(core: &Arc<Core>, p: &Arc<Project>) -> Result<(), DoozerError> {
    info!("{}: Checking if need to build anything", p.id);

    let cfg = core
        .registry
        .get_cfg(&p.id)
        .ok_or_else(|| DoozerError::Config("No project config".to_string()))?;

    if cfg.buildmaster.targets.is_empty() {
        info!("{}: Project lacks buildmaster.targets config", p.id);
        return Err(DoozerError::Config(
            "Project lacks buildmaster.targets config".to_string(),
        ));
    }

    let branches = crate::git::list_branches(core, p).await?;

    for branch in branches {
        let Some(bc) = cfg.find_branch_config(&branch.name) else {
            continue;
        };
        if !bc.autobuild {
            continue;
        }

        let revision = branch.hex();
        info!(
            "{}: Checking build status for branch {} ({:.8})",
            p.id, branch.name, revision
        );

        let built = Queries::targets_built_at(core.db.pool(), &revision, &p.id).await?;

        for target in &cfg.buildmaster.targets {
            if built.iter().any(|t| t == target) {
                continue;
            }
            add_build(core, p, &revision, target, "Automatic build").await?;
        }
    }

    Ok(())
}

/// Enqueue one pending build with a derived version string.
pub async fn add_build(
    core: &Arc<Core>,
    p: &Arc<Project>,
    revision: &str,
    target: &str,
    reason: &str,
) -> Result<(), DoozerError> {
    let cfg = core
        .registry
        .get_cfg(&p.id)
        .ok_or_else(|| DoozerError::Config("No project config".to_string()))?;

    let version =
        crate::git::describe(core, p, revision, cfg.buildmaster.hash_in_revision).await?;

    info!(
        "{}: Enqueue build for {} ({:.8}) on {} by '{}'",
        p.id, version, revision, target, reason
    );

    Queries::insert_build(
        core.db.pool(),
        &p.id,
        revision,
        target,
        reason,
        &version,
        false,
    )
    .await?;

    Ok(())
}

/// Resolve a branch name (or accept a raw 40-hex revision) and enqueue a
/// build. Used by the control socket.
pub async fn add_build_by_name(
    core: &Arc<Core>,
    project: &str,
    branch_or_revision: &str,
    target: &str,
    reason: &str,
) -> Result<(), DoozerError> {
    let p = core
        .registry
        .get(project)
        .ok_or_else(|| DoozerError::BadRequest(format!("No such project: {}", project)))?;

    let branches = crate::git::list_branches(core, &p).await?;
    let revision = match branches.iter().find(|b| b.name == branch_or_revision) {
        Some(b) => b.hex(),
        None if branch_or_revision.len() == 40
            && branch_or_revision.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            branch_or_revision.to_string()
        }
        None => return Err(DoozerError::BadRequest("No such branch".to_string())),
    };

    add_build(core, &p, &revision, target, reason).await
}

/// Periodic maintenance task: drains the deleted-artifact tombstones one at
/// a time (briefly yielding between each so other work gets a chance) and
/// recycles expired claims every 60 seconds.
pub async fn run_periodic(core: Arc<Core>) {
    tokio::time::sleep(Duration::from_secs(5)).await;
    loop {
        match check_deleted_artifacts(&core).await {
            Ok(true) => {
                tokio::time::sleep(Duration::from_micros(250)).await;
                continue;
            }
            Ok(false) => {}
            Err(e) => error!("Deleted-artifact reaper failed: {}", e),
        }

        if let Err(e) = check_expired_builds(&core).await {
            error!("Expiry reaper failed: {}", e);
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

/// Builds whose agent stopped reporting go back to pending until the
/// attempt budget is spent, then become too_many_attempts.
pub async fn check_expired_builds(core: &Core) -> Result<(), DoozerError> {
    let timeout = core.config.buildmaster.buildtimeout;
    let maxattempts = core.config.buildmaster.buildattempts;
    let cutoff = Utc::now() - chrono::Duration::minutes(timeout);

    for b in Queries::expired_builds(core.db.pool(), cutoff).await? {
        warn!(
            "{}: Build #{}: Agent {} did not report back for attempt {}",
            b.project,
            b.id,
            b.agent.as_deref().unwrap_or("<unknown>"),
            b.attempts
        );

        let newstatus = if b.attempts >= maxattempts {
            warn!(
                "{}: Build #{}: too many build attempts failed. Giving up",
                b.project, b.id
            );
            BuildStatus::TooManyAttempts
        } else {
            BuildStatus::Pending
        };

        Queries::restart_build(core.db.pool(), newstatus, b.id).await?;
    }

    Ok(())
}

/// Drain one tombstone. Returns true when a tombstone was processed so the
/// caller loops without waiting.
pub async fn check_deleted_artifacts(core: &Core) -> Result<bool, DoozerError> {
    let Some(da) = Queries::next_deleted_artifact(core.db.pool()).await? else {
        return Ok(false);
    };

    match crate::artifacts::delete_stored(core, &da.storage, &da.payload, &da.project).await {
        Ok(()) => {
            info!(
                "{}: Deleted artifact {} {}:{}",
                da.project,
                da.name,
                da.storage,
                String::from_utf8_lossy(&da.payload)
            );
            Queries::drop_deleted_artifact(core.db.pool(), da.id).await?;
        }
        Err(e) => {
            error!(
                "{}: Failed to delete artifact {} {}: {}",
                da.project, da.name, da.storage, e
            );
            Queries::fail_deleted_artifact(core.db.pool(), &e.to_string(), da.id).await?;
        }
    }

    Ok(true)
}

/// Apply an agent status report to a building job.
pub async fn apply_report(
    core: &Core,
    p: &Arc<Project>,
    jobid: i64,
    status: &str,
    msg: Option<&str>,
    version: &str,
    target: &str,
    attempts: i64,
) -> Result<(), DoozerError> {
    let pool = core.db.pool();
    let url = core
        .registry
        .get_cfg(&p.id)
        .and_then(|cfg| cfg.build_url(jobid))
        .unwrap_or_default();

    match status {
        "building" => {
            Queries::update_progress(pool, msg.unwrap_or(""), jobid).await?;
            info!(
                "{}: Build #{}: {} for {} status: {}",
                p.id,
                jobid,
                version,
                target,
                msg.unwrap_or("")
            );
        }
        "failed" => {
            Queries::finish_build(pool, BuildStatus::Failed, msg, jobid).await?;
            warn!(
                "{}: Build #{}: {} for {} failed: {} {}",
                p.id,
                jobid,
                version,
                target,
                msg.unwrap_or(""),
                url
            );
        }
        "done" => {
            Queries::finish_build(pool, BuildStatus::Done, None, jobid).await?;
            info!(
                "{}: Build #{}: {} for {} completed {}",
                p.id, jobid, version, target, url
            );
            core.registry.schedule_job(p, JOB_GENERATE_RELEASES);
        }
        "tempfailed" => {
            // Retry policy lives here, not on the agent
            if attempts < core.config.buildmaster.buildattempts {
                Queries::restart_build(pool, BuildStatus::Pending, jobid).await?;
                warn!(
                    "{}: Build #{}: {} for {} temporarily failed (attempt {}): {}",
                    p.id,
                    jobid,
                    version,
                    target,
                    attempts,
                    msg.unwrap_or("")
                );
            } else {
                Queries::restart_build(pool, BuildStatus::TooManyAttempts, jobid).await?;
                warn!(
                    "{}: Build #{}: too many build attempts failed. Giving up. {}",
                    p.id, jobid, url
                );
            }
        }
        _ => {
            return Err(DoozerError::BadRequest(format!(
                "Unknown status '{}'",
                status
            )))
        }
    }

    Ok(())
}
