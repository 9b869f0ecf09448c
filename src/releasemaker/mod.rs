//! Release maker
//!
//! Derives "most recent successful build per target per branch" by walking
//! the commit DAG from each track's branch tip, then regenerates the
//! per-target manifests and the aggregate all.json, writing only on change.

use crate::core::Core;
use crate::database::models::Artifact;
use crate::database::queries::Queries;
use crate::error::DoozerError;
use crate::project::{branch_pattern_matches, Project, ProjectConfig};
use git2::{Oid, Sort};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// How deep below a branch tip we look for a successful build.
const SEARCH_DEPTH: usize = 100;

/// A build selected to represent a target on some branch.
#[derive(Debug)]
pub(crate) struct ReleaseBuild {
    pub(crate) id: i64,
    pub(crate) target: String,
    pub(crate) branch: String,
    pub(crate) version: String,
    pub(crate) oid: Oid,
    pub(crate) artifacts: Vec<Artifact>,
}

#[derive(Debug, PartialEq, Eq)]
enum WriteOutcome {
    Unchanged,
    Written,
}

pub async fn update_project(core: &Arc<Core>, p: &Arc<Project>) -> Result<(), DoozerError> {
    info!("{}: Starting releasemaker check", p.id);

    let cfg = core
        .registry
        .get_cfg(&p.id)
        .ok_or_else(|| DoozerError::Config("No project config".to_string()))?;

    if cfg.release_tracks.tracks.is_empty() {
        info!("{}: No tracks configured", p.id);
        return Err(DoozerError::Config("No tracks configured".to_string()));
    }
    if cfg.release_tracks.targets.is_empty() {
        info!("{}: No targets configured", p.id);
        return Err(DoozerError::Config("No targets configured".to_string()));
    }

    let builds = list_release_builds(core, p, &cfg).await?;
    generate_update_tracks(core, p, &cfg, &builds).await;
    Ok(())
}

/// The currently released builds (with artifacts) for every track target.
/// Also used by the control socket's `show builds` and deprecated-build
/// cleanup, which must not delete anything still referenced here.
pub(crate) async fn list_release_builds(
    core: &Arc<Core>,
    p: &Arc<Project>,
    cfg: &ProjectConfig,
) -> Result<Vec<ReleaseBuild>, DoozerError> {
    let mut builds = find_successful_builds(core, p, cfg).await?;
    for b in &mut builds {
        b.artifacts = Queries::artifacts_for_build(core.db.pool(), b.id).await?;
    }
    Ok(builds)
}

/// For each track, take the first branch (branches come in descending
/// dictionary order) matching the track pattern and walk its tip looking
/// for the closest successful build per configured target.
async fn find_successful_builds(
    core: &Arc<Core>,
    p: &Arc<Project>,
    cfg: &ProjectConfig,
) -> Result<Vec<ReleaseBuild>, DoozerError> {
    let branches = crate::git::list_branches(core, p).await?;
    let mut out: Vec<ReleaseBuild> = Vec::new();

    for track in &cfg.release_tracks.tracks {
        let Some(branch) = branches
            .iter()
            .find(|b| branch_pattern_matches(&track.branch, &b.name))
        else {
            info!(
                "{}: No matching ref for branch pattern {}",
                p.id, track.branch
            );
            continue;
        };

        let mut pending: Vec<String> = cfg
            .release_tracks
            .targets
            .iter()
            .map(|t| t.target.clone())
            .filter(|t| {
                !out.iter()
                    .any(|b| b.branch == branch.name && &b.target == t)
            })
            .collect();
        if pending.is_empty() {
            continue;
        }

        let start = branch.oid;
        let commits: Vec<Oid> = crate::git::with_repo(core, p, move |repo| {
            let mut walk = repo.revwalk()?;
            walk.push(start)?;
            walk.set_sorting(Sort::TOPOLOGICAL)?;
            let mut commits = Vec::new();
            for oid in walk.take(SEARCH_DEPTH) {
                commits.push(oid?);
            }
            Ok(commits)
        })
        .await?;

        for oid in commits {
            let rows =
                Queries::done_builds_at_revision(core.db.pool(), &oid.to_string(), &p.id).await?;

            for (id, target, version) in rows {
                if let Some(pos) = pending.iter().position(|t| t == &target) {
                    pending.remove(pos);
                    out.push(ReleaseBuild {
                        id,
                        target,
                        branch: branch.name.clone(),
                        version,
                        oid,
                        artifacts: Vec::new(),
                    });
                }
            }

            if pending.is_empty() {
                break;
            }
        }

        for t in &pending {
            info!("{}: No build for target {} in {}", p.id, t, branch.name);
        }
    }

    Ok(out)
}

/// The embedded manifest a project may carry at `Manifests/<target>.json`.
async fn embedded_manifest(
    core: &Arc<Core>,
    p: &Arc<Project>,
    target: &str,
    oid: Oid,
) -> Option<serde_json::Value> {
    let path = format!("Manifests/{}.json", target);
    let bytes = crate::git::with_repo(core, p, move |repo| crate::git::file_at(repo, oid, &path))
        .await
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn generate_update_tracks(
    core: &Arc<Core>,
    p: &Arc<Project>,
    cfg: &ProjectConfig,
    builds: &[ReleaseBuild],
) {
    let rt = &cfg.release_tracks;

    let baseurl = rt
        .artifact_prefix
        .clone()
        .or_else(|| core.config.artifact_prefix.clone());
    let Some(baseurl) = baseurl else {
        info!("{}: No artifactPrefix configured", p.id);
        return;
    };

    let mut out_tracks: Vec<serde_json::Value> = Vec::new();

    for track in &rt.tracks {
        let mut out_targets: Vec<serde_json::Value> = Vec::new();

        for tcfg in &rt.targets {
            let Some(b) = builds.iter().find(|b| {
                b.target == tcfg.target && branch_pattern_matches(&track.branch, &b.branch)
            }) else {
                info!(
                    "{}: ReleaseTrack {}: Target {}: no matching branch for pattern '{}'",
                    p.id, track.name, tcfg.target, track.branch
                );
                continue;
            };

            info!(
                "{}: ReleaseTrack {}: Target {}: Using branch '{}' for pattern '{}'",
                p.id, track.name, tcfg.target, b.branch, track.branch
            );

            if tcfg.artifacts.is_empty() {
                info!(
                    "{}: Manifest: Target {}: No artifacts configured",
                    p.id, tcfg.target
                );
                continue;
            }

            let manifest = embedded_manifest(core, p, &tcfg.target, b.oid).await;

            let mut single = json!({
                "arch": b.target,
                "version": b.version,
                "branch": b.branch,
            });
            if let Some(title) = &tcfg.title {
                single["title"] = json!(title);
            }
            let mut all = single.clone();

            let mut artifacts_single: Vec<serde_json::Value> = Vec::new();
            let mut artifacts_all: Vec<serde_json::Value> = Vec::new();

            for acfg in &tcfg.artifacts {
                for a in b
                    .artifacts
                    .iter()
                    .filter(|a| a.artifact_type == acfg.artifact_type)
                {
                    let mut artifact = json!({
                        "type": a.artifact_type,
                        "name": a.name,
                        "sha1": a.sha1,
                        "size": a.size,
                        "url": format!("{}/file/{}", baseurl, a.sha1),
                    });
                    artifacts_single.push(artifact.clone());

                    // Only titled artifacts are surfaced on download pages
                    if let Some(title) = &acfg.title {
                        artifact["title"] = json!(title);
                        artifacts_all.push(artifact);
                    }
                }
            }

            let got_all_artifacts = !artifacts_all.is_empty();
            single["artifacts"] = json!(artifacts_single);
            all["artifacts"] = json!(artifacts_all);

            if let Some(m) = manifest {
                single["manifest"] = m.clone();
                all["manifest"] = m;
            }

            if let Ok(changes) = changelog_for(core, p, b).await {
                single["changelog"] = json!(changes
                    .iter()
                    .map(|c| json!({"version": c.version, "desc": c.msg}))
                    .collect::<Vec<_>>());
            }

            let mname = format!("{}-{}.json", track.name, b.target);
            match write_manifest(core, cfg, p, &mname, &single).await {
                Ok(WriteOutcome::Unchanged) => {}
                Ok(WriteOutcome::Written) => {
                    info!(
                        "{}: {} release '{}' available for {}",
                        p.id, track.title, b.version, b.target
                    );
                }
                Err(e) => {
                    warn!(
                        "{}: Unable to write releasetrack file {}: {}",
                        p.id, mname, e
                    );
                }
            }

            if got_all_artifacts {
                out_targets.push(all);
            }
        }

        // A track without a description stays off download pages entirely
        if let Some(desc) = &track.description {
            out_tracks.push(json!({
                "id": track.name,
                "name": track.title,  // Legacy
                "title": track.title,
                "description": desc,
                "targets": out_targets,
            }));
        }
    }

    match write_manifest(core, cfg, p, "all.json", &json!(out_tracks)).await {
        Ok(WriteOutcome::Unchanged) => {}
        Ok(WriteOutcome::Written) => info!("{}: Release manifest generated", p.id),
        Err(e) => warn!("{}: Unable to write updatemanifest file: {}", p.id, e),
    }
}

async fn changelog_for(
    core: &Arc<Core>,
    p: &Arc<Project>,
    b: &ReleaseBuild,
) -> Result<Vec<crate::git::Change>, DoozerError> {
    let oid = b.oid;
    let target = b.target.clone();
    crate::git::with_repo(core, p, move |repo| {
        crate::git::changelog_of(repo, oid, 0, 100, false, Some(&target))
    })
    .await
}

/// Publish a manifest to the filesystem (atomic, only when changed) or to
/// `s3://<prefix>` with the project's credentials.
async fn write_manifest(
    core: &Arc<Core>,
    cfg: &ProjectConfig,
    p: &Arc<Project>,
    name: &str,
    value: &serde_json::Value,
) -> Result<WriteOutcome, DoozerError> {
    let Some(manifest_dir) = &cfg.release_tracks.manifest_dir else {
        info!("{}: No manifestDir configured", p.id);
        return Err(DoozerError::Config("No manifestDir configured".to_string()));
    };

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| DoozerError::Io(e.to_string()))?;

    if let Some(prefix) = manifest_dir.strip_prefix("s3://") {
        let Some((bucket, awsid, secret)) = cfg.s3.credentials() else {
            return Err(DoozerError::Config("Missing S3 config".to_string()));
        };
        let path = format!("{}/{}", prefix.trim_end_matches('/'), name);
        crate::s3::put_file(
            &core.http_client,
            bucket,
            awsid,
            secret,
            &path,
            json.into_bytes(),
            "application/json",
        )
        .await?;
        return Ok(WriteOutcome::Written);
    }

    let dir = PathBuf::from(manifest_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(name);

    if let Ok(existing) = std::fs::read(&path) {
        if existing == json.as_bytes() {
            return Ok(WriteOutcome::Unchanged);
        }
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, &path)?;
    Ok(WriteOutcome::Written)
}
