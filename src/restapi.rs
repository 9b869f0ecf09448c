//! Read-only REST queries for UIs
//!
//! `/projects/<org>/<name>/builds.json`, `builds.count`, `builds/<id>`,
//! `revisions/<rev>` and `releases.json`.

use crate::core::Core;
use crate::database::models::{Artifact, Build};
use crate::database::queries::Queries;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

fn build_to_json(b: &Build) -> serde_json::Value {
    let mut m = json!({
        "id": b.id,
        "revision": b.revision,
        "target": b.target,
        "version": b.version,
        "reason": b.reason,
        "status": b.status,
        "created": b.created.timestamp(),
    });
    if let Some(t) = b.buildstart {
        m["build_start"] = json!(t.timestamp());
    }
    if let Some(t) = b.buildend {
        m["build_end"] = json!(t.timestamp());
    }
    if let Some(t) = b.status_change {
        m["status_change"] = json!(t.timestamp());
    }
    if let Some(a) = &b.agent {
        m["agent"] = json!(a);
    }
    if let Some(p) = &b.progress_text {
        if !p.is_empty() {
            m["progress_text"] = json!(p);
        }
    }
    m
}

fn artifact_to_json(a: &Artifact, prefix: Option<&str>) -> serde_json::Value {
    let mut m = json!({
        "id": a.id,
        "created": a.created.timestamp(),
        "name": a.name,
        "type": a.artifact_type,
        "size": a.size,
        "md5": a.md5,
        "sha1": a.sha1,
        "dlcount": a.dlcount,
        "patchcount": a.patchcount,
        "contenttype": a.contenttype,
        "encoding": a.encoding,
    });
    if let Some(prefix) = prefix {
        m["url"] = json!(format!("{}/file/{}", prefix, a.sha1));
    }
    m
}

#[derive(Deserialize)]
pub struct PageParams {
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
}

pub async fn projects_dispatch(
    State(core): State<Arc<Core>>,
    UrlPath((org, name, rest)): UrlPath<(String, String, String)>,
    Query(page): Query<PageParams>,
) -> Response {
    let project = format!("{}/{}", org, name);

    match rest.as_str() {
        "builds.json" => list_builds(&core, &project, page).await,
        "builds.count" => count_builds(&core, &project).await,
        "releases.json" => releases(&core, &project).await,
        other => {
            if let Some(id) = other.strip_prefix("builds/") {
                one_build(&core, &project, id).await
            } else if let Some(rev) = other.strip_prefix("revisions/") {
                one_revision(&core, &project, rev).await
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }
}

async fn list_builds(core: &Core, project: &str, page: PageParams) -> Response {
    let limit = page.limit.unwrap_or(10);
    match Queries::list_builds(core.db.pool(), project, page.offset, limit).await {
        Ok(builds) => {
            Json(builds.iter().map(build_to_json).collect::<Vec<_>>()).into_response()
        }
        Err(e) => {
            error!("builds.json query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn count_builds(core: &Core, project: &str) -> Response {
    match Queries::count_builds(core.db.pool(), project).await {
        Ok(n) => (
            [(header::CONTENT_TYPE, "text/plain")],
            format!("{}", n),
        )
            .into_response(),
        Err(e) => {
            error!("builds.count query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn one_build(core: &Core, project: &str, id: &str) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let build = match Queries::get_build_for_project(core.db.pool(), id, project).await {
        Ok(Some(b)) => b,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("build query failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let artifacts = match Queries::artifacts_for_build(core.db.pool(), id).await {
        Ok(a) => a,
        Err(e) => {
            error!("artifact query failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let prefix = core.config.artifact_prefix.as_deref();
    let mut m = build_to_json(&build);
    m["artifacts"] = json!(artifacts
        .iter()
        .map(|a| artifact_to_json(a, prefix))
        .collect::<Vec<_>>());
    Json(m).into_response()
}

async fn one_revision(core: &Core, project: &str, rev: &str) -> Response {
    let Some(p) = core.registry.get(project) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // A version-style suffix after a dot is tolerated and stripped
    let revision = rev.split('.').next().unwrap_or(rev).to_string();

    let version = match crate::git::describe(core, &p, rev, false).await {
        Ok(v) => v,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let builds = match Queries::builds_by_revision(core.db.pool(), &revision, project).await {
        Ok(b) => b,
        Err(e) => {
            error!("revision query failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(json!({
        "id": revision,
        "version": version,
        "builds": builds.iter().map(build_to_json).collect::<Vec<_>>(),
    }))
    .into_response()
}

async fn releases(core: &Core, project: &str) -> Response {
    let Some(cfg) = core.registry.get_cfg(project) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(dir) = &cfg.release_tracks.manifest_dir else {
        return StatusCode::PRECONDITION_FAILED.into_response();
    };

    let path = std::path::Path::new(dir).join("all.json");
    match std::fs::read(&path) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Unable to read {}: {}", path.display(), e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
