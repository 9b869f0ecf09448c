//! GitHub push webhook
//!
//! The legacy form-encoded hook: `POST /github?project=<id>&key=<key>` with
//! the event JSON in a `payload` form field. A valid push logs the commit
//! summaries and schedules a repo refresh.

use crate::core::Core;
use crate::project::JOB_UPDATE_REPO;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Form;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Deserialize)]
pub struct GithubParams {
    project: Option<String>,
    key: Option<String>,
}

#[derive(Deserialize)]
pub struct GithubForm {
    payload: Option<String>,
}

fn count_list(commit: &serde_json::Value, field: &str) -> usize {
    commit
        .get(field)
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

pub async fn webhook(
    State(core): State<Arc<Core>>,
    Query(params): Query<GithubParams>,
    Form(form): Form<GithubForm>,
) -> StatusCode {
    let Some(project) = params.project else {
        warn!("github: Missing 'project' in request");
        return StatusCode::BAD_REQUEST;
    };
    let Some(key) = params.key else {
        warn!("github: Missing 'key' in request");
        return StatusCode::BAD_REQUEST;
    };

    let Some(cfg) = core.registry.get_cfg(&project) else {
        info!("github: Project '{}' not configured", project);
        return StatusCode::NOT_FOUND;
    };

    if cfg.github.key.as_deref().unwrap_or("") != key {
        warn!("github: Invalid key received for project {}", project);
        return StatusCode::FORBIDDEN;
    }

    let Some(payload) = form.payload else {
        warn!("{}: github: Missing payload in request", project);
        return StatusCode::BAD_REQUEST;
    };

    let msg: serde_json::Value = match serde_json::from_str(&payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("{}: github: Malformed JSON in request: {}", project, e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let git_ref = msg
        .get("ref")
        .and_then(|r| r.as_str())
        .map(|r| r.trim_start_matches("refs/heads/"));

    let commits = msg.get("commits").and_then(|c| c.as_array());

    if let (Some(git_ref), Some(commits)) = (git_ref, commits) {
        for c in commits {
            let author = c
                .get("author")
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("???");
            let message = c.get("message").and_then(|m| m.as_str()).unwrap_or("");

            let added = count_list(c, "added");
            let removed = count_list(c, "removed");
            let modified = count_list(c, "modified");

            let mut parts = Vec::new();
            if added > 0 {
                parts.push(format!("{} file{} added", added, plural(added)));
            }
            if modified > 0 {
                parts.push(format!("{} file{} modified", modified, plural(modified)));
            }
            if removed > 0 {
                parts.push(format!("{} file{} removed", removed, plural(removed)));
            }

            info!(
                "{}: Commit in '{}' by {} [{}]",
                project,
                git_ref,
                author,
                parts.join(", ")
            );
            info!("{}: {}", project, message);
        }

        core.registry.schedule_job_id(&project, JOB_UPDATE_REPO);
    }

    StatusCode::OK
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
