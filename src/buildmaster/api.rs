//! HTTP RPC surface between the buildmaster and its agents

use crate::core::Core;
use crate::database::models::Storage;
use crate::database::queries::{ClaimedJob, Queries};
use crate::error::DoozerError;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Agent credentials arrive either as query parameters or as basic auth.
fn agent_credentials(
    agent: Option<String>,
    secret: Option<String>,
    headers: &HeaderMap,
) -> Option<(String, String)> {
    if let (Some(a), Some(s)) = (agent, secret) {
        return Some((a, s));
    }

    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = auth.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn authenticate(
    core: &Core,
    agent: Option<String>,
    secret: Option<String>,
    headers: &HeaderMap,
) -> Result<String, StatusCode> {
    let Some((agent, secret)) = agent_credentials(agent, secret, headers) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    match core.config.agent_secret(&agent) {
        None => {
            error!("Agent '{}' not configured", agent);
            Err(StatusCode::FORBIDDEN)
        }
        Some(expected) if expected != secret => {
            error!("Agent '{}' rejected because of invalid secret", agent);
            Err(StatusCode::FORBIDDEN)
        }
        Some(_) => Ok(agent),
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

#[derive(Deserialize)]
pub struct AuthParams {
    pub agent: Option<String>,
    pub secret: Option<String>,
}

pub async fn hello(
    State(core): State<Arc<Core>>,
    Query(params): Query<AuthParams>,
    headers: HeaderMap,
) -> Response {
    match authenticate(&core, params.agent, params.secret, &headers) {
        Ok(_) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "welcome\n",
        )
            .into_response(),
        Err(code) => code.into_response(),
    }
}

#[derive(Deserialize)]
pub struct GetJobParams {
    pub agent: Option<String>,
    pub secret: Option<String>,
    pub targets: Option<String>,
}

fn none_response(json: bool) -> Response {
    if json {
        Json(serde_json::json!({"type": "none"})).into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "type=none\n",
        )
            .into_response()
    }
}

fn job_response(json: bool, job: &ClaimedJob, repo: &str) -> Response {
    if json {
        Json(serde_json::json!({
            "type": "build",
            "id": job.id,
            "revision": job.revision,
            "target": job.target,
            "jobsecret": job.jobsecret,
            "project": job.project,
            "repo": repo,
            "version": job.version,
            "no_output": job.no_output,
        }))
        .into_response()
    } else {
        let body = format!(
            "type=build\nid={}\nrevision={}\ntarget={}\njobsecret={}\nproject={}\nrepo={}\nversion={}\nno_output={}\n",
            job.id,
            job.revision,
            job.target,
            job.jobsecret,
            job.project,
            repo,
            job.version,
            job.no_output as i32,
        );
        (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

/// Long-poll claim. Sleeps in one-second ticks until a pending build shows
/// up or the deadline passes, then answers `type=none`.
pub async fn getjob(
    State(core): State<Arc<Core>>,
    Query(params): Query<GetJobParams>,
    headers: HeaderMap,
) -> Response {
    let targets_arg = params.targets.clone();
    let agent = match authenticate(&core, params.agent, params.secret, &headers) {
        Ok(a) => a,
        Err(code) => return code.into_response(),
    };

    let Some(targets_arg) = targets_arg else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let targets: Vec<String> = targets_arg
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if targets.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let json = wants_json(&headers);
    let deadline =
        Instant::now() + Duration::from_secs(core.config.http.longpoll_timeout);
    let mut fails = 0;

    loop {
        match Queries::claim_build(core.db.pool(), &targets, &agent).await {
            Ok(job) => {
                let upstream = core
                    .registry
                    .get_cfg(&job.project)
                    .and_then(|cfg| cfg.gitrepo.upstream.clone());

                let Some(upstream) = upstream else {
                    // Hand the row back; the claim is unusable without a
                    // repo URL for the agent.
                    let _ = Queries::restart_build(
                        core.db.pool(),
                        crate::database::models::BuildStatus::Pending,
                        job.id,
                    )
                    .await;
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                };

                info!(
                    "{}: Build #{}: {} rev:{:.8} claimed by {}",
                    job.project, job.id, job.version, job.revision, agent
                );
                return job_response(json, &job, &upstream);
            }
            Err(DoozerError::NoData) => {
                if Instant::now() >= deadline {
                    return none_response(json);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(DoozerError::BadRequest(_)) => {
                return StatusCode::BAD_REQUEST.into_response();
            }
            Err(e) if e.is_transient() => {
                fails += 1;
                if fails >= 10 {
                    return none_response(json);
                }
                info!("Transient error while claiming, retry #{}: {}", fails, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                error!("Claim failed: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }
}

#[derive(Deserialize)]
pub struct ArtifactParams {
    pub jobid: i64,
    pub jobsecret: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub md5sum: String,
    pub sha1sum: String,
    pub origsize: Option<i64>,
}

/// Artifact upload. An S3-configured project gets a signed 307 redirect
/// before the body is read; everything else is streamed in and stored
/// embedded (small plain text) or as a file.
pub async fn put_artifact(
    State(core): State<Arc<Core>>,
    Query(params): Query<ArtifactParams>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    if params.jobsecret.is_empty()
        || params.artifact_type.is_empty()
        || params.name.is_empty()
        || params.md5sum.is_empty()
        || params.sha1sum.is_empty()
    {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let contenttype = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    debug!(
        "Build #{}: Received artifact '{}' content-encoding:'{}' content-type:'{}'",
        params.jobid,
        params.name,
        encoding.as_deref().unwrap_or("<unset>"),
        contenttype.as_deref().unwrap_or("<unset>")
    );

    let build = match Queries::get_build(core.db.pool(), params.jobid).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            error!("Received artifact for unknown job {}", params.jobid);
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            error!("Artifact lookup failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    if build.status != "building" {
        warn!(
            "{}: Build #{}: Artifact '{}' rejected because job is in state {}",
            build.project, params.jobid, params.name, build.status
        );
        return StatusCode::PRECONDITION_FAILED.into_response();
    }

    if build.jobsecret.as_deref() != Some(params.jobsecret.as_str()) {
        warn!(
            "{}: Build #{}: Artifact with invalid jobsecret",
            build.project, params.jobid
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(cfg) = core.registry.get_cfg(&build.project) else {
        return StatusCode::GONE.into_response();
    };

    let origsize = params.origsize.unwrap_or(0);

    if cfg.buildmaster.storage.as_deref() == Some("s3") {
        let Some((bucket, awsid, secret)) = cfg.s3.credentials() else {
            error!(
                "{}: Build #{}: Missing s3 config",
                build.project, params.jobid
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let key = format!("file/{}", params.sha1sum);
        let location = crate::s3::signed_put_url(
            bucket,
            awsid,
            secret,
            &key,
            contenttype.as_deref().unwrap_or(""),
            300,
        );

        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        if let Err(e) = Queries::insert_artifact(
            core.db.pool(),
            params.jobid,
            &params.artifact_type,
            key.as_bytes(),
            Storage::S3,
            &params.name,
            size,
            &params.md5sum,
            &params.sha1sum,
            contenttype.as_deref(),
            encoding.as_deref(),
            origsize,
        )
        .await
        {
            error!("Artifact insert failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        info!(
            "{}: Build #{}: Artifact '{}' stored at s3://{}/{}",
            build.project, params.jobid, params.name, bucket, key
        );

        return (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, location)],
        )
            .into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), 1 << 30).await {
        Ok(b) => b,
        Err(e) => {
            error!("Artifact body read failed: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let is_gzip = encoding.as_deref() == Some("gzip");
    let is_plain_text = contenttype
        .as_deref()
        .map(|ct| ct.starts_with("text/plain"))
        .unwrap_or(false);

    if body.len() > 16384 || is_gzip || !is_plain_text {
        let basepath = core.artifact_path(&build.project);
        let payload = format!("{}/{}", params.jobid, params.name);

        if let Err(e) =
            crate::artifacts::store_file(&basepath, params.jobid, &params.name, &body)
        {
            error!(
                "{}: Build #{}: Unable to store artifact '{}': {}",
                build.project, params.jobid, params.name, e
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        if let Err(e) = Queries::insert_artifact(
            core.db.pool(),
            params.jobid,
            &params.artifact_type,
            payload.as_bytes(),
            Storage::File,
            &params.name,
            body.len() as i64,
            &params.md5sum,
            &params.sha1sum,
            contenttype.as_deref(),
            encoding.as_deref(),
            origsize,
        )
        .await
        {
            error!("Artifact insert failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        info!(
            "{}: Build #{}: Artifact '{}' stored as file '{}'",
            build.project, params.jobid, params.name, payload
        );
    } else {
        if let Err(e) = Queries::insert_artifact(
            core.db.pool(),
            params.jobid,
            &params.artifact_type,
            &body,
            Storage::Embedded,
            &params.name,
            body.len() as i64,
            &params.md5sum,
            &params.sha1sum,
            contenttype.as_deref(),
            encoding.as_deref(),
            origsize,
        )
        .await
        {
            error!("Artifact insert failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        info!(
            "{}: Build #{}: Artifact '{}' stored in db",
            build.project, params.jobid, params.name
        );
    }

    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
pub struct ReportParams {
    pub jobid: i64,
    pub jobsecret: String,
    pub status: String,
    pub msg: Option<String>,
}

pub async fn report(
    State(core): State<Arc<Core>>,
    Query(params): Query<ReportParams>,
) -> Response {
    let build = match Queries::get_build(core.db.pool(), params.jobid).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            error!("Received report for unknown job {}", params.jobid);
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            error!("Report lookup failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    if build.status != "building" {
        warn!(
            "{}: Build #{}: Status update '{}' rejected because job is in state {}",
            build.project, params.jobid, params.status, build.status
        );
        return StatusCode::PRECONDITION_FAILED.into_response();
    }

    if build.jobsecret.as_deref() != Some(params.jobsecret.as_str()) {
        warn!(
            "{}: Build #{}: Status update with invalid jobsecret",
            build.project, params.jobid
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(p) = core.registry.get(&build.project) else {
        return StatusCode::GONE.into_response();
    };

    match crate::buildmaster::apply_report(
        &core,
        &p,
        params.jobid,
        &params.status,
        params.msg.as_deref(),
        &build.version,
        &build.target,
        build.attempts,
    )
    .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(DoozerError::BadRequest(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(e) => {
            error!("Report failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
