//! RPC endpoint behaviour: long-poll boundaries, artifact storage
//! dispatch and report preconditions

mod common;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use common::{test_core, write_project_cfg};
use doozer::buildmaster::api::{self, ArtifactParams, AuthParams, GetJobParams, ReportParams};
use doozer::database::models::BuildStatus;
use doozer::database::queries::Queries;
use serde_json::json;

fn json_accept() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(header::ACCEPT, "application/json".parse().unwrap());
    h
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn agents_config() -> serde_json::Value {
    json!({
        "http": {"longpoll_timeout": 0},
        "buildmaster": {"agents": {"agent1": {"secret": "sekrit"}}}
    })
}

#[tokio::test]
async fn hello_validates_agent_and_secret() {
    let tmp = tempfile::tempdir().unwrap();
    let core = test_core(tmp.path(), agents_config()).await;

    let ok = api::hello(
        State(core.clone()),
        Query(AuthParams {
            agent: Some("agent1".into()),
            secret: Some("sekrit".into()),
        }),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(ok.status(), StatusCode::OK);

    let missing = api::hello(
        State(core.clone()),
        Query(AuthParams {
            agent: None,
            secret: None,
        }),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let wrong = api::hello(
        State(core),
        Query(AuthParams {
            agent: Some("agent1".into()),
            secret: Some("nope".into()),
        }),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn getjob_with_zero_longpoll_returns_none_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let core = test_core(tmp.path(), agents_config()).await;

    let resp = api::getjob(
        State(core),
        Query(GetJobParams {
            agent: Some("agent1".into()),
            secret: Some("sekrit".into()),
            targets: Some("linux-x64".into()),
        }),
        json_accept(),
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["type"], "none");
}

#[tokio::test]
async fn getjob_requires_targets() {
    let tmp = tempfile::tempdir().unwrap();
    let core = test_core(tmp.path(), agents_config()).await;

    for targets in [None, Some("".to_string()), Some(",,".to_string())] {
        let resp = api::getjob(
            State(core.clone()),
            Query(GetJobParams {
                agent: Some("agent1".into()),
                secret: Some("sekrit".into()),
                targets,
            }),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn getjob_returns_claimed_build_with_repo_url() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(
        tmp.path(),
        "acme",
        "widget",
        &json!({"gitrepo": {"pub": "https://git.example.com/widget.git"}}),
    );
    let core = test_core(tmp.path(), agents_config()).await;
    core.registry.reload().unwrap();

    Queries::insert_build(
        core.db.pool(),
        "acme/widget",
        &"ab".repeat(20),
        "linux-x64",
        "Automatic build",
        "1.0.2",
        false,
    )
    .await
    .unwrap();

    let resp = api::getjob(
        State(core),
        Query(GetJobParams {
            agent: Some("agent1".into()),
            secret: Some("sekrit".into()),
            targets: Some("linux-x64,darwin".into()),
        }),
        json_accept(),
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["type"], "build");
    assert_eq!(v["project"], "acme/widget");
    assert_eq!(v["repo"], "https://git.example.com/widget.git");
    assert_eq!(v["version"], "1.0.2");
    assert!(v["jobsecret"].as_str().unwrap().parse::<u32>().is_ok());
}

async fn claimed_job(core: &std::sync::Arc<doozer::core::Core>) -> (i64, String) {
    Queries::insert_build(
        core.db.pool(),
        "acme/widget",
        &"ab".repeat(20),
        "linux-x64",
        "Automatic build",
        "1.0",
        false,
    )
    .await
    .unwrap();
    let job = Queries::claim_build(
        core.db.pool(),
        &["linux-x64".to_string()],
        "agent1",
    )
    .await
    .unwrap();
    (job.id, job.jobsecret)
}

fn artifact_params(jobid: i64, secret: &str, name: &str) -> ArtifactParams {
    ArtifactParams {
        jobid,
        jobsecret: secret.to_string(),
        artifact_type: "app".to_string(),
        name: name.to_string(),
        md5sum: "0".repeat(32),
        sha1sum: "1".repeat(40),
        origsize: None,
    }
}

fn put_request(body: &[u8], content_type: &str) -> (HeaderMap, Request) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    let req = Request::builder()
        .method("PUT")
        .uri("/buildmaster/artifact")
        .body(Body::from(body.to_vec()))
        .unwrap();
    (headers, req)
}

#[tokio::test]
async fn small_plain_text_artifacts_are_embedded() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), agents_config()).await;
    core.registry.reload().unwrap();

    let (jobid, secret) = claimed_job(&core).await;

    let (headers, req) = put_request(b"short log line\n", "text/plain");
    let resp = api::put_artifact(
        State(core.clone()),
        Query(artifact_params(jobid, &secret, "log.txt")),
        headers,
        req,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let arts = Queries::artifacts_for_build(core.db.pool(), jobid)
        .await
        .unwrap();
    assert_eq!(arts.len(), 1);
    assert_eq!(arts[0].storage, "embedded");
    assert_eq!(arts[0].payload, b"short log line\n");
}

#[tokio::test]
async fn large_or_binary_artifacts_become_files() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), agents_config()).await;
    core.registry.reload().unwrap();

    let (jobid, secret) = claimed_job(&core).await;

    // Binary content type forces file storage regardless of size
    let (headers, req) = put_request(b"\x7fELF...", "application/octet-stream");
    let resp = api::put_artifact(
        State(core.clone()),
        Query(artifact_params(jobid, &secret, "app.bin")),
        headers,
        req,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // Plain text over the embed threshold does too
    let big = vec![b'x'; 20000];
    let (headers, req) = put_request(&big, "text/plain");
    let resp = api::put_artifact(
        State(core.clone()),
        Query(artifact_params(jobid, &secret, "big.txt")),
        headers,
        req,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let arts = Queries::artifacts_for_build(core.db.pool(), jobid)
        .await
        .unwrap();
    assert!(arts.iter().all(|a| a.storage == "file"));

    let stored = core.artifact_path("acme/widget").join(format!("{}/app.bin", jobid));
    assert!(stored.is_file());
}

#[tokio::test]
async fn artifact_put_rejects_wrong_secret_and_finished_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), agents_config()).await;
    core.registry.reload().unwrap();

    let (jobid, secret) = claimed_job(&core).await;

    let (headers, req) = put_request(b"x", "text/plain");
    let resp = api::put_artifact(
        State(core.clone()),
        Query(artifact_params(jobid, "badsecret", "x")),
        headers,
        req,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    Queries::finish_build(core.db.pool(), BuildStatus::Done, None, jobid)
        .await
        .unwrap();
    let (headers, req) = put_request(b"x", "text/plain");
    let resp = api::put_artifact(
        State(core.clone()),
        Query(artifact_params(jobid, &secret, "x")),
        headers,
        req,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn reports_on_finished_jobs_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), agents_config()).await;
    core.registry.reload().unwrap();

    let (jobid, secret) = claimed_job(&core).await;
    Queries::finish_build(core.db.pool(), BuildStatus::Done, None, jobid)
        .await
        .unwrap();

    let resp = api::report(
        State(core),
        Query(ReportParams {
            jobid,
            jobsecret: secret,
            status: "building".to_string(),
            msg: Some("late progress".to_string()),
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}
