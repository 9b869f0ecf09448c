//! Artifact serving: encoding negotiation and bsdiff patch delivery

mod common;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use common::{test_core, write_project_cfg};
use doozer::artifacts;
use doozer::database::models::Storage;
use doozer::database::queries::Queries;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::sync::Arc;

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 1 << 26)
        .await
        .unwrap()
        .to_vec()
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Store `data` as a file artifact of a fresh build and return its sha1.
async fn file_artifact(
    core: &Arc<doozer::core::Core>,
    name: &str,
    data: &[u8],
    encoding: Option<&str>,
) -> String {
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
    let job = Queries::claim_build(core.db.pool(), &["linux-x64".to_string()], "agent1")
        .await
        .unwrap();

    let sha1 = sha1_hex(data);
    let base = core.artifact_path("acme/widget");
    artifacts::store_file(&base, job.id, name, data).unwrap();

    Queries::insert_artifact(
        core.db.pool(),
        job.id,
        "app",
        format!("{}/{}", job.id, name).as_bytes(),
        Storage::File,
        name,
        data.len() as i64,
        &"0".repeat(32),
        &sha1,
        Some("application/octet-stream"),
        encoding,
        0,
    )
    .await
    .unwrap();

    sha1
}

#[tokio::test]
async fn unknown_sha1_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let core = test_core(tmp.path(), json!({})).await;

    let resp = artifacts::serve_artifact(
        State(core),
        UrlPath("f".repeat(40)),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_artifact_served_with_disposition() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();

    let payload = b"binary payload".to_vec();
    let sha1 = file_artifact(&core, "app.bin", &payload, None).await;

    let resp = artifacts::serve_artifact(State(core), UrlPath(sha1), HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("app.bin"));
    assert_eq!(body_bytes(resp).await, payload);
}

#[tokio::test]
async fn gzip_artifact_inflated_for_clients_that_reject_it() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();

    let plain = b"the plain body of the artifact".to_vec();
    let mut enc = GzEncoder::new(Vec::new(), Compression::new(9));
    enc.write_all(&plain).unwrap();
    let packed = enc.finish().unwrap();

    let sha1 = file_artifact(&core, "app.gz", &packed, Some("gzip")).await;

    // No Accept-Encoding: the body comes back inflated
    let resp = artifacts::serve_artifact(
        State(core.clone()),
        UrlPath(sha1.clone()),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, plain);

    // A gzip-accepting client gets the stored bytes verbatim
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
    let resp = artifacts::serve_artifact(State(core), UrlPath(sha1), headers).await;
    assert_eq!(
        resp.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );
    assert_eq!(body_bytes(resp).await, packed);
}

#[tokio::test]
async fn bspatch_request_builds_and_serves_a_patch() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();

    let old_body = b"release one content: aaaaaaaaaaaaaaaa".to_vec();
    let new_body = b"release two content: aaaaaaaaaaaaaaaa plus".to_vec();

    let old_sha1 = file_artifact(&core, "app-1.bin", &old_body, None).await;
    let new_sha1 = file_artifact(&core, "app-2.bin", &new_body, None).await;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT_ENCODING,
        format!("bspatch-from-{}", old_sha1).parse().unwrap(),
    );

    let resp = artifacts::serve_artifact(
        State(core.clone()),
        UrlPath(new_sha1.clone()),
        headers.clone(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "binary/bsdiff"
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_ENCODING).unwrap(),
        format!("bspatch-from-{}", old_sha1).as_str()
    );

    // The patch reconstructs the new body from the old one
    let patch = body_bytes(resp).await;
    let mut restored = Vec::new();
    bsdiff::patch(&old_body, &mut patch.as_slice(), &mut restored).unwrap();
    assert_eq!(restored, new_body);

    // The cache entry landed in the patchstash and is reused
    let cached = std::path::Path::new(&core.config.patchstash)
        .join(format!("{}-{}", old_sha1, new_sha1));
    assert!(cached.is_file());

    let resp = artifacts::serve_artifact(State(core), UrlPath(new_sha1), headers).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, patch);
}

#[tokio::test]
async fn patch_request_from_unknown_base_falls_back_to_full_body() {
    let tmp = tempfile::tempdir().unwrap();
    write_project_cfg(tmp.path(), "acme", "widget", &json!({}));
    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();

    let body = b"full body fallback".to_vec();
    let sha1 = file_artifact(&core, "app.bin", &body, None).await;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT_ENCODING,
        format!("bspatch-from-{}", "9".repeat(40)).parse().unwrap(),
    );

    let resp = artifacts::serve_artifact(State(core), UrlPath(sha1), headers).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, body);
}
