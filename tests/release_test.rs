//! Release maker: latest-done-build discovery and manifest generation

mod common;

use common::{bare_commit, test_core, write_project_cfg};
use doozer::database::models::{BuildStatus, Storage};
use doozer::database::queries::Queries;
use doozer::releasemaker;
use git2::Repository;
use serde_json::json;

#[tokio::test]
async fn manifests_regenerate_only_on_change() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest_dir = tmp.path().join("manifests");

    // Mirror with two commits; the done build sits one commit below the tip
    let repo_path = tmp.path().join("repos/acme/widget");
    std::fs::create_dir_all(repo_path.parent().unwrap()).unwrap();
    let repo = Repository::init_bare(&repo_path).unwrap();
    let c1 = bare_commit(&repo, "one", &[("README", "hello\n")], None);
    let _c2 = bare_commit(&repo, "two", &[("README", "hello world\n")], Some(c1));

    write_project_cfg(
        tmp.path(),
        "acme",
        "widget",
        &json!({
            "releaseTracks": {
                "manifestDir": manifest_dir.to_string_lossy(),
                "artifactPrefix": "https://dl.example.com",
                "tracks": [{
                    "name": "stable",
                    "title": "Stable",
                    "branch": "master",
                    "description": "Stable releases"
                }],
                "targets": [{
                    "target": "linux-x64",
                    "title": "Linux",
                    "artifacts": [{"type": "app", "title": "Application"}]
                }]
            }
        }),
    );

    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();
    let p = core.registry.get("acme/widget").unwrap();

    // Done build at c1 with one artifact
    Queries::insert_build(
        core.db.pool(),
        "acme/widget",
        &c1.to_string(),
        "linux-x64",
        "Automatic build",
        "1.0.4",
        false,
    )
    .await
    .unwrap();
    let job = Queries::claim_build(core.db.pool(), &["linux-x64".to_string()], "agent1")
        .await
        .unwrap();
    Queries::insert_artifact(
        core.db.pool(),
        job.id,
        "app",
        b"1/myapp-1.0.4",
        Storage::File,
        "myapp-1.0.4",
        4096,
        &"0".repeat(32),
        &"a".repeat(40),
        Some("application/octet-stream"),
        None,
        0,
    )
    .await
    .unwrap();
    Queries::finish_build(core.db.pool(), BuildStatus::Done, None, job.id)
        .await
        .unwrap();

    releasemaker::update_project(&core, &p).await.unwrap();

    // Per-target manifest
    let single: serde_json::Value = serde_json::from_slice(
        &std::fs::read(manifest_dir.join("stable-linux-x64.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(single["arch"], "linux-x64");
    assert_eq!(single["version"], "1.0.4");
    assert_eq!(single["branch"], "master");
    assert_eq!(single["title"], "Linux");
    assert_eq!(single["artifacts"][0]["name"], "myapp-1.0.4");
    assert_eq!(
        single["artifacts"][0]["url"],
        format!("https://dl.example.com/file/{}", "a".repeat(40))
    );

    // Aggregate: the track has a description and the artifact a title
    let all: serde_json::Value =
        serde_json::from_slice(&std::fs::read(manifest_dir.join("all.json")).unwrap()).unwrap();
    assert_eq!(all[0]["id"], "stable");
    assert_eq!(all[0]["description"], "Stable releases");
    assert_eq!(all[0]["targets"][0]["artifacts"][0]["title"], "Application");

    // An unchanged regeneration rewrites nothing
    let mtime = |p: &std::path::Path| std::fs::metadata(p).unwrap().modified().unwrap();
    let before = (
        mtime(&manifest_dir.join("stable-linux-x64.json")),
        mtime(&manifest_dir.join("all.json")),
    );
    releasemaker::update_project(&core, &p).await.unwrap();
    let after = (
        mtime(&manifest_dir.join("stable-linux-x64.json")),
        mtime(&manifest_dir.join("all.json")),
    );
    assert_eq!(before, after);
}

#[tokio::test]
async fn untitled_artifacts_stay_out_of_the_aggregate() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest_dir = tmp.path().join("manifests");

    let repo_path = tmp.path().join("repos/acme/widget");
    std::fs::create_dir_all(repo_path.parent().unwrap()).unwrap();
    let repo = Repository::init_bare(&repo_path).unwrap();
    let c1 = bare_commit(&repo, "one", &[("README", "x\n")], None);

    write_project_cfg(
        tmp.path(),
        "acme",
        "widget",
        &json!({
            "releaseTracks": {
                "manifestDir": manifest_dir.to_string_lossy(),
                "artifactPrefix": "https://dl.example.com",
                "tracks": [{
                    "name": "nightly",
                    "title": "Nightly",
                    "branch": "master",
                    "description": "Nightly builds"
                }],
                "targets": [{
                    "target": "linux-x64",
                    // No title on the artifact: per-target manifest only
                    "artifacts": [{"type": "debug"}]
                }]
            }
        }),
    );

    let core = test_core(tmp.path(), json!({})).await;
    core.registry.reload().unwrap();
    let p = core.registry.get("acme/widget").unwrap();

    Queries::insert_build(
        core.db.pool(),
        "acme/widget",
        &c1.to_string(),
        "linux-x64",
        "Automatic build",
        "0.5",
        false,
    )
    .await
    .unwrap();
    let job = Queries::claim_build(core.db.pool(), &["linux-x64".to_string()], "agent1")
        .await
        .unwrap();
    Queries::insert_artifact(
        core.db.pool(),
        job.id,
        "debug",
        b"1/debuginfo",
        Storage::File,
        "debuginfo",
        512,
        &"0".repeat(32),
        &"b".repeat(40),
        None,
        None,
        0,
    )
    .await
    .unwrap();
    Queries::finish_build(core.db.pool(), BuildStatus::Done, None, job.id)
        .await
        .unwrap();

    releasemaker::update_project(&core, &p).await.unwrap();

    let single: serde_json::Value = serde_json::from_slice(
        &std::fs::read(manifest_dir.join("nightly-linux-x64.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(single["artifacts"][0]["name"], "debuginfo");

    // The target contributed nothing visible, so the track is empty
    let all: serde_json::Value =
        serde_json::from_slice(&std::fs::read(manifest_dir.join("all.json")).unwrap()).unwrap();
    assert_eq!(all[0]["id"], "nightly");
    assert_eq!(all[0]["targets"].as_array().unwrap().len(), 0);
}
