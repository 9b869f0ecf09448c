//! Shared fixtures for integration tests
#![allow(dead_code)]

use doozer::config::AppConfig;
use doozer::core::Core;
use doozer::database::Database;
use git2::{Oid, Repository, Signature};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Build a Core around an in-memory store with all paths rooted in `root`.
/// `app` overrides individual AppConfig fields.
pub async fn test_core(root: &Path, app: serde_json::Value) -> Arc<Core> {
    let mut app = app;
    let obj = app.as_object_mut().expect("object config");

    let defaults = [
        ("database_url", json!("sqlite::memory:")),
        (
            "project_config_dir",
            json!(root.join("projects").to_string_lossy()),
        ),
        ("repos", json!(root.join("repos").to_string_lossy())),
        (
            "artifact_path",
            json!(root.join("artifacts").to_string_lossy()),
        ),
        ("patchstash", json!(root.join("patchstash").to_string_lossy())),
        ("ctrl_socket", json!(root.join("ctl.sock").to_string_lossy())),
    ];
    for (key, value) in defaults {
        obj.entry(key).or_insert(value);
    }

    let config: AppConfig = serde_json::from_value(app).unwrap();
    let db = Database::new_in_memory().await.unwrap();
    Arc::new(Core::new(config, db))
}

pub fn write_project_cfg(root: &Path, org: &str, name: &str, body: &serde_json::Value) {
    let dir = root.join("projects").join(org);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{}.json", name)),
        serde_json::to_string_pretty(body).unwrap(),
    )
    .unwrap();
}

/// Commit a tree directly into a bare repository on refs/heads/master.
pub fn bare_commit(
    repo: &Repository,
    msg: &str,
    files: &[(&str, &str)],
    parent: Option<Oid>,
) -> Oid {
    let sig = Signature::now("test", "test@example.com").unwrap();

    let base_tree = parent.map(|p| repo.find_commit(p).unwrap().tree().unwrap());
    let mut tb = repo.treebuilder(base_tree.as_ref()).unwrap();
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        tb.insert(*name, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(tb.write().unwrap()).unwrap();

    let parents: Vec<git2::Commit> = parent
        .map(|p| repo.find_commit(p).unwrap())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

    repo.commit(
        Some("refs/heads/master"),
        &sig,
        &sig,
        msg,
        &tree,
        &parent_refs,
    )
    .unwrap()
}

/// Bare mirror with one commit tagged `tag`.
pub fn seed_mirror(path: &Path, tag: &str) -> (Repository, Oid) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let repo = Repository::init_bare(path).unwrap();
    let oid = bare_commit(&repo, "initial", &[("README", "hello\n")], None);
    repo.tag_lightweight(tag, &repo.find_object(oid, None).unwrap(), false)
        .unwrap();
    (repo, oid)
}
