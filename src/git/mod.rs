//! Git adapter for the buildmaster
//!
//! Wraps libgit2 for mirror syncing, ref listing, version derivation and
//! blob lookup. libgit2 is not safe for concurrent access to one repository,
//! so every operation takes the project's repo lock and runs the actual work
//! on a blocking thread.

use crate::core::Core;
use crate::error::DoozerError;
use crate::project::{
    Project, JOB_CHECK_FOR_BUILDS, JOB_GENERATE_RELEASES, JOB_NOTIFY_REPO_UPDATE,
};
use git2::{
    AutotagOption, Cred, CredentialType, FetchOptions, Oid, RemoteCallbacks, Repository, Sort,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// A branch or tag tip.
#[derive(Debug, Clone)]
pub struct GitRef {
    pub name: String,
    pub oid: Oid,
}

impl GitRef {
    pub fn hex(&self) -> String {
        self.oid.to_string()
    }
}

/// One changelog entry derived from the commit DAG.
#[derive(Debug, Clone)]
pub struct Change {
    pub oid: Oid,
    pub tag: Option<String>,
    pub msg: Option<String>,
    pub version: String,
}

fn open_or_init_bare(path: &Path) -> Result<Repository, DoozerError> {
    match Repository::open_bare(path) {
        Ok(repo) => Ok(repo),
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            info!("Creating new repository at {}", path.display());
            Repository::init_bare(path).map_err(|e| DoozerError::Transient(e.message().into()))
        }
        Err(e) => Err(DoozerError::Transient(e.message().to_string())),
    }
}

/// Credential resolution order: configured plaintext password, then the
/// default ssh keys in $HOME, then configured key paths.
fn acquire_credentials(
    cfg: &crate::project::ProjectConfig,
    username_from_url: Option<&str>,
    allowed: CredentialType,
) -> Result<Cred, git2::Error> {
    let username = cfg
        .gitrepo
        .username
        .as_deref()
        .or(username_from_url)
        .unwrap_or("git");

    if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
        if let Some(password) = &cfg.gitrepo.password {
            return Cred::userpass_plaintext(username, password);
        }
    }

    if allowed.contains(CredentialType::SSH_KEY) {
        let mut pub_path: Option<PathBuf> = None;
        let mut priv_path: Option<PathBuf> = None;

        if let Ok(home) = std::env::var("HOME") {
            for key in ["id_rsa", "id_dsa"] {
                let pubk = Path::new(&home).join(".ssh").join(format!("{}.pub", key));
                let privk = Path::new(&home).join(".ssh").join(key);
                if pubk.is_file() && privk.is_file() {
                    pub_path = Some(pubk);
                    priv_path = Some(privk);
                    break;
                }
            }
        }

        if let Some(p) = &cfg.gitrepo.ssh.pub_path {
            pub_path = Some(PathBuf::from(p));
        }
        if let Some(p) = &cfg.gitrepo.ssh.priv_path {
            priv_path = Some(PathBuf::from(p));
        }

        if let (Some(pubk), Some(privk)) = (pub_path, priv_path) {
            return Cred::ssh_key(
                username,
                Some(&pubk),
                &privk,
                cfg.gitrepo.ssh.password.as_deref(),
            );
        }
    }

    Err(git2::Error::from_str("No available authentication methods"))
}

/// Fetch the project mirror from its configured upstream. New or updated
/// refs schedule a build check, release regeneration and update webhooks.
pub async fn repo_sync(core: &Arc<Core>, p: &Arc<Project>) -> Result<(), DoozerError> {
    let cfg = core
        .registry
        .get_cfg(&p.id)
        .ok_or_else(|| DoozerError::Config("No project config".to_string()))?;

    let upstream = cfg
        .gitrepo
        .upstream
        .clone()
        .ok_or_else(|| DoozerError::Config("No GIT upstream configured".to_string()))?;
    let refspec = cfg
        .gitrepo
        .refspec
        .clone()
        .unwrap_or_else(|| "+refs/*:refs/*".to_string());
    let path = core.repo_path(&p.id);
    let project = p.id.clone();

    info!("{}: Syncing repo from {}", project, upstream);

    let _guard = p.repo_lock.lock().await;

    let updates: Vec<(String, Oid, Oid)> = tokio::task::spawn_blocking(move || {
        let repo = open_or_init_bare(&path)?;

        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_cb = updates.clone();

        let mut callbacks = RemoteCallbacks::new();
        callbacks.update_tips(move |refname, a, b| {
            updates_cb
                .lock()
                .unwrap()
                .push((refname.to_string(), a, b));
            true
        });
        callbacks.credentials(move |_url, username_from_url, allowed| {
            acquire_credentials(&cfg, username_from_url, allowed)
        });

        let mut remote = repo
            .remote_anonymous(&upstream)
            .map_err(|e| DoozerError::Transient(e.message().into()))?;

        let mut opts = FetchOptions::new();
        opts.remote_callbacks(callbacks);
        opts.download_tags(AutotagOption::Auto);

        remote
            .fetch(&[refspec.as_str()], Some(&mut opts), None)
            .map_err(|e| DoozerError::Transient(e.message().into()))?;

        let updates = updates.lock().unwrap().clone();
        Ok::<_, DoozerError>(updates)
    })
    .await
    .map_err(|e| DoozerError::Transient(e.to_string()))??;

    for (refname, a, b) in &updates {
        if a.is_zero() {
            info!("{}: GIT: [new]     {:.20} {}", p.id, b.to_string(), refname);
        } else {
            info!(
                "{}: GIT: [updated] {:.10}..{:.10} {}",
                p.id,
                a.to_string(),
                b.to_string(),
                refname
            );
        }
    }

    if !updates.is_empty() {
        core.registry.schedule_job(
            p,
            JOB_CHECK_FOR_BUILDS | JOB_NOTIFY_REPO_UPDATE | JOB_GENERATE_RELEASES,
        );
    }

    info!("{}: Synced repo", p.id);
    Ok(())
}

/// Branches under `refs/heads/*`, sorted descending by dictionary order so
/// numeric version suffixes rank correctly (4.3 before 4.1).
pub fn branches_of(repo: &Repository) -> Result<Vec<GitRef>, DoozerError> {
    let mut out = Vec::new();
    for r in repo.references_glob("refs/heads/*")? {
        let r = r?;
        let (Some(name), Some(oid)) = (r.name(), r.target()) else {
            continue;
        };
        out.push(GitRef {
            name: name.trim_start_matches("refs/heads/").to_string(),
            oid,
        });
    }
    out.sort_by(|a, b| natord::compare(&b.name, &a.name));
    Ok(out)
}

/// All tags with annotated tags peeled to their target commit.
pub fn tags_of(repo: &Repository) -> Result<Vec<GitRef>, DoozerError> {
    let mut raw = Vec::new();
    repo.tag_foreach(|oid, name| {
        raw.push((oid, String::from_utf8_lossy(name).to_string()));
        true
    })?;

    let mut out = Vec::new();
    for (oid, name) in raw {
        let target = match repo.find_tag(oid) {
            Ok(tag) => tag.target_id(),
            Err(_) => oid,
        };
        out.push(GitRef {
            name: name.trim_start_matches("refs/tags/").to_string(),
            oid: target,
        });
    }
    Ok(out)
}

fn tag_map(repo: &Repository) -> Result<HashMap<Oid, String>, DoozerError> {
    Ok(tags_of(repo)?
        .into_iter()
        .map(|r| (r.oid, r.name))
        .collect())
}

fn version_string(tag: Option<&str>, distance: usize, oid: Option<&Oid>) -> String {
    let tag = tag.unwrap_or("0.0");
    if distance == 0 {
        return tag.to_string();
    }
    match oid {
        Some(oid) => format!("{}.{}-g{:.8}", tag, distance, oid.to_string()),
        None => format!("{}.{}", tag, distance),
    }
}

/// Derive a version string for a revision: nearest tag reachable through a
/// topological walk plus the distance to it, optionally suffixed with the
/// short commit hash.
pub fn describe_repo(
    repo: &Repository,
    revision: &str,
    with_hash: bool,
) -> Result<String, DoozerError> {
    let start = Oid::from_str(revision)
        .map_err(|_| DoozerError::BadRequest(format!("Invalid revision {}", revision)))?;

    let tags = tag_map(repo)?;

    let mut walk = repo.revwalk()?;
    walk.push(start)?;
    walk.set_sorting(Sort::TOPOLOGICAL)?;

    let mut distance = 0usize;
    let mut found: Option<&str> = None;
    let mut visited = false;
    for oid in walk {
        let oid = oid?;
        visited = true;
        if let Some(tag) = tags.get(&oid) {
            found = Some(tag.as_str());
            break;
        }
        distance += 1;
    }

    if !visited {
        return Err(DoozerError::Git(format!("Revision {} not found", revision)));
    }

    Ok(version_string(
        found,
        distance,
        if with_hash { Some(&start) } else { None },
    ))
}

/// Walk the DAG from `start` collecting changelog notes.
///
/// Notes are read from `refs/notes/changelog` and, when `target` is given,
/// `refs/notes/changelog-<target>`; when both exist the generic note comes
/// first. `count` limits visited commits when `all` is set, otherwise only
/// commits carrying a note; `offset` skips that many counted entries. Each
/// entry gets a version derived by locating the nearest preceding tag and
/// marching forward.
pub fn changelog_of(
    repo: &Repository,
    start: Oid,
    offset: usize,
    count: usize,
    all: bool,
    target: Option<&str>,
) -> Result<Vec<Change>, DoozerError> {
    let mut changes: Vec<Change> = Vec::new();
    if count == 0 {
        return Ok(changes);
    }

    let target_ref = target.map(|t| format!("refs/notes/changelog-{}", t));
    let tags = tag_map(repo)?;

    let mut walk = repo.revwalk()?;
    walk.push(start)?;
    walk.set_sorting(Sort::TOPOLOGICAL)?;

    let mut remaining = count;
    let mut to_skip = offset;

    loop {
        let Some(oid) = walk.next() else {
            break;
        };
        let oid = oid?;

        let mut msg: Option<String> = None;
        if let Some(target_ref) = &target_ref {
            if let Ok(note) = repo.find_note(Some(target_ref), oid) {
                msg = note.message().map(|m| m.to_string());
            }
        }
        if let Ok(note) = repo.find_note(Some("refs/notes/changelog"), oid) {
            if let Some(generic) = note.message() {
                msg = Some(match msg {
                    Some(target_msg) => format!("{}\n{}", generic, target_msg),
                    None => generic.to_string(),
                });
            }
        }

        let counted = all || msg.is_some();

        changes.push(Change {
            oid,
            tag: tags.get(&oid).cloned(),
            msg,
            version: String::new(),
        });

        if counted {
            if to_skip > 0 {
                to_skip -= 1;
                changes.pop();
                continue;
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }

    if let Some(last_tag) = changes.last().map(|c| c.tag.clone()) {
        // Distance from the oldest collected commit back to its nearest tag
        let mut distance = 0usize;
        let mut tag: Option<String> = last_tag;
        if tag.is_none() {
            for oid in walk {
                let oid = oid?;
                distance += 1;
                if let Some(t) = tags.get(&oid) {
                    tag = Some(t.clone());
                    break;
                }
            }
        }

        for c in changes.iter_mut().rev() {
            if let Some(t) = &c.tag {
                tag = Some(t.clone());
                distance = 0;
            }
            c.version = version_string(tag.as_deref(), distance, None);
            distance += 1;
        }

        if !all {
            changes.retain(|c| c.msg.is_some());
        }
    }

    Ok(changes)
}

/// Bytes of a blob at `path` (slash-separated) in the tree of a commit.
pub fn file_at(repo: &Repository, oid: Oid, path: &str) -> Result<Vec<u8>, DoozerError> {
    let commit = repo
        .find_commit(oid)
        .map_err(|e| DoozerError::Git(format!("Unable to lookup commit: {}", e.message())))?;
    let mut tree = commit.tree()?;

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let Some((leaf, dirs)) = components.split_last() else {
        return Err(DoozerError::BadRequest("Empty path".to_string()));
    };

    for dir in dirs {
        let obj = {
            let entry = tree
                .get_name(dir)
                .ok_or_else(|| DoozerError::Git(format!("'{}' directory not found", dir)))?;
            entry.to_object(repo)?
        };
        tree = obj
            .into_tree()
            .map_err(|_| DoozerError::Git(format!("'{}' is not a tree object", dir)))?;
    }

    let entry = tree
        .get_name(leaf)
        .ok_or_else(|| DoozerError::Git(format!("'{}' not found", leaf)))?;
    let obj = entry.to_object(repo)?;
    let blob = obj
        .into_blob()
        .map_err(|_| DoozerError::Git(format!("'{}' is not a file", leaf)))?;

    Ok(blob.content().to_vec())
}

/// Run a closure against a project's mirror under its repo lock.
pub async fn with_repo<T, F>(core: &Core, p: &Project, f: F) -> Result<T, DoozerError>
where
    T: Send + 'static,
    F: FnOnce(&Repository) -> Result<T, DoozerError> + Send + 'static,
{
    let path = core.repo_path(&p.id);
    let _guard = p.repo_lock.lock().await;
    tokio::task::spawn_blocking(move || {
        let repo = open_or_init_bare(&path)?;
        f(&repo)
    })
    .await
    .map_err(|e| DoozerError::Transient(e.to_string()))?
}

pub async fn list_branches(core: &Core, p: &Project) -> Result<Vec<GitRef>, DoozerError> {
    with_repo(core, p, |repo| branches_of(repo)).await
}

pub async fn describe(
    core: &Core,
    p: &Project,
    revision: &str,
    with_hash: bool,
) -> Result<String, DoozerError> {
    let revision = revision.to_string();
    with_repo(core, p, move |repo| {
        describe_repo(repo, &revision, with_hash)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::path::Path;

    fn commit(repo: &Repository, msg: &str) -> Oid {
        let sig = Signature::now("test", "test@example.com").unwrap();
        let tree_oid = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_oid).unwrap();
        let parents: Vec<git2::Commit> = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap()
    }

    fn test_repo(path: &Path) -> Repository {
        Repository::init(path).unwrap()
    }

    #[test]
    fn describe_counts_topological_distance() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());

        let c1 = commit(&repo, "one");
        repo.tag_lightweight("1.0", &repo.find_object(c1, None).unwrap(), false)
            .unwrap();
        let c2 = commit(&repo, "two");
        let c3 = commit(&repo, "three");

        assert_eq!(describe_repo(&repo, &c1.to_string(), false).unwrap(), "1.0");
        assert_eq!(
            describe_repo(&repo, &c2.to_string(), false).unwrap(),
            "1.0.1"
        );
        assert_eq!(
            describe_repo(&repo, &c3.to_string(), false).unwrap(),
            "1.0.2"
        );

        let with_hash = describe_repo(&repo, &c3.to_string(), true).unwrap();
        assert_eq!(
            with_hash,
            format!("1.0.2-g{}", &c3.to_string()[..8])
        );
    }

    #[test]
    fn describe_without_tags_uses_zero_base() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());

        commit(&repo, "one");
        let c2 = commit(&repo, "two");

        assert_eq!(
            describe_repo(&repo, &c2.to_string(), false).unwrap(),
            "0.0.2"
        );
    }

    #[test]
    fn describe_rejects_garbage_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());
        commit(&repo, "one");
        assert!(matches!(
            describe_repo(&repo, "not-a-sha", false),
            Err(DoozerError::BadRequest(_))
        ));
    }

    #[test]
    fn branches_sorted_descending_dictionary_order() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());

        let c1 = commit(&repo, "one");
        let commit_obj = repo.find_commit(c1).unwrap();
        repo.branch("release-4.2", &commit_obj, false).unwrap();
        repo.branch("release-4.10", &commit_obj, false).unwrap();

        let names: Vec<String> = branches_of(&repo)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        // 4.10 ranks above 4.2 under dictionary comparison
        let p42 = names.iter().position(|n| n == "release-4.2").unwrap();
        let p410 = names.iter().position(|n| n == "release-4.10").unwrap();
        assert!(p410 < p42);
    }

    #[test]
    fn changelog_reads_notes_and_versions() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());
        let sig = Signature::now("test", "test@example.com").unwrap();

        let c1 = commit(&repo, "one");
        repo.tag_lightweight("2.0", &repo.find_object(c1, None).unwrap(), false)
            .unwrap();
        let c2 = commit(&repo, "two");
        let c3 = commit(&repo, "three");

        repo.note(&sig, &sig, Some("refs/notes/changelog"), c2, "Fixed a bug", false)
            .unwrap();
        repo.note(
            &sig,
            &sig,
            Some("refs/notes/changelog-linux"),
            c2,
            "Linux only fix",
            false,
        )
        .unwrap();

        let changes = changelog_of(&repo, c3, 0, 100, false, Some("linux")).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].oid, c2);
        assert_eq!(changes[0].version, "2.0.1");
        assert_eq!(
            changes[0].msg.as_deref(),
            Some("Fixed a bug\nLinux only fix")
        );

        // all=true keeps untagged commits and versions every entry
        let all = changelog_of(&repo, c3, 0, 100, true, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].version, "2.0.2");
        assert_eq!(all[1].version, "2.0.1");
        assert_eq!(all[2].version, "2.0");
    }

    #[test]
    fn file_at_walks_tree_components() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path());

        std::fs::create_dir_all(tmp.path().join("Manifests")).unwrap();
        std::fs::write(tmp.path().join("Manifests/linux.json"), b"{\"a\":1}").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("Manifests/linux.json")).unwrap();
        index.write().unwrap();
        let c = commit(&repo, "add manifest");

        let bytes = file_at(&repo, c, "Manifests/linux.json").unwrap();
        assert_eq!(bytes, b"{\"a\":1}");

        assert!(file_at(&repo, c, "Manifests/missing.json").is_err());
        assert!(file_at(&repo, c, "Manifests/linux.json/x").is_err());
    }
}
