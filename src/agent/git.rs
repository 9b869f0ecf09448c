//! Working-tree checkout for claimed jobs
//!
//! Checkout is tried against the local clone first; a missing object falls
//! back to a full fetch from the job's repo URL and a second attempt.

use crate::error::DoozerError;
use git2::build::CheckoutBuilder;
use git2::{AutotagOption, FetchOptions, Oid, Repository};
use std::path::Path;
use tracing::info;

fn open_or_init(path: &Path) -> Result<Repository, DoozerError> {
    match Repository::open(path) {
        Ok(repo) => Ok(repo),
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            info!("Creating new GIT repo at {}", path.display());
            Repository::init(path)
                .map_err(|e| DoozerError::BuildFailed(format!("Unable to create GIT repo: {}", e)))
        }
        Err(e) => Err(DoozerError::BuildFailed(format!(
            "Unable to open GIT repo: {}",
            e
        ))),
    }
}

fn repo_fetch(repo: &Repository, url: &str) -> Result<(), DoozerError> {
    let mut remote = repo.remote_anonymous(url).map_err(|e| {
        DoozerError::BuildTempFailed(format!("GIT: Unable to create remote: {}", e.message()))
    })?;

    let mut opts = FetchOptions::new();
    opts.download_tags(AutotagOption::Auto);

    remote
        .fetch(&["+refs/*:refs/*"], Some(&mut opts), None)
        .map_err(|e| {
            DoozerError::BuildTempFailed(format!(
                "GIT: Unable to fetch from {}: {}",
                url,
                e.message()
            ))
        })?;

    Ok(())
}

fn repo_checkout(repo: &Repository, oid: Oid) -> Result<(), git2::Error> {
    let obj = repo.find_object(oid, Some(git2::ObjectType::Commit))?;

    let mut opts = CheckoutBuilder::new();
    opts.force().remove_untracked(true).remove_ignored(true);

    repo.checkout_tree(&obj, Some(&mut opts))
}

/// Materialise `revision` from `repourl` in the working tree at `repodir`.
pub fn checkout_repo(repodir: &Path, repourl: &str, revision: &str) -> Result<(), DoozerError> {
    let oid = Oid::from_str(revision)
        .map_err(|e| DoozerError::BuildFailed(format!("GIT: Commit {} is invalid: {}", revision, e)))?;

    let repo = open_or_init(repodir)?;

    // Checkout without a fetch first, it is faster when the object is
    // already present
    if repo_checkout(&repo, oid).is_err() {
        repo_fetch(&repo, repourl)?;

        repo_checkout(&repo, oid).map_err(|e| {
            DoozerError::BuildTempFailed(format!(
                "GIT: Failed to checkout {}: {}",
                revision,
                e.message()
            ))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn seed_repo(path: &Path) -> (Repository, Oid) {
        let repo = Repository::init(path).unwrap();
        std::fs::write(path.join("hello.txt"), "hello\n").unwrap();
        let sig = Signature::now("t", "t@example.com").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("hello.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        drop(tree);
        (repo, oid)
    }

    #[test]
    fn checkout_fetches_missing_objects_from_upstream() {
        let upstream_dir = tempfile::tempdir().unwrap();
        let (_upstream, oid) = seed_repo(upstream_dir.path());

        let work = tempfile::tempdir().unwrap();
        let url = format!("file://{}", upstream_dir.path().display());

        checkout_repo(work.path(), &url, &oid.to_string()).unwrap();
        let content = std::fs::read_to_string(work.path().join("hello.txt")).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn bogus_revision_is_a_permanent_failure() {
        let work = tempfile::tempdir().unwrap();
        let r = checkout_repo(work.path(), "file:///nowhere", "zzzz");
        assert!(matches!(r, Err(DoozerError::BuildFailed(_))));
    }

    #[test]
    fn unreachable_upstream_is_a_temporary_failure() {
        let work = tempfile::tempdir().unwrap();
        let oid = "0123456789012345678901234567890123456789";
        let r = checkout_repo(work.path(), "file:///nowhere", oid);
        assert!(matches!(r, Err(DoozerError::BuildTempFailed(_))));
    }
}
