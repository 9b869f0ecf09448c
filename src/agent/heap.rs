//! Project heap managers
//!
//! A heap is an isolated scratch area per project. On btrfs each heap is a
//! subvolume so it can be snapshotted and discarded cheaply; everywhere
//! else a plain directory does the job.

use crate::error::DoozerError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub trait HeapMgr: Send + Sync {
    /// Resolve (and optionally create) the heap for a project id.
    fn open_heap(&self, id: &str, create: bool) -> Result<PathBuf, DoozerError>;
    fn delete_heap(&self, name: &str) -> Result<(), DoozerError>;
}

pub struct SimpleHeap {
    root: PathBuf,
}

impl SimpleHeap {
    pub fn new(root: &Path) -> Result<Self, DoozerError> {
        std::fs::create_dir_all(root).map_err(|e| {
            DoozerError::Io(format!("Unable to create {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

impl HeapMgr for SimpleHeap {
    fn open_heap(&self, id: &str, create: bool) -> Result<PathBuf, DoozerError> {
        let path = self.root.join(id);
        if path.is_dir() {
            return Ok(path);
        }
        if !create {
            return Err(DoozerError::Io(format!(
                "{} does not exist",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path).map_err(|e| {
            DoozerError::Io(format!(
                "Unable to create directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(path)
    }

    fn delete_heap(&self, _name: &str) -> Result<(), DoozerError> {
        Ok(())
    }
}

pub struct BtrfsHeap {
    root: PathBuf,
}

impl BtrfsHeap {
    /// Probe whether `root` lives on a btrfs filesystem with a usable
    /// `btrfs` tool. The subvolume ioctls themselves are the tool's problem.
    pub fn detect(root: &Path) -> Option<Self> {
        if std::fs::create_dir_all(root).is_err() {
            return None;
        }
        let ok = Command::new("btrfs")
            .args(["filesystem", "df"])
            .arg(root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !ok {
            warn!("{} is not on a btrfs filesystem", root.display());
            return None;
        }
        Some(Self {
            root: root.to_path_buf(),
        })
    }
}

impl HeapMgr for BtrfsHeap {
    fn open_heap(&self, id: &str, create: bool) -> Result<PathBuf, DoozerError> {
        let path = self.root.join(id);
        if path.is_dir() {
            return Ok(path);
        }
        if !create {
            return Err(DoozerError::Io(format!(
                "{} does not exist",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DoozerError::Io(format!(
                    "Unable to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let out = Command::new("btrfs")
            .args(["subvolume", "create"])
            .arg(&path)
            .output()
            .map_err(|e| DoozerError::Io(format!("Unable to run btrfs: {}", e)))?;

        if !out.status.success() {
            return Err(DoozerError::Io(format!(
                "Unable to create btrfs subvolume {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(path)
    }

    fn delete_heap(&self, name: &str) -> Result<(), DoozerError> {
        let path = self.root.join(name);
        let out = Command::new("btrfs")
            .args(["subvolume", "delete"])
            .arg(&path)
            .output()
            .map_err(|e| DoozerError::Io(format!("Unable to run btrfs: {}", e)))?;

        if !out.status.success() {
            return Err(DoozerError::Io(format!(
                "Unable to delete btrfs subvolume {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Btrfs when available, plain directories otherwise.
pub fn create_heap_mgr(root: &Path) -> Result<Box<dyn HeapMgr>, DoozerError> {
    if let Some(h) = BtrfsHeap::detect(root) {
        info!("Using btrfs heaps at {}", root.display());
        return Ok(Box::new(h));
    }
    info!("Using plain directory heaps at {}", root.display());
    Ok(Box::new(SimpleHeap::new(root)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_heap_creates_and_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let heap = SimpleHeap::new(tmp.path()).unwrap();

        let p = heap.open_heap("acme/widget", true).unwrap();
        assert!(p.is_dir());
        assert_eq!(p, tmp.path().join("acme/widget"));

        // Second open finds the existing heap
        assert_eq!(heap.open_heap("acme/widget", false).unwrap(), p);
    }

    #[test]
    fn simple_heap_refuses_missing_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let heap = SimpleHeap::new(tmp.path()).unwrap();
        assert!(heap.open_heap("acme/other", false).is_err());
    }
}
