use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use crate::config::ConflictMode;
use crate::errors::{CloneError, Result};

/// What the pre-clone inspection decided for a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing in the way; clone into a fresh path.
    Proceed,
    /// A conflicting directory was renamed aside first.
    ProceedRelocated(PathBuf),
    /// The target already holds a clone of the same remote.
    ExistingSameRemote,
}

/// Guards check-then-act sequences on overlapping path prefixes. Two workers
/// handling `a/b` and `a/b/c` must not inspect and mutate the shared prefix
/// concurrently. Never held across the clone operation itself.
pub struct PathLocks {
    held: Mutex<HashSet<PathBuf>>,
    notify: Notify,
}

impl PathLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(PathLocks {
            held: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        })
    }

    pub async fn acquire(self: &Arc<Self>, path: &Path) -> PathGuard {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before inspecting the held set;
            // notify_waiters stores no permit, so a guard released between
            // the check and the first poll would otherwise be missed.
            notified.as_mut().enable();
            {
                let mut held = self.held.lock().unwrap();
                let overlaps = held
                    .iter()
                    .any(|h| h.starts_with(path) || path.starts_with(h));
                if !overlaps {
                    held.insert(path.to_path_buf());
                    return PathGuard {
                        locks: Arc::clone(self),
                        path: path.to_path_buf(),
                    };
                }
            }
            notified.await;
        }
    }
}

pub struct PathGuard {
    locks: Arc<PathLocks>,
    path: PathBuf,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.path);
        self.locks.notify.notify_waiters();
    }
}

pub struct ConflictResolver {
    mode: ConflictMode,
    output_root: PathBuf,
    locks: Arc<PathLocks>,
}

impl ConflictResolver {
    pub fn new(mode: ConflictMode, output_root: PathBuf) -> Self {
        ConflictResolver {
            mode,
            output_root,
            locks: PathLocks::new(),
        }
    }

    /// Inspect `target` before cloning `expected_url` into it. Runs the whole
    /// check-and-relocate sequence under the per-prefix lock; the caller
    /// clones after this returns, without the lock.
    pub async fn check(&self, target: &Path, expected_url: &str) -> Result<Resolution> {
        let _guard = self.locks.acquire(target).await;
        self.check_locked(target, expected_url)
    }

    fn check_locked(&self, target: &Path, expected_url: &str) -> Result<Resolution> {
        if let Some(existing_url) = repo_remote_url(target) {
            if same_remote(&existing_url, expected_url) {
                return Ok(Resolution::ExistingSameRemote);
            }
            return self.handle_conflict(
                target,
                target,
                format!("existing clone of different remote {}", existing_url),
            );
        }

        if self.mode == ConflictMode::Allow {
            return Ok(Resolution::Proceed);
        }

        // An ancestor repo inside the output root would shadow the target.
        if let Some(ancestor) = self.conflicting_ancestor(target) {
            return self.handle_ancestor_conflict(target, &ancestor);
        }

        // Repos nested beneath the target would be shadowed by it.
        if target.is_dir() {
            if let Some(nested) = find_nested_repo(target) {
                return self.handle_conflict(
                    target,
                    target,
                    format!("nested repository at {}", nested.display()),
                );
            }
        }

        Ok(Resolution::Proceed)
    }

    fn conflicting_ancestor(&self, target: &Path) -> Option<PathBuf> {
        let mut dir = target.parent();
        while let Some(d) = dir {
            if !d.starts_with(&self.output_root) || d == self.output_root {
                break;
            }
            if is_repo_dir(d) {
                return Some(d.to_path_buf());
            }
            dir = d.parent();
        }
        None
    }

    fn handle_conflict(
        &self,
        target: &Path,
        conflicting: &Path,
        message: String,
    ) -> Result<Resolution> {
        match self.mode {
            ConflictMode::Allow => Ok(Resolution::Proceed),
            ConflictMode::Protect => Err(CloneError::Conflict {
                path: target.to_path_buf(),
                message,
            }),
            ConflictMode::Move => {
                let backup = relocate(conflicting)?;
                log::warn!(
                    "moved conflicting directory aside: {} -> {}",
                    conflicting.display(),
                    backup.display()
                );
                Ok(Resolution::ProceedRelocated(backup))
            }
        }
    }

    /// An ancestor working tree can hold other projects, so under `Move`
    /// only its VCS metadata directory is set aside, not the whole tree.
    fn handle_ancestor_conflict(&self, target: &Path, ancestor: &Path) -> Result<Resolution> {
        match self.mode {
            ConflictMode::Allow => Ok(Resolution::Proceed),
            ConflictMode::Protect => Err(CloneError::Conflict {
                path: target.to_path_buf(),
                message: format!("target shadowed by repository at {}", ancestor.display()),
            }),
            ConflictMode::Move => {
                let backup = relocate(&ancestor.join(".git"))?;
                log::warn!(
                    "moved shadowing repository metadata aside: {} -> {}",
                    ancestor.join(".git").display(),
                    backup.display()
                );
                Ok(Resolution::ProceedRelocated(backup))
            }
        }
    }
}

/// Remote URL of the repository at `path`, if one is there. Covers both
/// working-tree and bare (mirror) layouts.
fn repo_remote_url(path: &Path) -> Option<String> {
    let repo = git2::Repository::open(path).ok()?;
    let remote = repo.find_remote("origin").ok()?;
    remote.url().map(|u| u.to_string())
}

fn is_repo_dir(path: &Path) -> bool {
    path.join(".git").exists()
}

fn same_remote(a: &str, b: &str) -> bool {
    a.trim_end_matches(".git").trim_end_matches('/') == b.trim_end_matches(".git").trim_end_matches('/')
}

fn find_nested_repo(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name().map(|n| n == ".git").unwrap_or(false) {
            return Some(path);
        }
        if let Some(found) = find_nested_repo(&path) {
            return Some(found);
        }
    }
    None
}

/// Rename a directory to a timestamped sibling. Never deletes anything.
fn relocate(path: &Path) -> Result<PathBuf> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "conflict".to_string());
    let mut backup = path.with_file_name(format!("{}.conflict.{}", name, ts));
    let mut n = 0;
    while backup.exists() {
        n += 1;
        backup = path.with_file_name(format!("{}.conflict.{}.{}", name, ts, n));
    }
    std::fs::rename(path, &backup).map_err(|e| CloneError::filesystem(path.to_path_buf(), e))?;
    Ok(backup)
}
