use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use git2::{Cred, ErrorClass, ErrorCode, RemoteCallbacks};

use crate::credentials::{CredentialSource, Credentials};
use crate::errors::{CloneError, Result};

/// Cooperative cancellation for an in-flight transfer. The transfer-progress
/// callback checks it on every packet, so firing the flag aborts the
/// underlying operation instead of leaving it orphaned.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    /// A flag that also observes cancellation of `self`. The scheduler hands
    /// each task a child of the run-level flag, so a per-task timeout cancels
    /// one transfer while a run-level cancel aborts them all.
    pub fn child(&self) -> Self {
        CancelFlag {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.own)),
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|p| p.load(Ordering::SeqCst))
                .unwrap_or(false)
    }
}

/// Everything the backend needs for one clone or update.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub host: String,
    pub url: String,
    pub target: PathBuf,
    pub mirror: bool,
    /// The target already holds a clone of the same remote; fetch instead of
    /// cloning.
    pub update: bool,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Performed {
    Cloned,
    Updated,
}

/// The clone/update collaborator. Blocking; the scheduler runs it on the
/// blocking pool and owns the timeout and retry policy around it.
pub trait CloneBackend: Send + Sync + 'static {
    fn perform(&self, request: &CloneRequest, cancel: &CancelFlag) -> Result<Performed>;
}

pub struct GitBackend;

impl GitBackend {
    fn callbacks<'a>(request: &'a CloneRequest, cancel: &'a CancelFlag) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let cancel = cancel.clone();
        callbacks.transfer_progress(move |_stats| !cancel.is_cancelled());

        let creds = request.credentials.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            match creds.as_ref().map(|c| c.source) {
                Some(CredentialSource::SshAgent) => {
                    let user = creds
                        .as_ref()
                        .and_then(|c| c.login.as_deref())
                        .or(username_from_url)
                        .unwrap_or("git");
                    Cred::ssh_key_from_agent(user)
                }
                Some(CredentialSource::ExplicitFlag) | Some(CredentialSource::Netrc) => {
                    let c = creds.as_ref().unwrap();
                    Cred::userpass_plaintext(
                        c.login.as_deref().unwrap_or_default(),
                        c.secret.as_deref().unwrap_or_default(),
                    )
                }
                _ => Cred::default(),
            }
        });
        callbacks
    }

    fn fetch_options<'a>(
        request: &'a CloneRequest,
        cancel: &'a CancelFlag,
    ) -> git2::FetchOptions<'a> {
        let mut fo = git2::FetchOptions::new();
        fo.remote_callbacks(Self::callbacks(request, cancel));
        fo
    }

    fn clone_working_tree(request: &CloneRequest, cancel: &CancelFlag) -> Result<()> {
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(Self::fetch_options(request, cancel));
        builder
            .clone(&request.url, &request.target)
            .map_err(|e| map_git_err(e, &request.host))?;
        Ok(())
    }

    /// Bare clone of every ref, laid out like `git clone --mirror`.
    fn clone_mirror(request: &CloneRequest, cancel: &CancelFlag) -> Result<()> {
        let repo = git2::Repository::init_bare(&request.target)
            .map_err(|e| map_git_err(e, &request.host))?;
        {
            let mut config = repo.config().map_err(|e| map_git_err(e, &request.host))?;
            config
                .set_bool("remote.origin.mirror", true)
                .map_err(|e| map_git_err(e, &request.host))?;
        }
        let mut remote = repo
            .remote_with_fetch("origin", &request.url, "+refs/*:refs/*")
            .map_err(|e| map_git_err(e, &request.host))?;
        remote
            .fetch(
                &[] as &[&str],
                Some(&mut Self::fetch_options(request, cancel)),
                None,
            )
            .map_err(|e| map_git_err(e, &request.host))?;
        Ok(())
    }

    fn update(request: &CloneRequest, cancel: &CancelFlag) -> Result<()> {
        let repo = git2::Repository::open(&request.target)
            .map_err(|e| map_git_err(e, &request.host))?;
        let mut remote = repo
            .find_remote("origin")
            .map_err(|e| map_git_err(e, &request.host))?;
        remote
            .fetch(
                &[] as &[&str],
                Some(&mut Self::fetch_options(request, cancel)),
                None,
            )
            .map_err(|e| map_git_err(e, &request.host))?;
        Ok(())
    }
}

impl CloneBackend for GitBackend {
    fn perform(&self, request: &CloneRequest, cancel: &CancelFlag) -> Result<Performed> {
        if request.update {
            Self::update(request, cancel)?;
            log::info!("updated url={} target={:?}", request.url, request.target);
            return Ok(Performed::Updated);
        }

        if let Some(parent) = request.target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CloneError::filesystem(parent.to_path_buf(), e))?;
        }

        if request.mirror {
            Self::clone_mirror(request, cancel)?;
        } else {
            Self::clone_working_tree(request, cancel)?;
        }
        log::info!("cloned url={} target={:?}", request.url, request.target);
        Ok(Performed::Cloned)
    }
}

/// Map libgit2's error classes onto the run taxonomy so the retry classifier
/// has something exact to match on.
fn map_git_err(e: git2::Error, host: &str) -> CloneError {
    if e.code() == ErrorCode::Auth || e.code() == ErrorCode::Certificate {
        return CloneError::Auth {
            host: host.to_string(),
            message: e.message().to_string(),
        };
    }
    match e.class() {
        ErrorClass::Net | ErrorClass::Http => CloneError::Network(e.message().to_string()),
        ErrorClass::Ssh => {
            let msg = e.message().to_string();
            if msg.to_lowercase().contains("auth") || msg.to_lowercase().contains("key") {
                CloneError::Auth {
                    host: host.to_string(),
                    message: msg,
                }
            } else {
                CloneError::Network(msg)
            }
        }
        ErrorClass::Os | ErrorClass::Filesystem => CloneError::Filesystem {
            path: PathBuf::new(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()),
        },
        _ => CloneError::Git(e.message().to_string()),
    }
}
