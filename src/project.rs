use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{Config, Protocol};
use crate::errors::CloneError;

/// Gerrit project states as reported by the listing API. Anything other than
/// `Active` counts as archived for filtering purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectState {
    Active,
    ReadOnly,
    Hidden,
}

impl ProjectState {
    pub fn is_archived(self) -> bool {
        self != ProjectState::Active
    }
}

/// A project discovered on the server. Immutable once discovered; `name` is
/// the slash-segmented path unique within the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub state: ProjectState,
    pub parent: Option<String>,
}

impl Project {
    /// Clone URL for this project. Gerrit serves authenticated HTTPS under
    /// the `/a/` prefix and SSH on its own port.
    pub fn url(&self, config: &Config, authenticated: bool) -> String {
        match config.protocol {
            Protocol::Ssh => {
                let user = config
                    .ssh_user
                    .as_deref()
                    .map(|u| format!("{}@", u))
                    .unwrap_or_default();
                format!("ssh://{}{}:{}/{}", user, config.host, config.port, self.name)
            }
            Protocol::Https if authenticated => {
                format!("https://{}/a/{}", config.host, self.name)
            }
            Protocol::Https => format!("https://{}/{}", config.host, self.name),
        }
    }

    /// Target path beneath the output root, mirroring the slash-segmented
    /// project name.
    pub fn target_path(&self, output_root: &std::path::Path) -> PathBuf {
        output_root.join(&self.name)
    }
}

/// One unit of work for the scheduler. `index` is the discovery position,
/// which the aggregator uses for stable manifest ordering.
#[derive(Debug, Clone)]
pub struct CloneTask {
    pub project: Project,
    pub index: usize,
    pub target_path: PathBuf,
    pub attempt: u32,
}

/// Machine-readable failure category carried into the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Auth,
    Conflict,
    Filesystem,
    Git,
}

impl From<&CloneError> for ErrorKind {
    fn from(err: &CloneError) -> Self {
        match err {
            CloneError::Discovery { .. } | CloneError::Network(_) => ErrorKind::Network,
            CloneError::Timeout { .. } | CloneError::Cancelled => ErrorKind::Timeout,
            CloneError::Auth { .. } => ErrorKind::Auth,
            CloneError::Conflict { .. } => ErrorKind::Conflict,
            CloneError::Filesystem { .. } => ErrorKind::Filesystem,
            CloneError::Git(_) => ErrorKind::Git,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal outcome for one project. Produced exactly once per discovered
/// project; owned by the aggregator afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CloneResult {
    pub project: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relocated_from: Option<PathBuf>,
}

impl CloneResult {
    pub fn succeeded(task: &CloneTask, elapsed: Duration, relocated_from: Option<PathBuf>) -> Self {
        CloneResult {
            project: task.project.name.clone(),
            outcome: Outcome::Succeeded,
            attempts: task.attempt + 1,
            duration_ms: elapsed.as_millis() as u64,
            error_kind: None,
            error: None,
            relocated_from,
        }
    }

    pub fn failed(task: &CloneTask, elapsed: Duration, err: &CloneError) -> Self {
        CloneResult {
            project: task.project.name.clone(),
            outcome: Outcome::Failed,
            attempts: task.attempt + 1,
            duration_ms: elapsed.as_millis() as u64,
            error_kind: Some(ErrorKind::from(err)),
            error: Some(err.to_string()),
            relocated_from: None,
        }
    }

    pub fn skipped(name: &str, attempts: u32) -> Self {
        CloneResult {
            project: name.to_string(),
            outcome: Outcome::Skipped,
            attempts,
            duration_ms: 0,
            error_kind: None,
            error: None,
            relocated_from: None,
        }
    }
}
