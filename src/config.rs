use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;

/// Hard ceiling on worker count, to avoid hammering the Gerrit server or the
/// local filesystem no matter what the user asks for.
pub const MAX_THREADS: usize = 64;

pub fn default_threads() -> usize {
    (num_cpus::get() * 4).min(32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Ssh,
    Https,
}

impl FromStr for Protocol {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Protocol::Ssh),
            "https" => Ok(Protocol::Https),
            _ => Err("no match"),
        }
    }
}

/// How to treat the `.netrc` lookup during HTTPS credential resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetrcMode {
    /// Never consult a netrc file.
    Disabled,
    /// Consult it, fall through silently when absent or unmatched.
    Optional,
    /// A missing file or unmatched host aborts the run before scheduling.
    Required,
}

/// What to do when a target path collides with a pre-existing repository
/// belonging to a different remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConflictMode {
    /// Skip the check entirely and clone anyway.
    Allow,
    /// A genuine conflict fails that task.
    Protect,
    /// Rename the conflicting directory aside, then clone.
    Move,
}

/// Immutable configuration for one run. Assembled once in `main` and passed
/// by reference everywhere; no component reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ssh_user: Option<String>,
    pub protocol: Protocol,
    pub output_root: PathBuf,
    pub skip_archived: bool,
    pub include_projects: Vec<String>,
    pub threads: usize,
    pub clone_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_factor: f64,
    pub retry_max_delay: Duration,
    pub netrc_mode: NetrcMode,
    pub netrc_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub conflict_mode: ConflictMode,
    pub mirror: bool,
    pub update_existing: bool,
    pub exit_on_error: bool,
    pub global_timeout: Option<Duration>,
    pub manifest_path: PathBuf,
}

impl Config {
    /// Base URL of the Gerrit REST API for this host.
    pub fn api_base_url(&self) -> String {
        format!("https://{}", self.host)
    }
}

#[cfg(test)]
impl Config {
    /// A config with sane values for unit tests; individual fields get
    /// overridden per test.
    pub fn for_tests() -> Self {
        Config {
            host: "gerrit.example.org".to_string(),
            port: 29418,
            ssh_user: None,
            protocol: Protocol::Https,
            output_root: PathBuf::from("."),
            skip_archived: true,
            include_projects: Vec::new(),
            threads: 2,
            clone_timeout: Duration::from_secs(600),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_factor: 2.0,
            retry_max_delay: Duration::from_secs(60),
            netrc_mode: NetrcMode::Optional,
            netrc_file: None,
            username: None,
            password: None,
            conflict_mode: ConflictMode::Protect,
            mirror: false,
            update_existing: false,
            exit_on_error: false,
            global_timeout: None,
            manifest_path: PathBuf::from("clone-manifest.json"),
        }
    }
}
