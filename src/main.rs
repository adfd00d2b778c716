use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod config;
mod conflict;
mod credentials;
mod errors;
mod gerrit;
mod git;
mod project;
mod report;
mod retry;
mod scheduler;

use config::{Config, ConflictMode, NetrcMode, Protocol};
use credentials::CredentialResolver;
use git::GitBackend;
use scheduler::CloneScheduler;

/// Clone or update every repository hosted on a Gerrit server.
#[derive(Parser, Debug)]
#[command(name = "gerrit-clone-all", version, about)]
struct Cli {
    /// Gerrit host to clone from
    #[arg(long, env = "GERRIT_HOST")]
    host: String,

    /// SSH port of the Gerrit server
    #[arg(long, default_value_t = 29418)]
    port: u16,

    /// Username for SSH clone URLs
    #[arg(long, env = "GERRIT_SSH_USER")]
    ssh_user: Option<String>,

    /// Clone over HTTPS instead of SSH
    #[arg(long)]
    https: bool,

    /// Directory the cloned tree is laid out under
    #[arg(long, default_value = ".")]
    output_path: PathBuf,

    /// Exclude read-only and hidden projects
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    skip_archived: bool,

    /// Only clone projects matching this substring or *-wildcard pattern
    /// (repeatable)
    #[arg(long = "include-project")]
    include_projects: Vec<String>,

    /// Number of concurrent clone workers
    #[arg(long, default_value_t = config::default_threads())]
    threads: usize,

    /// Per-clone timeout in seconds
    #[arg(long, default_value_t = 600)]
    clone_timeout: u64,

    /// Retries per project after the first attempt
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,

    /// Base backoff delay in seconds
    #[arg(long, default_value_t = 2)]
    retry_base_delay: u64,

    /// Backoff multiplier applied per attempt
    #[arg(long, default_value_t = 2.0, value_parser = parse_retry_factor)]
    retry_factor: f64,

    /// Backoff ceiling in seconds
    #[arg(long, default_value_t = 60)]
    retry_max_delay: u64,

    /// Disable .netrc credential lookup
    #[arg(long)]
    no_netrc: bool,

    /// Use a specific .netrc file instead of ~/.netrc
    #[arg(long)]
    netrc_file: Option<PathBuf>,

    /// Abort the run when no usable .netrc entry exists for the host
    #[arg(long, conflicts_with = "no_netrc")]
    netrc_required: bool,

    /// Fall through silently when the .netrc is missing or unmatched
    /// (the default)
    #[arg(long, conflicts_with_all = ["no_netrc", "netrc_required"])]
    netrc_optional: bool,

    /// Username for HTTPS authentication
    #[arg(long, env = "GERRIT_USERNAME")]
    username: Option<String>,

    /// Password or token for HTTPS authentication
    #[arg(long, env = "GERRIT_PASSWORD")]
    password: Option<String>,

    /// What to do when a target path holds an unrelated repository
    #[arg(long, value_enum, default_value_t = ConflictMode::Protect)]
    nested_mode: ConflictMode,

    /// Create bare mirror clones instead of working trees
    #[arg(long)]
    mirror: bool,

    /// Fetch into existing same-remote clones instead of skipping them
    #[arg(long)]
    update_existing: bool,

    /// Stop dequeuing new projects after the first failure
    #[arg(long, alias = "stop-on-first-error")]
    exit_on_error: bool,

    /// Overall run timeout in seconds
    #[arg(long)]
    global_timeout: Option<u64>,

    /// Where to write the JSON manifest (relative to the output path)
    #[arg(long, default_value = "clone-manifest.json")]
    manifest_filename: PathBuf,

    /// More logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// A multiplier below 1 would shrink the backoff instead of growing it.
fn parse_retry_factor(s: &str) -> Result<f64, String> {
    let factor: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if factor < 1.0 {
        return Err("retry factor must be at least 1.0".to_string());
    }
    Ok(factor)
}

impl Cli {
    fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Error
        } else {
            match self.verbose {
                0 => log::LevelFilter::Info,
                1 => log::LevelFilter::Debug,
                _ => log::LevelFilter::Trace,
            }
        }
    }

    fn into_config(self) -> Config {
        let manifest_path = if self.manifest_filename.is_absolute() {
            self.manifest_filename.clone()
        } else {
            self.output_path.join(&self.manifest_filename)
        };
        Config {
            host: self.host,
            port: self.port,
            ssh_user: self.ssh_user,
            protocol: if self.https {
                Protocol::Https
            } else {
                Protocol::Ssh
            },
            output_root: self.output_path,
            skip_archived: self.skip_archived,
            include_projects: self.include_projects,
            threads: self.threads,
            clone_timeout: Duration::from_secs(self.clone_timeout),
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_secs(self.retry_base_delay),
            retry_factor: self.retry_factor,
            retry_max_delay: Duration::from_secs(self.retry_max_delay),
            netrc_mode: match (self.no_netrc, self.netrc_required, self.netrc_optional) {
                (true, _, _) => NetrcMode::Disabled,
                (_, true, _) => NetrcMode::Required,
                _ => NetrcMode::Optional,
            },
            netrc_file: self.netrc_file,
            username: self.username,
            password: self.password,
            conflict_mode: self.nested_mode,
            mirror: self.mirror,
            update_existing: self.update_existing,
            exit_on_error: self.exit_on_error,
            global_timeout: self.global_timeout.map(Duration::from_secs),
            manifest_path,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(cli.log_level())
        .init();

    match run(cli.into_config()).await {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Discover, clone, report. Startup-fatal errors (discovery failure, a
/// mandatory netrc that cannot be satisfied) return `Err` before any task is
/// scheduled; per-project failures only show up in the manifest.
async fn run(config: Config) -> Result<bool> {
    let credentials = Arc::new(CredentialResolver::new(config.clone()));
    credentials
        .preflight()
        .context("credential preflight failed")?;

    let client = gerrit::make_http_client().context("failed to create http client")?;
    let raw = gerrit::fetch_projects(&client, &config.api_base_url(), &config.host)
        .await
        .with_context(|| format!("failed to list projects on {}", config.host))?;
    let filters = gerrit::Filters {
        skip_archived: config.skip_archived,
        include_projects: config.include_projects.clone(),
    };
    let projects = gerrit::discover(raw, &filters, &config.host)?;
    log::info!(
        "discovered {} projects on {} ({} workers)",
        projects.len(),
        config.host,
        config.threads
    );

    tokio::fs::create_dir_all(&config.output_root)
        .await
        .with_context(|| format!("failed to create {}", config.output_root.display()))?;

    let manifest_path = config.manifest_path.clone();
    let scheduler = Arc::new(CloneScheduler::new(
        config,
        Arc::new(GitBackend),
        credentials,
    ));
    let manifest = scheduler.run(projects).await;

    manifest
        .write_to(&manifest_path)
        .with_context(|| format!("failed to write manifest to {}", manifest_path.display()))?;
    report::print_summary(&manifest);

    Ok(manifest.is_success())
}
