use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{Config, NetrcMode, Protocol};
use crate::errors::{CloneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    ExplicitFlag,
    Netrc,
    SshAgent,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub login: Option<String>,
    pub secret: Option<String>,
    pub source: CredentialSource,
}

impl Credentials {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self.source, CredentialSource::Anonymous)
    }
}

/// One `machine` (or `default`) block of a netrc file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NetrcEntry {
    login: Option<String>,
    password: Option<String>,
}

/// Minimal netrc parser: `machine`, `default`, `login`, `password` and
/// `account` tokens, `#` comments. `macdef` bodies are skipped up to the
/// blank line that terminates them.
fn parse_netrc(contents: &str) -> (HashMap<String, NetrcEntry>, Option<NetrcEntry>) {
    let mut machines: HashMap<String, NetrcEntry> = HashMap::new();
    let mut default: Option<NetrcEntry> = None;
    let mut current: Option<String> = None;
    let mut in_default = false;

    let mut lines = contents.lines().peekable();
    let mut tokens: Vec<String> = Vec::new();
    while let Some(line) = lines.next() {
        let line = line.split('#').next().unwrap_or("");
        for tok in line.split_whitespace() {
            if tok == "macdef" {
                // macdef bodies run until an empty line
                while let Some(body) = lines.peek() {
                    if body.trim().is_empty() {
                        break;
                    }
                    lines.next();
                }
                break;
            }
            tokens.push(tok.to_string());
        }
    }

    let mut it = tokens.into_iter().peekable();
    while let Some(tok) = it.next() {
        match tok.as_str() {
            "machine" => {
                if let Some(name) = it.next() {
                    machines.entry(name.clone()).or_default();
                    current = Some(name);
                    in_default = false;
                }
            }
            "default" => {
                default.get_or_insert_with(NetrcEntry::default);
                current = None;
                in_default = true;
            }
            "login" => {
                let value = it.next();
                if let Some(entry) = entry_mut(&mut machines, &mut default, &current, in_default) {
                    entry.login = value;
                }
            }
            "password" => {
                let value = it.next();
                if let Some(entry) = entry_mut(&mut machines, &mut default, &current, in_default) {
                    entry.password = value;
                }
            }
            "account" | "port" => {
                it.next();
            }
            _ => {}
        }
    }

    (machines, default)
}

fn entry_mut<'a>(
    machines: &'a mut HashMap<String, NetrcEntry>,
    default: &'a mut Option<NetrcEntry>,
    current: &Option<String>,
    in_default: bool,
) -> Option<&'a mut NetrcEntry> {
    if let Some(name) = current {
        machines.get_mut(name)
    } else if in_default {
        default.as_mut()
    } else {
        None
    }
}

fn lookup_netrc(path: &Path, host: &str) -> Result<Option<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CloneError::filesystem(path.to_path_buf(), e))?;
    let (machines, default) = parse_netrc(&contents);
    let entry = machines.get(host).cloned().or(default);
    Ok(entry.and_then(|e| match (e.login, e.password) {
        (Some(l), Some(p)) => Some((l, p)),
        _ => None,
    }))
}

/// Resolves the credential to use for a host, with the per-host result
/// cached for the rest of the run. Owned by the run, torn down with it.
pub struct CredentialResolver {
    config: Config,
    cache: Mutex<HashMap<String, Credentials>>,
}

impl CredentialResolver {
    pub fn new(config: Config) -> Self {
        CredentialResolver {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn netrc_path(&self) -> Option<PathBuf> {
        self.config
            .netrc_file
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".netrc")))
    }

    /// Verify once, before any task is scheduled, that a `Required` netrc
    /// lookup can actually succeed. Per-worker rediscovery of this failure
    /// is exactly what this call exists to prevent.
    pub fn preflight(&self) -> Result<()> {
        if self.config.netrc_mode != NetrcMode::Required {
            return Ok(());
        }
        if self.config.protocol != Protocol::Https {
            return Ok(());
        }
        if self.config.username.is_some() && self.config.password.is_some() {
            return Ok(());
        }
        let path = self.netrc_path().ok_or_else(|| CloneError::Auth {
            host: self.config.host.clone(),
            message: "netrc required but no netrc file path could be determined".to_string(),
        })?;
        if !path.exists() {
            return Err(CloneError::Auth {
                host: self.config.host.clone(),
                message: format!("netrc required but {} does not exist", path.display()),
            });
        }
        match lookup_netrc(&path, &self.config.host)? {
            Some(_) => Ok(()),
            None => Err(CloneError::Auth {
                host: self.config.host.clone(),
                message: format!(
                    "netrc required but {} has no entry for this host",
                    path.display()
                ),
            }),
        }
    }

    /// Resolution precedence: explicit flags, then netrc (HTTPS only, unless
    /// disabled), then the ambient SSH agent, then anonymous. The SSH branch
    /// never reads key material itself; the handshake belongs to the clone
    /// operation.
    pub fn resolve(&self, host: &str) -> Result<Credentials> {
        if let Some(creds) = self.cache.lock().unwrap().get(host) {
            return Ok(creds.clone());
        }
        let creds = self.resolve_uncached(host)?;
        self.cache
            .lock()
            .unwrap()
            .insert(host.to_string(), creds.clone());
        Ok(creds)
    }

    fn resolve_uncached(&self, host: &str) -> Result<Credentials> {
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            return Ok(Credentials {
                host: host.to_string(),
                login: Some(user.clone()),
                secret: Some(pass.clone()),
                source: CredentialSource::ExplicitFlag,
            });
        }

        if self.config.protocol == Protocol::Https
            && self.config.netrc_mode != NetrcMode::Disabled
        {
            if let Some(path) = self.netrc_path() {
                if path.exists() {
                    match lookup_netrc(&path, host) {
                        Ok(Some((login, password))) => {
                            log::debug!("netrc entry found for host={}", host);
                            return Ok(Credentials {
                                host: host.to_string(),
                                login: Some(login),
                                secret: Some(password),
                                source: CredentialSource::Netrc,
                            });
                        }
                        Ok(None) => {}
                        Err(e) if self.config.netrc_mode == NetrcMode::Required => return Err(e),
                        Err(e) => log::debug!("ignoring netrc read failure: {}", e),
                    }
                }
            }
        }

        if self.config.protocol == Protocol::Ssh {
            return Ok(Credentials {
                host: host.to_string(),
                login: self.config.ssh_user.clone(),
                secret: None,
                source: CredentialSource::SshAgent,
            });
        }

        Ok(Credentials {
            host: host.to_string(),
            login: None,
            secret: None,
            source: CredentialSource::Anonymous,
        })
    }
}
