use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::errors::{CloneError, Result};
use crate::project::{Project, ProjectState};

/// Gerrit prepends this to every JSON response to defeat XSSI; it has to be
/// stripped before parsing.
const XSSI_PREFIX: &str = ")]}'";

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    #[serde(default)]
    state: Option<ProjectState>,
    #[serde(default)]
    parent: Option<String>,
}

pub fn make_http_client() -> Result<Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(CloneError::network)
}

/// Fetch the raw project listing from `{base}/projects/?d`.
pub async fn fetch_projects(client: &Client, base_url: &str, host: &str) -> Result<Vec<Project>> {
    let url = format!("{}/projects/?d", base_url);
    let body = client
        .get(&url)
        .send()
        .await
        .map_err(CloneError::network)?
        .error_for_status()
        .map_err(CloneError::network)?
        .text()
        .await
        .map_err(CloneError::network)?;

    let projects = parse_listing(&body, host)?;
    log::debug!("fetched projects: count={}", projects.len());
    Ok(projects)
}

fn parse_listing(body: &str, host: &str) -> Result<Vec<Project>> {
    let json = body.strip_prefix(XSSI_PREFIX).unwrap_or(body).trim_start();
    let raw: HashMap<String, ProjectInfo> =
        serde_json::from_str(json).map_err(|e| CloneError::Discovery {
            host: host.to_string(),
            message: format!("failed to parse project listing: {}", e),
        })?;

    Ok(raw
        .into_iter()
        .map(|(name, info)| Project {
            name,
            state: info.state.unwrap_or(ProjectState::Active),
            parent: info.parent,
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub skip_archived: bool,
    /// Substring or `*`-wildcard patterns; empty means include everything.
    pub include_projects: Vec<String>,
}

/// Filter and order the raw listing. The lexicographic order fixed here is
/// the manifest order for the whole run. An empty listing from a live server
/// is treated as a discovery failure.
pub fn discover(raw: Vec<Project>, filters: &Filters, host: &str) -> Result<Vec<Project>> {
    if raw.is_empty() {
        return Err(CloneError::Discovery {
            host: host.to_string(),
            message: "server returned no projects".to_string(),
        });
    }

    let mut projects: Vec<Project> = raw
        .into_iter()
        .filter(|p| !(filters.skip_archived && p.state.is_archived()))
        .filter(|p| {
            filters.include_projects.is_empty()
                || filters
                    .include_projects
                    .iter()
                    .any(|pat| matches_pattern(&p.name, pat))
        })
        .collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(projects)
}

/// `*`-wildcard match when the pattern contains `*`, substring match
/// otherwise.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return name.contains(pattern);
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    if let Some(last) = parts.last() {
        if !last.is_empty() && !name.ends_with(last) {
            return false;
        }
    }
    true
}
