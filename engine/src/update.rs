//! Release update checks
//!
//! Compares the version a registry pins for a plugin with the latest GitHub
//! release of the repository the entry declares. Metadata only: nothing is
//! downloaded and resolution is unaffected.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Public GitHub REST API
pub const GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Deserialize)]
struct GitHubRelease {
    tag_name: String,
    html_url: String,
}

/// Result of one update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStatus {
    pub current: String,
    pub latest: String,
    pub update_available: bool,
    pub release_url: String,
}

/// Check `github_repo` (`owner/repo`) for a release newer than `current_version`
pub async fn check_latest(
    client: &reqwest::Client,
    github_repo: &str,
    current_version: &str,
) -> Result<UpdateStatus> {
    check_latest_at(client, GITHUB_API_URL, github_repo, current_version).await
}

/// Same as [`check_latest`] against a different API base URL
pub async fn check_latest_at(
    client: &reqwest::Client,
    api_base: &str,
    github_repo: &str,
    current_version: &str,
) -> Result<UpdateStatus> {
    let url = format!(
        "{}/repos/{}/releases/latest",
        api_base.trim_end_matches('/'),
        github_repo
    );
    debug!(%url, "Checking latest release");

    let release: GitHubRelease = client
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .with_context(|| format!("Failed to reach GitHub for {}", github_repo))?
        .error_for_status()
        .with_context(|| format!("Failed to fetch latest release of {}", github_repo))?
        .json()
        .await
        .context("Failed to parse GitHub release")?;

    let latest = strip_v(&release.tag_name).to_string();
    let current = strip_v(current_version).to_string();

    Ok(UpdateStatus {
        update_available: is_newer(&latest, &current),
        current,
        latest,
        release_url: release.html_url,
    })
}

fn strip_v(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Semver comparison where both parse, inequality otherwise
fn is_newer(latest: &str, current: &str) -> bool {
    match (semver::Version::parse(latest), semver::Version::parse(current)) {
        (Ok(latest), Ok(current)) => latest > current,
        _ => latest != current,
    }
}
