use anyhow::{Context, Result};
use semver::Version;
use serde::Deserialize;

const LATEST_RELEASE_URL: &str = "https://api.github.com/repos/darkiiuseai/ITunesRPC/releases/latest";

#[derive(Deserialize, Debug)]
pub struct GitHubRelease {
    pub tag_name: String,
    pub html_url: String, // Link to the release page
}

/// Returns the release page URL when a newer release than this build exists.
pub fn check_for_updates() -> Result<Option<String>> {
    let local_version = Version::parse(env!("CARGO_PKG_VERSION"))
        .context("local package version is not SemVer compliant")?;

    // User-Agent is REQUIRED by GitHub API
    let release: GitHubRelease = ureq::get(LATEST_RELEASE_URL)
        .set("User-Agent", "tunesync-client")
        .call()
        .context("release query failed")?
        .into_json()
        .context("release response was not valid JSON")?;

    Ok(newer_release(&local_version, &release.tag_name).map(|remote| {
        tracing::info!("[Update] Local: {}, Remote: {}", local_version, remote);
        release.html_url
    }))
}

/// Parses a release tag ("v1.5.1" or "1.5.1") and keeps it only if it is
/// strictly newer than `local`.
fn newer_release(local: &Version, tag: &str) -> Option<Version> {
    match Version::parse(tag.trim_start_matches('v')) {
        Ok(remote) if remote > *local => Some(remote),
        Ok(_) => None,
        Err(e) => {
            // Log warning but don't fail; a bad tag just means no update
            tracing::warn!("[Update] Ignoring non-SemVer release tag '{}': {}", tag, e);
            None
        }
    }
}
