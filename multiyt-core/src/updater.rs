use serde::Deserialize;
use tracing::{info, warn};

use crate::events::{Event, EventBus};

const LATEST_RELEASE_URL: &str =
    "https://api.github.com/repos/zqily/multiyt-dlp/releases/latest";
const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    tag_name: String,
    html_url: String,
}

/// Checks the project's latest GitHub release and announces a newer version
/// through the event stream. Every failure is a logged warning; the check is
/// best-effort by design.
pub async fn check_for_updates(skipped_version: &str, events: &EventBus) {
    info!("checking for application updates");
    let release = match fetch_latest().await {
        Ok(release) => release,
        Err(reason) => {
            warn!("failed to check for updates: {reason}");
            return;
        }
    };

    let latest = release.tag_name.trim_start_matches('v').to_string();
    if latest == skipped_version {
        info!("update for version {latest} has been skipped by the user");
        return;
    }

    if version_is_newer(&latest, CURRENT_VERSION) {
        info!("new version available: {latest}");
        events
            .emit(Event::NewVersionAvailable {
                version: latest,
                url: release.html_url,
            })
            .await;
    }
}

async fn fetch_latest() -> Result<ReleaseInfo, String> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("multiyt-dlp/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|error| error.to_string())?;
    let body = client
        .get(LATEST_RELEASE_URL)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| error.to_string())?
        .text()
        .await
        .map_err(|error| error.to_string())?;
    serde_json::from_str(&body).map_err(|error| error.to_string())
}

/// Dotted-numeric comparison; non-numeric segments compare as zero.
fn version_is_newer(candidate: &str, current: &str) -> bool {
    let parse = |version: &str| -> Vec<u64> {
        version
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let a = parse(candidate);
    let b = parse(current);
    for index in 0..a.len().max(b.len()) {
        let x = a.get(index).copied().unwrap_or(0);
        let y = b.get(index).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_versions_compare_componentwise() {
        assert!(version_is_newer("1.3.0", "1.2.9"));
        assert!(version_is_newer("2.0", "1.9.9"));
        assert!(version_is_newer("1.2.1", "1.2"));
        assert!(!version_is_newer("1.2.0", "1.2.0"));
        assert!(!version_is_newer("1.1.9", "1.2.0"));
        // unparseable segments are treated as zero
        assert!(!version_is_newer("abc", "0.1"));
    }
}
