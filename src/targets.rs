//! URL canonicalisation for followed targets

use std::time::Duration;

use tracing::debug;
use url::Url;

pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Trim, default the scheme to https and normalise through [`Url`]
pub fn normalize(raw: &str) -> Result<String, url::ParseError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    Ok(Url::parse(&with_scheme)?.to_string())
}

/// Follow redirects to the final URL; unreachable URLs are kept as given
pub async fn resolve(url: &str, timeout: Duration) -> String {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!("cannot build resolver client: {e}");
            return url.to_string();
        }
    };

    match client.get(url).send().await {
        Ok(response) => response.url().to_string(),
        Err(e) => {
            debug!("{url} not resolved: {e}");
            url.to_string()
        }
    }
}
