//! Broken-link verification with bounded concurrency

use std::collections::HashSet;
use std::time::Duration;

use futures::{StreamExt, stream};
use reqwest::Client;
use tracing::trace;
use url::Url;

pub struct LinkChecker {
    client: Client,
    concurrency: usize,
}

impl LinkChecker {
    pub fn new(concurrency: usize, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            concurrency: concurrency.max(1),
        })
    }

    /// HEAD every link, following redirects; returns the broken ones sorted
    ///
    /// A link is broken when it answers with a status of 400 or above or
    /// cannot be reached at all.
    pub async fn broken_links(&self, links: Vec<String>) -> Vec<String> {
        let mut broken: Vec<String> = stream::iter(links)
            .map(|link| async move {
                match self.client.head(&link).send().await {
                    Ok(response) if response.status().as_u16() < 400 => None,
                    Ok(response) => {
                        trace!("{link}: {}", response.status());
                        Some(link)
                    }
                    Err(e) => {
                        trace!("{link}: {e}");
                        Some(link)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        broken.sort();
        broken
    }
}

/// Resolve anchors against the page URL, keeping unique http(s) targets
pub fn candidate_links(page: &str, hrefs: &[String]) -> Vec<String> {
    let Ok(base) = Url::parse(page) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    hrefs
        .iter()
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|mut url| {
            url.set_fragment(None);
            url.to_string()
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_candidate_links_resolve_and_filter() {
        let hrefs = vec![
            "/about".to_string(),
            "contact#form".to_string(),
            "contact".to_string(),
            "mailto:ops@example.com".to_string(),
            "javascript:void(0)".to_string(),
            "https://other.example/".to_string(),
        ];

        assert_eq!(
            candidate_links("https://example.com/docs/", &hrefs),
            vec![
                "https://example.com/about".to_string(),
                "https://example.com/docs/contact".to_string(),
                "https://other.example/".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_statuses_and_unreachable_hosts_are_broken() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{}/ok", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let checker = LinkChecker::new(10, Duration::from_secs(5)).unwrap();
        let links = vec![
            format!("{}/ok", server.uri()),
            format!("{}/moved", server.uri()),
            format!("{}/gone", server.uri()),
            "http://127.0.0.1:1/".to_string(),
        ];

        let mut expected = vec![
            format!("{}/gone", server.uri()),
            "http://127.0.0.1:1/".to_string(),
        ];
        expected.sort();

        assert_eq!(checker.broken_links(links).await, expected);
    }
}
