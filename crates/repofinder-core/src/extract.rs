//! Candidate extraction from document text.
//!
//! Wraps the pattern-based extraction of `repofinder-links` with optional
//! model-assisted boundary detection and project-page following.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use repofinder_links::{
    UrlWindow, assemble_candidates, find_url_windows, is_hosting_url, project_page_leads,
    repair_line_wraps, scan_page_links,
};

use crate::gateway::{ChatMessage, ModelGateway, complete_typed};
use crate::{BoxFuture, CandidateOrigin, LinkConfig, UrlCandidate, normalize_url};

/// Fetches HTML for project-page following.
pub trait PageFetcher: Send + Sync {
    /// Page body, or `None` on any failure.
    fn fetch_page<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>>;
}

const PAGE_TIMEOUT: Duration = Duration::from_secs(10);

impl PageFetcher for reqwest::Client {
    fn fetch_page<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let resp = match self.get(url).timeout(PAGE_TIMEOUT).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(url, error = %e, "project page fetch failed");
                    return None;
                }
            };
            if !resp.status().is_success() {
                tracing::debug!(url, status = resp.status().as_u16(), "project page fetch failed");
                return None;
            }
            resp.text().await.ok()
        })
    }
}

/// Upper bound on URL windows sent to the model in one request.
const MAX_MODEL_WINDOWS: usize = 20;

const BOUNDARY_SYSTEM_PROMPT: &str = "You extract source-code repository URLs from text \
copied out of a PDF. URLs may be broken by line wraps or glued to neighbouring words and \
punctuation. Reply in JSON format.";

#[derive(Debug, Deserialize)]
struct BoundaryUrl {
    #[serde(default)]
    snippet: Option<usize>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct BoundaryReply {
    urls: Vec<BoundaryUrl>,
}

/// Lowercase with all whitespace removed, used to check that a model-reported
/// URL really occurs in the text.
fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn without_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

fn boundary_prompt(windows: &[&UrlWindow]) -> String {
    let snippets = windows
        .iter()
        .enumerate()
        .map(|(i, w)| format!("{}. \"{}\"", i + 1, w.context.replace('\n', "\\n")))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Text snippets:
{snippets}

List every code repository URL (GitHub, GitLab, Bitbucket and similar) that appears in the snippets, with its exact boundaries.
Reply in JSON format:
{{
  "urls": [{{"snippet": <snippet number>, "url": "<full URL>"}}]
}}"#
    )
}

/// Extracts candidate repository URLs from document text.
pub struct UrlExtractor<'a> {
    config: &'a LinkConfig,
    gateway: Option<&'a dyn ModelGateway>,
    fetcher: Option<&'a dyn PageFetcher>,
}

impl<'a> UrlExtractor<'a> {
    pub fn new(config: &'a LinkConfig) -> Self {
        Self {
            config,
            gateway: None,
            fetcher: None,
        }
    }

    /// Use the model for boundary extraction; pattern matching stays the
    /// fallback.
    pub fn with_gateway(mut self, gateway: &'a dyn ModelGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Follow project pages when the text links no repository directly.
    pub fn with_fetcher(mut self, fetcher: &'a dyn PageFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub async fn extract(&self, text: &str) -> Vec<UrlCandidate> {
        let repaired = repair_line_wraps(text);
        let windows = find_url_windows(&repaired, self.config.context_radius);

        let mut candidates = match self.gateway {
            Some(gateway) => match self.model_boundaries(gateway, &repaired, &windows).await {
                Some(found) if !found.is_empty() => found,
                _ => self.pattern_candidates(&windows),
            },
            None => self.pattern_candidates(&windows),
        };

        if candidates.is_empty()
            && let Some(fetcher) = self.fetcher
        {
            candidates = self.follow_project_pages(fetcher, &repaired).await;
        }

        tracing::debug!(count = candidates.len(), "extracted repository candidates");
        candidates
    }

    fn pattern_candidates(&self, windows: &[UrlWindow]) -> Vec<UrlCandidate> {
        assemble_candidates(
            windows.iter().map(|w| (w.url.clone(), w.context.clone())),
            CandidateOrigin::PdfText,
            self.config,
        )
    }

    /// Ask the model for exact URL boundaries in the windows that mention a
    /// hosting domain. `None` when there is nothing to ask or the call fails.
    async fn model_boundaries(
        &self,
        gateway: &dyn ModelGateway,
        text: &str,
        windows: &[UrlWindow],
    ) -> Option<Vec<UrlCandidate>> {
        let relevant: Vec<&UrlWindow> = windows
            .iter()
            .filter(|w| {
                let lower = w.context.to_lowercase();
                self.config
                    .hosting_domains
                    .iter()
                    .any(|d| lower.contains(&d.to_lowercase()))
            })
            .take(MAX_MODEL_WINDOWS)
            .collect();
        if relevant.is_empty() {
            return None;
        }

        let messages = vec![
            ChatMessage::system(BOUNDARY_SYSTEM_PROMPT),
            ChatMessage::user(boundary_prompt(&relevant)),
        ];
        let reply: BoundaryReply = match complete_typed(gateway, messages, 0.0).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "model URL extraction failed, using pattern matching");
                return None;
            }
        };

        let haystack = compact(text);
        let found = reply.urls.into_iter().filter_map(|item| {
            let url = item.url.trim().to_string();
            let needle = compact(without_scheme(&normalize_url(&url)));
            if needle.is_empty() || !haystack.contains(&needle) {
                tracing::debug!(url = %url, "model URL not present in text, dropped");
                return None;
            }
            if !is_hosting_url(&url, &self.config.hosting_domains) {
                return None;
            }
            let context = item
                .snippet
                .and_then(|n| relevant.get(n.checked_sub(1)?))
                .map(|w| w.context.clone())
                .unwrap_or_else(|| url.clone());
            Some((url, context))
        });

        Some(assemble_candidates(found, CandidateOrigin::PdfText, self.config))
    }

    async fn follow_project_pages(&self, fetcher: &dyn PageFetcher, text: &str) -> Vec<UrlCandidate> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for page in project_page_leads(text, self.config) {
            let Some(html) = fetcher.fetch_page(&page).await else {
                continue;
            };
            let found = scan_page_links(&html, &page, self.config);
            tracing::debug!(page = %page, count = found.len(), "scanned project page");
            for candidate in found {
                if seen.insert(candidate.normalized_url.to_lowercase()) {
                    out.push(candidate);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::gateway::GatewayError;
    use crate::gateway::mock::MockGateway;

    #[derive(Default)]
    struct MockPages {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MockPages {
        fn with_page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }
    }

    impl PageFetcher for MockPages {
        fn fetch_page<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page = self.pages.get(url).cloned();
            Box::pin(async move { page })
        }
    }

    const TEXT: &str = "Our code is available at https://github.com/acme/demo-\nnet. \
                        Baseline weights: https://github.com/other/baseline.";

    #[tokio::test]
    async fn pattern_extraction_without_model() {
        let cfg = LinkConfig::default();
        let found = UrlExtractor::new(&cfg).extract(TEXT).await;
        let urls: Vec<_> = found.iter().map(|c| c.normalized_url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://github.com/acme/demo-net", "https://github.com/other/baseline"]
        );
    }

    #[tokio::test]
    async fn model_boundaries_are_primary() {
        let cfg = LinkConfig::default();
        let gateway = MockGateway::json(json!({
            "urls": [{"snippet": 1, "url": "https://github.com/acme/demo-net"}]
        }));
        let found = UrlExtractor::new(&cfg).with_gateway(&gateway).extract(TEXT).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].normalized_url, "https://github.com/acme/demo-net");
        assert!(found[0].source_context.contains("code is available"));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn invented_urls_fall_back_to_patterns() {
        let cfg = LinkConfig::default();
        let gateway = MockGateway::json(json!({
            "urls": [{"url": "https://github.com/made/up"}]
        }));
        let found = UrlExtractor::new(&cfg).with_gateway(&gateway).extract(TEXT).await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn gateway_failure_falls_back_to_patterns() {
        let cfg = LinkConfig::default();
        let gateway = MockGateway::new(Err(GatewayError::RequestFailure("503".into())));
        let found = UrlExtractor::new(&cfg).with_gateway(&gateway).extract(TEXT).await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn no_hosting_text_skips_model() {
        let cfg = LinkConfig::default();
        let gateway = MockGateway::json(json!({"urls": []}));
        let found = UrlExtractor::new(&cfg)
            .with_gateway(&gateway)
            .extract("See https://arxiv.org/abs/1234.5678 for details.")
            .await;
        assert!(found.is_empty());
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn follows_project_page_when_no_direct_link() {
        let cfg = LinkConfig::default();
        let pages = MockPages::default().with_page(
            "https://acme.github.io/demo-net",
            r#"<html><body><a href="https://github.com/acme/demo-net">Code</a>
               <a href="https://arxiv.org/abs/1">Paper</a></body></html>"#,
        );
        let found = UrlExtractor::new(&cfg)
            .with_fetcher(&pages)
            .extract("Project page: https://acme.github.io/demo-net")
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw_url, "https://github.com/acme/demo-net");
        assert!(found[0].source_context.starts_with("project page"));
    }

    #[tokio::test]
    async fn direct_link_skips_project_pages() {
        let cfg = LinkConfig::default();
        let pages = MockPages::default();
        let found = UrlExtractor::new(&cfg)
            .with_fetcher(&pages)
            .extract("Code: https://github.com/acme/demo-net, page https://acme.github.io/demo")
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(pages.calls.load(Ordering::SeqCst), 0);
    }
}
