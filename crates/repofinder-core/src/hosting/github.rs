//! GitHub REST v3 client.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{FileTreeNode, HostingError, HostingService, NodeKind, RepositorySummary};
use crate::backoff::{BackoffPolicy, Step};
use crate::rate_limit::{
    HostingRateLimiter, RateStatus, is_rate_limited, parse_retry_after, rate_limit_wait,
};
use crate::{BoxFuture, Config};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Value shipped in sample `.env` files; never sent as a credential.
const PLACEHOLDER_TOKEN: &str = "your_github_token_here";

#[derive(Deserialize)]
struct GhLicense {
    name: Option<String>,
}

#[derive(Deserialize)]
struct GhRepo {
    full_name: String,
    html_url: String,
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    language: Option<String>,
    #[serde(default)]
    size: u64,
    pushed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    topics: BTreeSet<String>,
    license: Option<GhLicense>,
    #[serde(default)]
    open_issues_count: u64,
}

impl From<GhRepo> for RepositorySummary {
    fn from(r: GhRepo) -> Self {
        RepositorySummary {
            full_name: r.full_name,
            url: r.html_url,
            description: r.description.unwrap_or_default(),
            stars: r.stargazers_count,
            forks: r.forks_count,
            primary_language: r.language,
            size_kb: r.size,
            pushed_at: r.pushed_at,
            created_at: r.created_at,
            archived: r.archived,
            topics: r.topics,
            license: r.license.and_then(|l| l.name),
            open_issues: r.open_issues_count,
        }
    }
}

#[derive(Deserialize)]
struct GhSearch {
    #[serde(default)]
    items: Vec<GhRepo>,
}

#[derive(Deserialize)]
struct GhEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct GhFile {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GhRateLimit {
    rate: RateStatus,
}

/// How a completed HTTP exchange should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    NotFound,
    RateLimited,
    /// Worth retrying with backoff (gateway errors).
    Transient,
    /// Any other status; terminal.
    Failed,
}

pub fn classify_response(status: u16, body: &str) -> ResponseClass {
    if is_rate_limited(status, body) {
        return ResponseClass::RateLimited;
    }
    match status {
        200..=299 => ResponseClass::Ok,
        404 => ResponseClass::NotFound,
        502..=504 => ResponseClass::Transient,
        _ => ResponseClass::Failed,
    }
}

/// A response reduced to what the retry logic needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

pub async fn read_response(resp: reqwest::Response) -> Result<Fetched, reqwest::Error> {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await?;
    Ok(Fetched {
        status,
        retry_after,
        body,
    })
}

/// Decode a base64 `content` field; GitHub wraps it at 60 columns.
pub fn decode_base64_content(content: &str) -> Option<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact).ok()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn transport_error(e: reqwest::Error) -> HostingError {
    if e.is_timeout() {
        HostingError::Transport("request timed out".into())
    } else {
        HostingError::Transport(e.to_string())
    }
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    timeout: Duration,
    backoff: BackoffPolicy,
    limiter: Arc<HostingRateLimiter>,
}

impl GitHubClient {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        backoff: BackoffPolicy,
        limiter: Arc<HostingRateLimiter>,
    ) -> Self {
        let token = token.filter(|t| !t.trim().is_empty() && t != PLACEHOLDER_TOKEN);
        if token.is_none() {
            tracing::warn!("no GitHub token configured; unauthenticated requests are limited to 60/hour");
        }
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
            backoff,
            limiter,
        }
    }

    pub fn from_config(
        client: reqwest::Client,
        config: &Config,
        limiter: Arc<HostingRateLimiter>,
    ) -> Self {
        Self::new(
            client,
            config.github_api_url.clone(),
            config.github_token.clone(),
            Duration::from_secs(config.hosting_timeout_secs),
            BackoffPolicy::new(config.hosting_max_attempts, Duration::from_secs(1)),
            limiter,
        )
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "repofinder")
            .timeout(self.timeout);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("token {token}"));
        }
        req
    }

    /// GET with rate limiting and retries. Returns the body of a 2xx reply.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<String, HostingError> {
        self.fetch_with_retry(url, || async move {
            match self.request(url).query(query).send().await {
                Ok(resp) => read_response(resp).await.map_err(transport_error),
                Err(e) => Err(transport_error(e)),
            }
        })
        .await
    }

    /// Drive `send` through the backoff policy, one limiter permit per
    /// attempt. A rate limit still in force after the last attempt is
    /// reported as [`HostingError::Unavailable`].
    async fn fetch_with_retry<F, Fut>(&self, url: &str, mut send: F) -> Result<String, HostingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Fetched, HostingError>>,
    {
        let result = self
            .backoff
            .run("hosting request", |_| {
                let sent = send();
                async move {
                    self.limiter.acquire().await;
                    tracing::debug!(url, "hosting request");
                    self.classify_attempt(sent.await).await
                }
            })
            .await;

        result.map_err(|e| match e {
            HostingError::RateLimited => {
                HostingError::Unavailable("rate limit not lifted within retry budget".into())
            }
            other => other,
        })
    }

    /// Decide what one attempt's reply means for the retry loop.
    async fn classify_attempt(
        &self,
        fetched: Result<Fetched, HostingError>,
    ) -> Step<String, HostingError> {
        let fetched = match fetched {
            Ok(f) => f,
            Err(e) => return Step::retry(e),
        };
        match classify_response(fetched.status, &fetched.body) {
            ResponseClass::Ok => Step::Done(Ok(fetched.body)),
            ResponseClass::NotFound => Step::Done(Err(HostingError::NotFound)),
            ResponseClass::RateLimited => {
                let wait = self.rate_limit_wait(fetched.retry_after).await;
                Step::retry_after(HostingError::RateLimited, wait)
            }
            ResponseClass::Transient => {
                Step::retry(HostingError::Transport(format!("HTTP {}", fetched.status)))
            }
            ResponseClass::Failed => Step::Done(Err(HostingError::Unavailable(format!(
                "HTTP {}",
                fetched.status
            )))),
        }
    }

    /// Compute the wait after a rate-limit reply. Only one worker at a time
    /// computes it; the others reuse the deadline it set.
    async fn rate_limit_wait(&self, retry_after: Option<Duration>) -> Duration {
        self.limiter.on_rate_limited();
        let _gate = self.limiter.lock_gate().await;
        if let Some(remaining) = self.limiter.blocked_remaining() {
            return remaining;
        }
        let status = match retry_after {
            Some(_) => None,
            None => self.fetch_rate_status().await,
        };
        let now = Utc::now().timestamp().max(0) as u64;
        let wait = rate_limit_wait(retry_after, status, now);
        tracing::warn!(wait_secs = wait.as_secs(), "GitHub API rate limit reached");
        self.limiter.block_for(wait);
        wait
    }

    /// Single unthrottled probe of `/rate_limit`.
    async fn fetch_rate_status(&self) -> Option<RateStatus> {
        let url = format!("{}/rate_limit", self.api_url);
        let resp = self.request(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: GhRateLimit = resp.json().await.ok()?;
        Some(parsed.rate)
    }

    async fn fetch_file(&self, url: &str) -> Option<Vec<u8>> {
        let body = self.get(url, &[]).await.ok()?;
        let file: GhFile = serde_json::from_str(&body).ok()?;
        decode_base64_content(file.content.as_deref()?)
    }
}

fn require(value: &str, what: &str) -> Result<(), HostingError> {
    if value.trim().is_empty() {
        Err(HostingError::InvalidInput(format!("empty {what}")))
    } else {
        Ok(())
    }
}

impl HostingService for GitHubClient {
    fn search<'a>(
        &'a self,
        query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<RepositorySummary>, HostingError>> {
        Box::pin(async move {
            require(query, "search query")?;
            if max_results == 0 {
                return Ok(Vec::new());
            }
            let url = format!("{}/search/repositories", self.api_url);
            let params = [
                ("q", query.to_string()),
                ("sort", "stars".to_string()),
                ("order", "desc".to_string()),
                ("per_page", max_results.min(100).to_string()),
            ];
            let body = self.get(&url, &params).await?;
            let parsed: GhSearch =
                serde_json::from_str(&body).map_err(|e| HostingError::Decode(e.to_string()))?;
            Ok(parsed
                .items
                .into_iter()
                .take(max_results)
                .map(RepositorySummary::from)
                .collect())
        })
    }

    fn get_repo<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RepositorySummary, HostingError>> {
        Box::pin(async move {
            require(owner, "owner")?;
            require(name, "repository name")?;
            let url = format!(
                "{}/repos/{}/{}",
                self.api_url,
                urlencoding::encode(owner),
                urlencoding::encode(name)
            );
            let body = self.get(&url, &[]).await?;
            let repo: GhRepo =
                serde_json::from_str(&body).map_err(|e| HostingError::Decode(e.to_string()))?;
            Ok(repo.into())
        })
    }

    fn get_contents<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<FileTreeNode>, HostingError>> {
        Box::pin(async move {
            require(owner, "owner")?;
            require(name, "repository name")?;
            let url = format!(
                "{}/repos/{}/{}/contents/{}",
                self.api_url,
                urlencoding::encode(owner),
                urlencoding::encode(name),
                encode_path(path)
            );
            let body = self.get(&url, &[]).await?;
            let entries: Vec<GhEntry> =
                serde_json::from_str(&body).map_err(|e| HostingError::Decode(e.to_string()))?;
            Ok(entries
                .into_iter()
                .filter_map(|e| {
                    let kind = match e.kind.as_str() {
                        "file" | "symlink" => NodeKind::File,
                        "dir" => NodeKind::Dir,
                        _ => return None,
                    };
                    Some(FileTreeNode {
                        name: e.name,
                        kind,
                        path: e.path,
                        size: e.size,
                    })
                })
                .collect())
        })
    }

    fn get_readme<'a>(&'a self, owner: &'a str, name: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let url = format!(
                "{}/repos/{}/{}/readme",
                self.api_url,
                urlencoding::encode(owner),
                urlencoding::encode(name)
            );
            let bytes = self.fetch_file(&url).await?;
            String::from_utf8(bytes).ok()
        })
    }

    fn get_file_text<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let url = format!(
                "{}/repos/{}/{}/contents/{}",
                self.api_url,
                urlencoding::encode(owner),
                urlencoding::encode(name),
                encode_path(path)
            );
            let bytes = self.fetch_file(&url).await?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        })
    }

    fn rate_limit_status(&self) -> BoxFuture<'_, Option<RateStatus>> {
        Box::pin(self.fetch_rate_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client(token: Option<&str>) -> GitHubClient {
        GitHubClient::new(
            reqwest::Client::new(),
            "https://api.github.com/",
            token.map(String::from),
            Duration::from_secs(10),
            BackoffPolicy::default(),
            HostingRateLimiter::shared(Duration::from_millis(1)),
        )
    }

    #[test]
    fn classify_statuses() {
        assert_eq!(classify_response(200, "{}"), ResponseClass::Ok);
        assert_eq!(classify_response(404, ""), ResponseClass::NotFound);
        assert_eq!(classify_response(429, ""), ResponseClass::RateLimited);
        assert_eq!(
            classify_response(403, "API rate limit exceeded"),
            ResponseClass::RateLimited
        );
        assert_eq!(classify_response(403, "forbidden"), ResponseClass::Failed);
        assert_eq!(classify_response(503, ""), ResponseClass::Transient);
        assert_eq!(classify_response(500, ""), ResponseClass::Failed);
    }

    #[tokio::test]
    async fn read_response_captures_retry_after() {
        let http_resp = http::Response::builder()
            .status(403)
            .header("retry-after", "30")
            .body("API rate limit exceeded")
            .unwrap();
        let fetched = read_response(reqwest::Response::from(http_resp)).await.unwrap();
        assert_eq!(fetched.status, 403);
        assert_eq!(fetched.retry_after, Some(Duration::from_secs(30)));
        assert_eq!(
            classify_response(fetched.status, &fetched.body),
            ResponseClass::RateLimited
        );
    }

    #[tokio::test]
    async fn read_response_without_header() {
        let http_resp = http::Response::builder().status(200).body("[]").unwrap();
        let fetched = read_response(reqwest::Response::from(http_resp)).await.unwrap();
        assert_eq!(fetched.retry_after, None);
        assert_eq!(fetched.body, "[]");
    }

    #[test]
    fn repo_json_maps_to_summary() {
        let json = r#"{
            "full_name": "acme/demo-net",
            "html_url": "https://github.com/acme/demo-net",
            "description": null,
            "stargazers_count": 120,
            "forks_count": 7,
            "language": "Python",
            "size": 2048,
            "pushed_at": "2024-03-01T10:00:00Z",
            "created_at": "2023-01-01T00:00:00Z",
            "archived": false,
            "topics": ["vision", "detection", "vision"],
            "license": {"key": "mit", "name": "MIT License"},
            "open_issues_count": 3
        }"#;
        let repo: GhRepo = serde_json::from_str(json).unwrap();
        let summary = RepositorySummary::from(repo);
        assert_eq!(summary.full_name, "acme/demo-net");
        assert_eq!(summary.description, "");
        assert_eq!(summary.stars, 120);
        assert_eq!(summary.size_kb, 2048);
        assert_eq!(summary.license.as_deref(), Some("MIT License"));
        assert_eq!(
            summary.topics.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["detection", "vision"]
        );
        assert_eq!(
            summary.pushed_at.map(|d| d.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn search_keeps_api_order() {
        let json = r#"{"total_count": 3, "items": [
            {"full_name": "a/one", "html_url": "https://github.com/a/one", "stargazers_count": 120},
            {"full_name": "b/two", "html_url": "https://github.com/b/two", "stargazers_count": 5},
            {"full_name": "c/three", "html_url": "https://github.com/c/three", "stargazers_count": 80}
        ]}"#;
        let parsed: GhSearch = serde_json::from_str(json).unwrap();
        let stars: Vec<u64> = parsed.items.iter().map(|r| r.stargazers_count).collect();
        assert_eq!(stars, vec![120, 5, 80]);
    }

    #[test]
    fn base64_with_line_wraps() {
        let decoded = decode_base64_content("aGVsbG8g\nd29ybGQ=\n").unwrap();
        assert_eq!(decoded, b"hello world");
        assert!(decode_base64_content("***").is_none());
    }

    #[test]
    fn readme_strict_file_lossy() {
        let bytes = vec![b'o', b'k', 0xff];
        assert!(String::from_utf8(bytes.clone()).is_err());
        assert_eq!(String::from_utf8_lossy(&bytes), "ok\u{fffd}");
    }

    #[test]
    fn placeholder_token_ignored() {
        assert!(!client(Some("your_github_token_here")).has_token());
        assert!(!client(Some("  ")).has_token());
        assert!(client(Some("ghp_abc")).has_token());
        assert!(!client(None).has_token());
    }

    #[test]
    fn api_url_trailing_slash_trimmed() {
        assert_eq!(client(None).api_url, "https://api.github.com");
    }

    #[test]
    fn path_segments_encoded() {
        assert_eq!(encode_path("src/my file.py"), "src/my%20file.py");
        assert_eq!(encode_path(""), "");
    }

    fn reply(status: u16, body: &str, retry_after_secs: Option<u64>) -> Fetched {
        Fetched {
            status,
            retry_after: retry_after_secs.map(Duration::from_secs),
            body: body.to_string(),
        }
    }

    /// Replays `replies` in order, counting attempts.
    fn scripted(
        replies: Vec<Fetched>,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<Fetched, HostingError>> {
        let mut replies = replies.into_iter();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(
                replies
                    .next()
                    .ok_or_else(|| HostingError::Transport("no reply left".into())),
            )
        }
    }

    const LIMITED: &str = r#"{"message":"API rate limit exceeded for 1.2.3.4"}"#;

    #[tokio::test(start_paused = true)]
    async fn rate_limited_reply_waits_then_succeeds() {
        let gh = client(None);
        let calls = Arc::new(AtomicU32::new(0));
        let send = scripted(
            vec![reply(403, LIMITED, Some(10)), reply(200, "{}", None)],
            calls.clone(),
        );

        let start = tokio::time::Instant::now();
        let body = gh.fetch_with_retry("https://api.github.com/x", send).await;
        assert_eq!(body, Ok("{}".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Retry-After plus the margin
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert_eq!(gh.limiter.current_factor(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhausting_attempts_is_unavailable() {
        let gh = client(None);
        let calls = Arc::new(AtomicU32::new(0));
        let send = scripted(
            (0..5).map(|_| reply(403, LIMITED, Some(1))).collect(),
            calls.clone(),
        );

        let result = gh.fetch_with_retry("https://api.github.com/x", send).await;
        assert!(matches!(result, Err(HostingError::Unavailable(msg)) if msg.contains("rate limit")));
        assert_eq!(calls.load(Ordering::SeqCst), BackoffPolicy::default().max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_error_retried_with_backoff() {
        let gh = client(None);
        let calls = Arc::new(AtomicU32::new(0));
        let send = scripted(
            vec![reply(502, "bad gateway", None), reply(200, "[]", None)],
            calls.clone(),
        );

        let start = tokio::time::Instant::now();
        let body = gh.fetch_with_retry("https://api.github.com/x", send).await;
        assert_eq!(body, Ok("[]".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= BackoffPolicy::default().base_delay);
        assert_eq!(gh.limiter.current_factor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_statuses_not_retried() {
        let gh = client(None);
        let calls = Arc::new(AtomicU32::new(0));
        let send = scripted(vec![reply(404, "", None)], calls.clone());
        let result = gh.fetch_with_retry("https://api.github.com/x", send).await;
        assert_eq!(result, Err(HostingError::NotFound));

        let send = scripted(vec![reply(401, "bad credentials", None)], calls.clone());
        let result = gh.fetch_with_retry("https://api.github.com/x", send).await;
        assert!(matches!(result, Err(HostingError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_inputs_rejected_without_request() {
        let gh = client(None);
        assert!(matches!(
            gh.get_repo("", "demo").await,
            Err(HostingError::InvalidInput(_))
        ));
        assert!(matches!(
            gh.search("   ", 10).await,
            Err(HostingError::InvalidInput(_))
        ));
        assert!(gh.search("demo", 0).await.unwrap().is_empty());
    }
}
