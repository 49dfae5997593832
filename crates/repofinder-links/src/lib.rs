use serde::{Deserialize, Serialize};

pub mod config;
pub mod extract;
pub mod project_page;
pub mod repair;

pub use config::LinkConfig;
pub use extract::{
    UrlWindow, assemble_candidates, clean_url, extract_candidates, find_url_windows,
    has_code_keyword, is_hosting_url,
};
pub use project_page::{is_project_page, project_page_leads, scan_page_links};
pub use repair::repair_line_wraps;

/// Where a candidate URL was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    PdfText,
    HostingSearch,
}

/// A repository URL that may belong to a paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlCandidate {
    pub raw_url: String,
    /// Always `normalize_url(raw_url)`; compare candidates on this field only.
    pub normalized_url: String,
    /// Text surrounding the URL where it was found (or a description for
    /// search results).
    pub source_context: String,
    pub origin: CandidateOrigin,
}

impl UrlCandidate {
    pub fn new(
        raw_url: impl Into<String>,
        source_context: impl Into<String>,
        origin: CandidateOrigin,
    ) -> Self {
        let raw_url = raw_url.into();
        Self {
            normalized_url: normalize_url(&raw_url),
            raw_url,
            source_context: source_context.into(),
            origin,
        }
    }
}

/// Normalize a repository URL for comparison.
///
/// Trims whitespace, then strips trailing slashes and `.git` suffixes until
/// neither remains, so `normalize_url(normalize_url(u)) == normalize_url(u)`.
pub fn normalize_url(url: &str) -> String {
    let mut current = url.trim();
    loop {
        let stripped = current.trim_end_matches('/');
        let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);
        if stripped.len() == current.len() {
            return current.to_string();
        }
        current = stripped;
    }
}

/// Split a repository URL into `(owner, name)`.
///
/// Uses the first two non-empty path segments; a trailing `.git` is dropped
/// from the name. Returns `None` for unparseable URLs or paths shorter than
/// two segments.
pub fn repo_owner_name(url: &str) -> Option<(String, String)> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let name = segments.next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slash_and_git() {
        assert_eq!(
            normalize_url("https://github.com/acme/demo-net.git/"),
            "https://github.com/acme/demo-net"
        );
        assert_eq!(
            normalize_url("  https://github.com/acme/demo-net//  "),
            "https://github.com/acme/demo-net"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for url in [
            "https://github.com/acme/demo-net",
            "https://github.com/acme/demo-net/",
            "https://github.com/acme/demo-net.git",
            "https://github.com/acme/demo-net/.git",
            "https://github.com/acme/demo.git.git/",
            "https://gitlab.com/group/sub/project.git/ ",
            "",
            "/",
        ] {
            let once = normalize_url(url);
            assert_eq!(normalize_url(&once), once, "not idempotent for {url:?}");
        }
    }

    #[test]
    fn candidate_normalizes_on_construction() {
        let c = UrlCandidate::new(
            "https://github.com/acme/demo-net/",
            "code at",
            CandidateOrigin::PdfText,
        );
        assert_eq!(c.normalized_url, "https://github.com/acme/demo-net");
        assert_eq!(c.raw_url, "https://github.com/acme/demo-net/");
    }

    #[test]
    fn owner_name_from_url() {
        assert_eq!(
            repo_owner_name("https://github.com/acme/demo-net.git"),
            Some(("acme".into(), "demo-net".into()))
        );
        assert_eq!(
            repo_owner_name("https://github.com/acme/demo-net/tree/main/src"),
            Some(("acme".into(), "demo-net".into()))
        );
        assert_eq!(repo_owner_name("https://github.com/acme"), None);
        assert_eq!(repo_owner_name("not a url"), None);
    }

    #[test]
    fn origin_serializes_snake_case() {
        let json = serde_json::to_string(&CandidateOrigin::HostingSearch).unwrap();
        assert_eq!(json, "\"hosting_search\"");
    }
}
