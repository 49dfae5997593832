use serde::{Deserialize, Serialize};

/// Code-hosting domains whose URLs are accepted as repository candidates.
pub const DEFAULT_HOSTING_DOMAINS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "gitee.com",
    "gitcode.com",
];

/// Words near a URL that suggest it points at the paper's code.
pub const DEFAULT_CODE_KEYWORDS: &[&str] = &[
    "code",
    "github",
    "gitlab",
    "implementation",
    "source code",
    "project page",
    "repository",
];

/// Domains that never host code, even when their paths look like project pages.
pub const DEFAULT_NON_CODE_DOMAINS: &[&str] = &[
    "arxiv.org",
    "doi.org",
    "dx.doi.org",
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "openaccess.thecvf.com",
    "openreview.net",
    "ieeexplore.ieee.org",
    "dl.acm.org",
    "springer.com",
    "creativecommons.org",
];

/// Path fragments that mark a project page.
pub const DEFAULT_PROJECT_PATH_HINTS: &[&str] = &["project", "page", "demo", "site"];

/// Tunables for URL extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub hosting_domains: Vec<String>,
    pub code_keywords: Vec<String>,
    pub non_code_domains: Vec<String>,
    pub project_path_hints: Vec<String>,
    /// Characters of context kept on each side of a URL.
    pub context_radius: usize,
    /// Maximum number of project pages fetched when no direct link exists.
    pub max_project_pages: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        fn owned(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            hosting_domains: owned(DEFAULT_HOSTING_DOMAINS),
            code_keywords: owned(DEFAULT_CODE_KEYWORDS),
            non_code_domains: owned(DEFAULT_NON_CODE_DOMAINS),
            project_path_hints: owned(DEFAULT_PROJECT_PATH_HINTS),
            context_radius: 50,
            max_project_pages: 3,
        }
    }
}
