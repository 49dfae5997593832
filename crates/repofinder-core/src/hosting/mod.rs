//! Code-hosting service access: search, repository metadata and contents.

pub mod github;
pub mod mock;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;
use crate::rate_limit::RateStatus;

pub use github::GitHubClient;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostingError {
    #[error("repository not found")]
    NotFound,
    #[error("rate limited by hosting service")]
    RateLimited,
    /// Retries exhausted, or the service answered with an unusable status.
    #[error("hosting service unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode hosting response: {0}")]
    Decode(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Repository metadata, fetched fresh on every call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub full_name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub stars: u64,
    pub forks: u64,
    pub primary_language: Option<String>,
    pub size_kb: u64,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub archived: bool,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub license: Option<String>,
    pub open_issues: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeNode {
    pub name: String,
    pub kind: NodeKind,
    pub path: String,
    pub size: u64,
}

impl FileTreeNode {
    pub fn file(path: &str, size: u64) -> Self {
        Self::new(path, NodeKind::File, size)
    }

    pub fn dir(path: &str) -> Self {
        Self::new(path, NodeKind::Dir, 0)
    }

    fn new(path: &str, kind: NodeKind, size: u64) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Self {
            name,
            kind,
            path: path.to_string(),
            size,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// A GitHub-style hosting API.
///
/// All methods absorb transient failures up to the client's retry bound;
/// what remains is reported through [`HostingError`].
pub trait HostingService: Send + Sync {
    /// Top `max_results` repositories for `query`, in the service's order.
    fn search<'a>(
        &'a self,
        query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<RepositorySummary>, HostingError>>;

    fn get_repo<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RepositorySummary, HostingError>>;

    /// Entries of one directory (`""` for the root).
    fn get_contents<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<FileTreeNode>, HostingError>>;

    /// README text, strictly UTF-8. `None` when absent or undecodable.
    fn get_readme<'a>(&'a self, owner: &'a str, name: &'a str) -> BoxFuture<'a, Option<String>>;

    /// File text, decoded lossily. `None` when unavailable.
    fn get_file_text<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Option<String>>;

    /// Remaining request budget, when the service reports one.
    fn rate_limit_status(&self) -> BoxFuture<'_, Option<RateStatus>>;
}

/// Search query for a paper title: the quoted title restricted to name,
/// description and README matches.
pub fn build_search_query(title: &str) -> String {
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    let title = title.replace('"', "");
    format!("\"{title}\" in:name,description,readme")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_query_quotes_title() {
        assert_eq!(
            build_search_query("Demo Net:  Fast\nThings"),
            "\"Demo Net: Fast Things\" in:name,description,readme"
        );
        assert_eq!(
            build_search_query("The \"Best\" Model"),
            "\"The Best Model\" in:name,description,readme"
        );
    }

    #[test]
    fn node_name_from_path() {
        let node = FileTreeNode::file("src/models/net.py", 120);
        assert_eq!(node.name, "net.py");
        assert!(!node.is_dir());
        assert_eq!(FileTreeNode::dir("src").name, "src");
    }
}
