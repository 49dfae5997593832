//! In-memory hosting service for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{FileTreeNode, HostingError, HostingService, RepositorySummary};
use crate::BoxFuture;
use crate::rate_limit::RateStatus;

/// A hand-rolled [`HostingService`] backed by maps.
///
/// Unknown repositories answer [`HostingError::NotFound`]; unknown
/// directories answer whatever `missing_contents` is set to.
#[derive(Default)]
pub struct MockHosting {
    search_results: Vec<RepositorySummary>,
    search_error: Option<HostingError>,
    repos: HashMap<String, RepositorySummary>,
    repo_errors: HashMap<String, HostingError>,
    contents: HashMap<(String, String), Vec<FileTreeNode>>,
    missing_contents: Option<HostingError>,
    readmes: HashMap<String, String>,
    files: HashMap<(String, String), String>,
    rate_status: Option<RateStatus>,
    search_calls: AtomicUsize,
    repo_calls: AtomicUsize,
    contents_calls: AtomicUsize,
    file_calls: AtomicUsize,
}

fn key(owner: &str, name: &str) -> String {
    format!("{}/{}", owner.to_lowercase(), name.to_lowercase())
}

impl MockHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_results(mut self, results: Vec<RepositorySummary>) -> Self {
        self.search_results = results;
        self
    }

    pub fn with_search_error(mut self, error: HostingError) -> Self {
        self.search_error = Some(error);
        self
    }

    /// Register a repository under its `full_name`.
    pub fn with_repo(mut self, repo: RepositorySummary) -> Self {
        self.repos.insert(repo.full_name.to_lowercase(), repo);
        self
    }

    pub fn with_repo_error(mut self, full_name: &str, error: HostingError) -> Self {
        self.repo_errors.insert(full_name.to_lowercase(), error);
        self
    }

    /// Directory listing for `path` (`""` is the root).
    pub fn with_contents(mut self, full_name: &str, path: &str, nodes: Vec<FileTreeNode>) -> Self {
        self.contents
            .insert((full_name.to_lowercase(), path.to_string()), nodes);
        self
    }

    /// Error returned for directories without a registered listing.
    /// Defaults to an empty listing.
    pub fn with_missing_contents(mut self, error: HostingError) -> Self {
        self.missing_contents = Some(error);
        self
    }

    pub fn with_readme(mut self, full_name: &str, readme: &str) -> Self {
        self.readmes
            .insert(full_name.to_lowercase(), readme.to_string());
        self
    }

    pub fn with_file(mut self, full_name: &str, path: &str, text: &str) -> Self {
        self.files.insert(
            (full_name.to_lowercase(), path.to_string()),
            text.to_string(),
        );
        self
    }

    pub fn with_rate_status(mut self, status: RateStatus) -> Self {
        self.rate_status = Some(status);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn repo_calls(&self) -> usize {
        self.repo_calls.load(Ordering::SeqCst)
    }

    pub fn contents_calls(&self) -> usize {
        self.contents_calls.load(Ordering::SeqCst)
    }

    pub fn file_calls(&self) -> usize {
        self.file_calls.load(Ordering::SeqCst)
    }
}

impl HostingService for MockHosting {
    fn search<'a>(
        &'a self,
        _query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<RepositorySummary>, HostingError>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.search_error {
            Some(e) => Err(e.clone()),
            None => Ok(self
                .search_results
                .iter()
                .take(max_results)
                .cloned()
                .collect()),
        };
        Box::pin(async move { result })
    }

    fn get_repo<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RepositorySummary, HostingError>> {
        self.repo_calls.fetch_add(1, Ordering::SeqCst);
        let k = key(owner, name);
        let result = match self.repo_errors.get(&k) {
            Some(e) => Err(e.clone()),
            None => self.repos.get(&k).cloned().ok_or(HostingError::NotFound),
        };
        Box::pin(async move { result })
    }

    fn get_contents<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<FileTreeNode>, HostingError>> {
        self.contents_calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.contents.get(&(key(owner, name), path.to_string())) {
            Some(nodes) => Ok(nodes.clone()),
            None => match &self.missing_contents {
                Some(e) => Err(e.clone()),
                None => Ok(Vec::new()),
            },
        };
        Box::pin(async move { result })
    }

    fn get_readme<'a>(&'a self, owner: &'a str, name: &'a str) -> BoxFuture<'a, Option<String>> {
        self.file_calls.fetch_add(1, Ordering::SeqCst);
        let readme = self.readmes.get(&key(owner, name)).cloned();
        Box::pin(async move { readme })
    }

    fn get_file_text<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Option<String>> {
        self.file_calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .files
            .get(&(key(owner, name), path.to_string()))
            .cloned();
        Box::pin(async move { text })
    }

    fn rate_limit_status(&self) -> BoxFuture<'_, Option<RateStatus>> {
        let status = self.rate_status;
        Box::pin(async move { status })
    }
}
