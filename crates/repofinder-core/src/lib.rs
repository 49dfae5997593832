use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod assess;
pub mod backend;
pub mod backoff;
pub mod config_file;
pub mod disambiguate;
pub mod extract;
pub mod gateway;
pub mod hosting;
pub mod pipeline;
pub mod rate_limit;
pub mod structure;

pub use assess::{Thresholds, rule_filter, validate_repository};
pub use backend::{BackendError, PdfBackend};
pub use backoff::BackoffPolicy;
pub use disambiguate::Selection;
pub use extract::UrlExtractor;
pub use gateway::openai::LlmConfig;
pub use gateway::{GatewayError, ModelGateway, Provider};
pub use hosting::{FileTreeNode, HostingError, HostingService, RepositorySummary};
pub use pipeline::{Pipeline, ProcessOptions};
pub use rate_limit::{HostingRateLimiter, RateStatus};
pub use repofinder_links::{
    CandidateOrigin, LinkConfig, UrlCandidate, normalize_url, repo_owner_name,
};
pub use structure::{StructureProfile, TraversalLimits};

/// Boxed, sendable future returned by the dyn-compatible service traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("hosting service error: {0}")]
    Hosting(#[from] HostingError),
    #[error("configuration error: {0}")]
    Config(String),
}

fn year_from_json<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Year {
        Number(i64),
        Text(String),
    }
    Ok(match Option::<Year>::deserialize(d)? {
        Some(Year::Number(n)) => i32::try_from(n).unwrap_or(0),
        Some(Year::Text(s)) => s.trim().parse().unwrap_or(0),
        None => 0,
    })
}

/// A paper to find code for. Deserializes from `paper_data.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default, deserialize_with = "year_from_json")]
    pub year: i32,
    #[serde(default, rename = "conference", alias = "venue")]
    pub venue: String,
    /// Full text of the paper, when available.
    #[serde(skip)]
    pub document_text: Option<String>,
}

/// Tri-state answer to "is this repository meaningful?".
///
/// Serialized as JSON `true` / `false` / `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Meaningful {
    Yes,
    No,
    #[default]
    Unknown,
}

impl From<Option<bool>> for Meaningful {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Meaningful::Yes,
            Some(false) => Meaningful::No,
            None => Meaningful::Unknown,
        }
    }
}

impl From<Meaningful> for Option<bool> {
    fn from(value: Meaningful) -> Self {
        match value {
            Meaningful::Yes => Some(true),
            Meaningful::No => Some(false),
            Meaningful::Unknown => None,
        }
    }
}

impl From<bool> for Meaningful {
    fn from(value: bool) -> Self {
        Some(value).into()
    }
}

/// Assessment of one repository.
///
/// A confident verdict is final; `confident` implies `is_meaningful` is not
/// [`Meaningful::Unknown`]. Construct through the helper constructors to keep
/// that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_meaningful: Meaningful,
    pub confident: bool,
    pub score: Option<f64>,
    pub reason: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StructureProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_implementation: Option<bool>,
}

impl Verdict {
    fn base(is_meaningful: Meaningful, confident: bool, score: Option<f64>, reason: String) -> Self {
        Self {
            is_meaningful,
            confident,
            score,
            reason,
            reasons: Vec::new(),
            structure: None,
            maintenance_score: None,
            code_quality_score: None,
            is_implementation: None,
        }
    }

    /// Confidently not meaningful.
    pub fn rejected(score: f64, reason: impl Into<String>) -> Self {
        Self::base(Meaningful::No, true, Some(score), reason.into())
    }

    /// Passed the rules; needs a deeper look to be final.
    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self::base(Meaningful::Yes, false, None, reason.into())
    }

    /// Could not be determined.
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::base(Meaningful::Unknown, false, None, reason.into())
    }

    /// Final verdict from a model judgement.
    pub fn judged(is_meaningful: bool, score: f64, reason: impl Into<String>) -> Self {
        Self::base(is_meaningful.into(), true, Some(score), reason.into())
    }

    pub fn with_structure(mut self, structure: StructureProfile) -> Self {
        self.structure = Some(structure);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Official,
    Unofficial,
    NoneFound,
    NoneMeaningful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Pdf,
    GithubSearch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub is_meaningful: Meaningful,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl From<&Verdict> for QualityRecord {
    fn from(v: &Verdict) -> Self {
        Self {
            score: v.score,
            is_meaningful: v.is_meaningful,
            reason: Some(v.reason.clone()),
            reasons: v.reasons.clone(),
        }
    }
}

/// Outcome for one paper, persisted as `github_links.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoVerdictRecord {
    #[serde(default)]
    pub official_repo_url: Option<String>,
    #[serde(default)]
    pub unofficial_repo_urls: Vec<String>,
    #[serde(default)]
    pub selected_repo_url: Option<String>,
    #[serde(default)]
    pub repo_type: Option<RepoType>,
    #[serde(default)]
    pub quality: QualityRecord,
    #[serde(default)]
    pub extraction_source: Option<ExtractionSource>,
    /// Set when the selection fell back to the first candidate without a
    /// model decision.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub low_confidence: bool,
    #[serde(default)]
    pub processed_at: Option<String>,
}

impl RepoVerdictRecord {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Has a selected repository but no quality score yet.
    pub fn needs_validation(&self) -> bool {
        self.selected_repo_url.is_some() && self.quality.score.is_none()
    }
}

/// Progress events emitted while processing a paper.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    CandidatesFound {
        source: ExtractionSource,
        count: usize,
    },
    Selected {
        url: String,
        source: ExtractionSource,
        reason: String,
        low_confidence: bool,
    },
    NothingFound,
    Assessed {
        url: String,
        verdict: Box<Verdict>,
    },
}

/// Runtime configuration for the whole pipeline.
#[derive(Clone)]
pub struct Config {
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub hosting_timeout_secs: u64,
    pub hosting_max_attempts: u32,
    /// Minimum spacing between hosting requests, shared by all workers.
    pub rate_limit_delay_ms: u64,
    pub search_max_results: usize,
    pub llm: LlmConfig,
    /// Master switch for every model call.
    pub use_llm: bool,
    /// Use the model to find exact URL boundaries in document text.
    pub llm_extraction: bool,
    pub links: LinkConfig,
    pub code_extensions: Vec<String>,
    pub typical_impl_files: Vec<String>,
    pub typical_impl_dirs: Vec<String>,
    pub key_file_keywords: Vec<String>,
    pub thresholds: Thresholds,
    pub traversal: TraversalLimits,
    pub num_workers: usize,
    /// Pages of a PDF read for link extraction.
    pub pdf_max_pages: usize,
}

pub const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    ".py", ".cu", ".cpp", ".cc", ".c", ".h", ".hpp", ".java", ".js", ".ts", ".go", ".rs", ".m",
    ".mm", ".ipynb", ".sh", ".yaml", ".yml",
];

pub const DEFAULT_TYPICAL_IMPL_FILES: &[&str] = &[
    "train.py",
    "main.py",
    "model.py",
    "models.py",
    "network.py",
    "dataset.py",
    "inference.py",
    "test.py",
    "eval.py",
    "run.py",
];

pub const DEFAULT_TYPICAL_IMPL_DIRS: &[&str] = &[
    "models",
    "src",
    "lib",
    "scripts",
    "configs",
    "train",
    "test",
    "inference",
    "utils",
];

/// Filename fragments marking a "key" implementation file, in priority order.
pub const DEFAULT_KEY_FILE_KEYWORDS: &[&str] = &[
    "train", "model", "network", "net", "main", "run", "inference", "eval", "test", "dataset",
    "loss",
];

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: None,
            github_api_url: hosting::github::DEFAULT_API_URL.to_string(),
            hosting_timeout_secs: 10,
            hosting_max_attempts: 3,
            rate_limit_delay_ms: 1000,
            search_max_results: 10,
            llm: LlmConfig::default(),
            use_llm: true,
            llm_extraction: true,
            links: LinkConfig::default(),
            code_extensions: owned(DEFAULT_CODE_EXTENSIONS),
            typical_impl_files: owned(DEFAULT_TYPICAL_IMPL_FILES),
            typical_impl_dirs: owned(DEFAULT_TYPICAL_IMPL_DIRS),
            key_file_keywords: owned(DEFAULT_KEY_FILE_KEYWORDS),
            thresholds: Thresholds::default(),
            traversal: TraversalLimits::default(),
            num_workers: 1,
            pdf_max_pages: 5,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("github_token", &self.github_token.as_ref().map(|_| "***"))
            .field("github_api_url", &self.github_api_url)
            .field("hosting_timeout_secs", &self.hosting_timeout_secs)
            .field("hosting_max_attempts", &self.hosting_max_attempts)
            .field("rate_limit_delay_ms", &self.rate_limit_delay_ms)
            .field("search_max_results", &self.search_max_results)
            .field("llm", &self.llm)
            .field("use_llm", &self.use_llm)
            .field("llm_extraction", &self.llm_extraction)
            .field("links", &self.links)
            .field("code_extensions", &self.code_extensions)
            .field("typical_impl_files", &self.typical_impl_files)
            .field("typical_impl_dirs", &self.typical_impl_dirs)
            .field("key_file_keywords", &self.key_file_keywords)
            .field("thresholds", &self.thresholds)
            .field("traversal", &self.traversal)
            .field("num_workers", &self.num_workers)
            .field("pdf_max_pages", &self.pdf_max_pages)
            .finish()
    }
}

impl Config {
    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms.max(1))
    }
}

/// HTTP client shared by the gateway, the hosting client and page fetches.
pub fn build_http_client() -> Result<reqwest::Client, CoreError> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("repofinder/", env!("CARGO_PKG_VERSION")))
        .build()?)
}
