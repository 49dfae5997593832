//! Per-paper orchestration: document links, then hosting search, then
//! quality assessment.

use std::sync::Arc;

use crate::assess::Assessor;
use crate::disambiguate::{select, select_from_search};
use crate::extract::{PageFetcher, UrlExtractor};
use crate::gateway::{ModelGateway, OpenAiCompatibleGateway};
use crate::hosting::{GitHubClient, HostingService, build_search_query};
use crate::{
    Config, CoreError, ExtractionSource, HostingRateLimiter, Meaningful, PaperRecord,
    ProgressEvent, QualityRecord, RepoType, RepoVerdictRecord, Verdict, build_http_client,
};

/// Per-run switches, usually from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub use_llm: bool,
    pub skip_pdf: bool,
    pub skip_validation: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            use_llm: true,
            skip_pdf: false,
            skip_validation: false,
        }
    }
}

/// Everything needed to process papers. Shared by workers through `Arc`.
pub struct Pipeline {
    config: Config,
    options: ProcessOptions,
    hosting: Arc<dyn HostingService>,
    gateway: Option<Arc<dyn ModelGateway>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
}

impl Pipeline {
    /// `gateway` is ignored when either `options.use_llm` or
    /// `config.use_llm` is off.
    pub fn new(
        config: Config,
        options: ProcessOptions,
        hosting: Arc<dyn HostingService>,
        gateway: Option<Arc<dyn ModelGateway>>,
    ) -> Self {
        let gateway = gateway.filter(|_| options.use_llm && config.use_llm);
        Self {
            config,
            options,
            hosting,
            gateway,
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Build the production stack: one HTTP client, one shared rate limiter,
    /// the GitHub client and (when enabled) the chat-completion gateway.
    pub fn from_config(config: Config, options: ProcessOptions) -> Result<Self, CoreError> {
        let client = build_http_client()?;
        let limiter = HostingRateLimiter::shared(config.rate_limit_period());
        let hosting: Arc<dyn HostingService> =
            Arc::new(GitHubClient::from_config(client.clone(), &config, limiter));
        let gateway: Option<Arc<dyn ModelGateway>> = if options.use_llm && config.use_llm {
            Some(Arc::new(OpenAiCompatibleGateway::new(
                client.clone(),
                config.llm.clone(),
            )?))
        } else {
            None
        };
        let fetcher: Arc<dyn PageFetcher> = Arc::new(client);
        Ok(Self::new(config, options, hosting, gateway).with_fetcher(fetcher))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> ProcessOptions {
        self.options
    }

    pub fn hosting(&self) -> &dyn HostingService {
        self.hosting.as_ref()
    }

    pub fn gateway(&self) -> Option<&dyn ModelGateway> {
        self.gateway.as_deref()
    }

    /// Process one paper.
    ///
    /// An `existing` record that has a selected repository but no score is
    /// only re-validated. Every failure below this point is absorbed into
    /// the record; this never fails.
    pub async fn process_paper(
        &self,
        paper: &PaperRecord,
        existing: Option<&RepoVerdictRecord>,
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> RepoVerdictRecord {
        if let Some(existing) = existing
            && existing.needs_validation()
            && !self.options.skip_validation
        {
            tracing::info!(title = %paper.title, "re-validating existing selection");
            let mut record = existing.clone();
            self.validate_into(&mut record, paper, progress).await;
            record.processed_at = Some(now_timestamp());
            return record;
        }

        let mut record = RepoVerdictRecord::default();

        if !self.options.skip_pdf {
            self.discover_in_document(&mut record, paper, progress).await;
        }
        if record.selected_repo_url.is_none() {
            self.discover_by_search(&mut record, paper, progress).await;
        }
        if record.selected_repo_url.is_none() {
            record.repo_type = Some(RepoType::NoneFound);
            progress(ProgressEvent::NothingFound);
        } else if !self.options.skip_validation {
            self.validate_into(&mut record, paper, progress).await;
        }

        record.processed_at = Some(now_timestamp());
        record
    }

    async fn discover_in_document(
        &self,
        record: &mut RepoVerdictRecord,
        paper: &PaperRecord,
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) {
        let Some(text) = paper.document_text.as_deref() else {
            tracing::debug!(title = %paper.title, "no document text");
            return;
        };

        let mut extractor = UrlExtractor::new(&self.config.links);
        if self.config.llm_extraction
            && let Some(gateway) = self.gateway()
        {
            extractor = extractor.with_gateway(gateway);
        }
        if let Some(fetcher) = &self.fetcher {
            extractor = extractor.with_fetcher(fetcher.as_ref());
        }
        let candidates = extractor.extract(text).await;
        progress(ProgressEvent::CandidatesFound {
            source: ExtractionSource::Pdf,
            count: candidates.len(),
        });

        let selection = select(self.gateway(), paper, &candidates).await;
        if let Some(chosen) = selection.candidate {
            let url = chosen.normalized_url;
            tracing::info!(title = %paper.title, %url, "official repository found in document");
            record.official_repo_url = Some(url.clone());
            record.selected_repo_url = Some(url.clone());
            record.repo_type = Some(RepoType::Official);
            record.extraction_source = Some(ExtractionSource::Pdf);
            record.low_confidence = selection.low_confidence;
            progress(ProgressEvent::Selected {
                url,
                source: ExtractionSource::Pdf,
                reason: selection.reason,
                low_confidence: selection.low_confidence,
            });
        }
    }

    async fn discover_by_search(
        &self,
        record: &mut RepoVerdictRecord,
        paper: &PaperRecord,
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) {
        if paper.title.trim().is_empty() {
            tracing::warn!("paper has no title, skipping search");
            return;
        }
        let query = build_search_query(&paper.title);
        let repos = match self
            .hosting
            .search(&query, self.config.search_max_results)
            .await
        {
            Ok(repos) => repos,
            Err(e) => {
                tracing::warn!(title = %paper.title, error = %e, "repository search failed");
                return;
            }
        };
        progress(ProgressEvent::CandidatesFound {
            source: ExtractionSource::GithubSearch,
            count: repos.len(),
        });

        let outcome = select_from_search(self.gateway(), paper, &repos).await;
        if let Some(chosen) = outcome.selection.candidate {
            let url = chosen.normalized_url;
            tracing::info!(title = %paper.title, %url, "unofficial implementation found");
            record.unofficial_repo_urls = outcome.kept_urls;
            record.selected_repo_url = Some(url.clone());
            record.repo_type = Some(RepoType::Unofficial);
            record.extraction_source = Some(ExtractionSource::GithubSearch);
            record.low_confidence = outcome.selection.low_confidence;
            progress(ProgressEvent::Selected {
                url,
                source: ExtractionSource::GithubSearch,
                reason: outcome.selection.reason,
                low_confidence: outcome.selection.low_confidence,
            });
        }
    }

    /// Assess the selected repository and record the verdict. Anything but
    /// a meaningful verdict clears the selection.
    async fn validate_into(
        &self,
        record: &mut RepoVerdictRecord,
        paper: &PaperRecord,
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) {
        let Some(url) = record.selected_repo_url.clone() else {
            return;
        };
        let verdict: Verdict = Assessor::new(self.hosting.as_ref(), self.gateway(), &self.config)
            .validate(&url, paper)
            .await;
        record.quality = QualityRecord::from(&verdict);

        if verdict.is_meaningful != Meaningful::Yes {
            tracing::info!(%url, reason = %verdict.reason, "repository not meaningful");
            record.selected_repo_url = None;
            record.repo_type = Some(RepoType::NoneMeaningful);
        }
        progress(ProgressEvent::Assessed {
            url,
            verdict: Box::new(verdict),
        });
    }
}

/// Local time in ISO 8601 with microseconds, e.g. `2026-01-05T10:11:12.000123`.
pub fn now_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::hosting::mock::MockHosting;
    use crate::hosting::{FileTreeNode, RepositorySummary};

    fn paper(text: Option<&str>) -> PaperRecord {
        PaperRecord {
            title: "Demo Net".into(),
            abstract_text: "We propose DemoNet.".into(),
            year: 2024,
            venue: "CVPR".into(),
            document_text: text.map(str::to_string),
        }
    }

    fn repo(full_name: &str, stars: u64) -> RepositorySummary {
        RepositorySummary {
            full_name: full_name.into(),
            url: format!("https://github.com/{full_name}"),
            stars,
            size_kb: 2000,
            pushed_at: Some(chrono::Utc::now()),
            ..Default::default()
        }
    }

    fn no_llm() -> ProcessOptions {
        ProcessOptions {
            use_llm: false,
            ..Default::default()
        }
    }

    fn silent(_: ProgressEvent) {}

    #[tokio::test]
    async fn document_link_becomes_official() {
        let hosting = MockHosting::new()
            .with_repo(repo("acme/demo-net", 50))
            .with_contents("acme/demo-net", "", vec![
                FileTreeNode::file("train.py", 100),
                FileTreeNode::file("model.py", 100),
            ]);
        let pipeline = Pipeline::new(Config::default(), no_llm(), Arc::new(hosting), None);
        let record = pipeline
            .process_paper(
                &paper(Some("Code: https://github.com/acme/demo-net.git")),
                None,
                &silent,
            )
            .await;
        assert_eq!(
            record.official_repo_url.as_deref(),
            Some("https://github.com/acme/demo-net")
        );
        assert_eq!(record.selected_repo_url, record.official_repo_url);
        assert_eq!(record.repo_type, Some(RepoType::Official));
        assert_eq!(record.extraction_source, Some(ExtractionSource::Pdf));
        assert_eq!(record.quality.is_meaningful, Meaningful::Yes);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn nothing_anywhere_is_none_found() {
        let hosting = Arc::new(MockHosting::new());
        let pipeline = Pipeline::new(Config::default(), no_llm(), hosting.clone(), None);
        let events = Mutex::new(Vec::new());
        let record = pipeline
            .process_paper(&paper(None), None, &|e| {
                events.lock().unwrap().push(format!("{e:?}"))
            })
            .await;
        assert_eq!(record.repo_type, Some(RepoType::NoneFound));
        assert!(record.selected_repo_url.is_none());
        assert_eq!(record.quality.is_meaningful, Meaningful::Unknown);
        assert_eq!(hosting.search_calls(), 1);
        assert!(events.lock().unwrap().iter().any(|e| e == "NothingFound"));
    }

    #[tokio::test]
    async fn skip_validation_keeps_selection_unscored() {
        let hosting = Arc::new(MockHosting::new().with_search_results(vec![repo("x/demo", 3)]));
        let options = ProcessOptions {
            use_llm: false,
            skip_pdf: true,
            skip_validation: true,
        };
        let pipeline = Pipeline::new(Config::default(), options, hosting.clone(), None);
        let record = pipeline.process_paper(&paper(None), None, &silent).await;
        assert_eq!(record.repo_type, Some(RepoType::Unofficial));
        assert_eq!(record.selected_repo_url.as_deref(), Some("https://github.com/x/demo"));
        assert!(record.low_confidence);
        assert!(record.needs_validation());
        assert_eq!(hosting.repo_calls(), 0);
    }

    #[tokio::test]
    async fn unscored_record_is_only_revalidated() {
        let hosting = Arc::new(
            MockHosting::new()
                .with_repo(repo("x/demo", 3))
                .with_contents("x/demo", "", vec![FileTreeNode::file("README.md", 10)]),
        );
        let existing = RepoVerdictRecord {
            unofficial_repo_urls: vec!["https://github.com/x/demo".into()],
            selected_repo_url: Some("https://github.com/x/demo".into()),
            repo_type: Some(RepoType::Unofficial),
            extraction_source: Some(ExtractionSource::GithubSearch),
            processed_at: Some("2025-01-01T00:00:00.000000".into()),
            ..Default::default()
        };
        let pipeline = Pipeline::new(Config::default(), no_llm(), hosting.clone(), None);
        let record = pipeline
            .process_paper(&paper(None), Some(&existing), &silent)
            .await;
        assert_eq!(hosting.search_calls(), 0);
        assert_eq!(record.quality.score, Some(0.0));
        assert_eq!(record.quality.reason.as_deref(), Some("No code files found"));
        assert_eq!(record.repo_type, Some(RepoType::NoneMeaningful));
        assert!(record.selected_repo_url.is_none());
        assert_eq!(record.unofficial_repo_urls, existing.unofficial_repo_urls);
        assert_ne!(record.processed_at, existing.processed_at);
    }

    #[tokio::test]
    async fn model_disabled_in_config_drops_gateway() {
        let gateway: Arc<dyn ModelGateway> = Arc::new(MockGateway::json(json!({})));
        let config = Config {
            use_llm: false,
            ..Default::default()
        };
        let pipeline = Pipeline::new(
            config,
            ProcessOptions::default(),
            Arc::new(MockHosting::new()),
            Some(gateway),
        );
        assert!(pipeline.gateway().is_none());
    }

    #[test]
    fn timestamp_has_microseconds() {
        let ts = now_timestamp();
        let (_, frac) = ts.rsplit_once('.').unwrap();
        assert_eq!(frac.len(), 6);
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }
}
