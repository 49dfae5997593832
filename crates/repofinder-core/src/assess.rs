//! Two-stage repository quality assessment.
//!
//! Stage 1 applies cheap rules to the metadata and root listing; a rule hit
//! is final. Stage 2 walks the tree, samples key files and asks the model.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{ChatMessage, ModelGateway, complete_typed};
use crate::hosting::{FileTreeNode, HostingError, HostingService, RepositorySummary};
use crate::structure::{
    FileSample, StructureProfile, deep_profile, profile_root, sample_key_files, walk_tree,
};
use crate::{Config, PaperRecord, Verdict, repo_owner_name};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_repo_size_kb: u64,
    pub max_abandoned_years: i32,
    pub min_stars_for_old_repo: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_repo_size_kb: 10,
            max_abandoned_years: 3,
            min_stars_for_old_repo: 5,
        }
    }
}

/// Stage 1. The first matching rule is terminal.
pub fn rule_filter(
    repo: &RepositorySummary,
    structure: StructureProfile,
    thresholds: &Thresholds,
    current_year: i32,
) -> Verdict {
    if structure.code_file_count == 0 {
        return Verdict::rejected(0.0, "No code files found").with_structure(structure);
    }

    if repo.size_kb < thresholds.min_repo_size_kb && structure.code_file_count <= 1 {
        return Verdict::rejected(
            0.1,
            format!("Very tiny repo (size: {}KB) with almost no code", repo.size_kb),
        )
        .with_structure(structure);
    }

    if repo.archived {
        return Verdict::rejected(0.2, "Repository is archived").with_structure(structure);
    }

    if let Some(pushed) = repo.pushed_at {
        let years = current_year - pushed.year();
        if years > thresholds.max_abandoned_years && repo.stars < thresholds.min_stars_for_old_repo
        {
            return Verdict::rejected(
                0.2,
                format!(
                    "Abandoned repo (last push: {years} years ago, stars: {})",
                    repo.stars
                ),
            )
            .with_structure(structure);
        }
    }

    Verdict::inconclusive("Has code files and basic structure").with_structure(structure)
}

/// Model reply for the deep assessment.
#[derive(Debug, Deserialize)]
struct DeepReply {
    is_meaningful: bool,
    #[serde(default)]
    is_implementation_of_paper: Option<bool>,
    #[serde(default)]
    maintenance_score: Option<f64>,
    #[serde(default)]
    code_quality_score: Option<f64>,
    overall_score: f64,
    #[serde(default)]
    reasons: Vec<String>,
}

const DEEP_SYSTEM_PROMPT: &str = "You are a senior ML engineer. Evaluate if a GitHub repository \
is a meaningful, well-maintained implementation. Reply in JSON format.";

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}

fn deep_prompt(
    paper: &PaperRecord,
    repo: &RepositorySummary,
    structure: &StructureProfile,
    samples: &[FileSample],
    readme: Option<&str>,
    config: &Config,
) -> String {
    let mut tree = format!(
        "Root directory:\n  Code files ({}): {}\n  Directories ({}): {}\n",
        structure.code_file_count,
        structure
            .code_files
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
        structure.directory_count,
        structure
            .directories
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
    );

    if let Some(deep) = &structure.deep {
        let histogram = deep
            .extension_histogram
            .iter()
            .map(|(ext, n)| {
                let ext = if ext.is_empty() { "(none)" } else { ext };
                format!("{ext}: {n}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        tree.push_str(&format!(
            "\nFull tree (depth {}, {} files{}):\n  Extensions: {}\n  Standard directories: {}\n  Key files: {}\n",
            deep.max_depth_reached,
            deep.total_files,
            if deep.truncated { ", truncated" } else { "" },
            histogram,
            deep.canonical_dirs.present().join(", "),
            deep.key_files.join(", "),
        ));
    }

    let mut sampled = String::new();
    for sample in samples {
        sampled.push_str(&format!("\n--- {} ---\n{}\n", sample.path, sample.excerpt));
    }
    if sampled.is_empty() {
        sampled.push_str("No files sampled");
    }

    let readme_text = readme
        .map(|r| truncate_chars(r, config.traversal.readme_excerpt_chars))
        .unwrap_or_else(|| "No README found".to_string());
    let pushed = repo
        .pushed_at
        .map(|p| p.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        r#"Paper title: "{title}"
Year: {year}
Abstract: "{abstract_text}"

Repository: {url}

Basic stats:
- Stars: {stars}
- Forks: {forks}
- Last commit: {pushed}
- Main language: {language}
- Size: {size}KB
- Is archived: {archived}
- Code files: {code_files}
- Has typical structure: {typical}

{tree}
Sampled key files:
{sampled}

README (truncated):
{readme_text}

Evaluate this repository and reply in JSON format:
{{
  "is_meaningful": true/false,
  "is_implementation_of_paper": true/false,
  "maintenance_score": 0.0-1.0,
  "code_quality_score": 0.0-1.0,
  "overall_score": 0.0-1.0,
  "reasons": ["reason 1", "reason 2", ...]
}}"#,
        title = paper.title,
        year = paper.year,
        abstract_text = truncate_chars(&paper.abstract_text, 300),
        url = repo.url,
        stars = repo.stars,
        forks = repo.forks,
        language = repo.primary_language.as_deref().unwrap_or("unknown"),
        size = repo.size_kb,
        archived = repo.archived,
        code_files = structure.code_file_count,
        typical = structure.has_typical_impl_files || structure.has_typical_impl_dirs,
    )
}

/// Runs both stages against one hosting service and optional model.
pub struct Assessor<'a> {
    hosting: &'a dyn HostingService,
    gateway: Option<&'a dyn ModelGateway>,
    config: &'a Config,
}

impl<'a> Assessor<'a> {
    pub fn new(
        hosting: &'a dyn HostingService,
        gateway: Option<&'a dyn ModelGateway>,
        config: &'a Config,
    ) -> Self {
        Self {
            hosting,
            gateway,
            config,
        }
    }

    /// Stage 1 over a fetched repository. Also returns the root listing so
    /// Stage 2 does not list it twice.
    pub async fn stage_one(
        &self,
        repo: &RepositorySummary,
        owner: &str,
        name: &str,
        current_year: i32,
    ) -> (Verdict, Option<Vec<FileTreeNode>>) {
        match self.hosting.get_contents(owner, name, "").await {
            Ok(root) => {
                let profile = profile_root(&root, self.config);
                let verdict = rule_filter(repo, profile, &self.config.thresholds, current_year);
                (verdict, Some(root))
            }
            Err(e) => {
                tracing::warn!(repo = %repo.full_name, error = %e, "root listing unavailable");
                (Verdict::unknown("Cannot fetch repository contents"), None)
            }
        }
    }

    /// Stage 2. `stage_one` must be the inconclusive Stage 1 verdict.
    #[allow(clippy::too_many_arguments)]
    pub async fn deep_assessment(
        &self,
        gateway: &dyn ModelGateway,
        paper: &PaperRecord,
        repo: &RepositorySummary,
        owner: &str,
        name: &str,
        root: &[FileTreeNode],
        stage_one: Verdict,
    ) -> Verdict {
        let limits = &self.config.traversal;
        let (walked, truncated) = walk_tree(self.hosting, owner, name, root, limits).await;
        let deep = deep_profile(&walked, truncated, self.config);
        let samples = sample_key_files(self.hosting, owner, name, &deep.key_files, limits).await;
        let readme = self.hosting.get_readme(owner, name).await;

        let mut structure = stage_one.structure.clone().unwrap_or_default();
        structure.deep = Some(deep);

        tracing::debug!(
            repo = %repo.full_name,
            nodes = walked.len(),
            sampled = samples.len(),
            "deep assessment context gathered"
        );

        let prompt = deep_prompt(paper, repo, &structure, &samples, readme.as_deref(), self.config);
        let messages = vec![ChatMessage::system(DEEP_SYSTEM_PROMPT), ChatMessage::user(prompt)];

        match complete_typed::<DeepReply>(gateway, messages, 0.1).await {
            Ok(reply) => {
                let mut verdict = Verdict::judged(
                    reply.is_meaningful,
                    clamp_score(reply.overall_score),
                    stage_one.reason,
                )
                .with_structure(structure);
                verdict.reasons = reply.reasons;
                verdict.maintenance_score = reply.maintenance_score.map(clamp_score);
                verdict.code_quality_score = reply.code_quality_score.map(clamp_score);
                verdict.is_implementation = reply.is_implementation_of_paper;
                tracing::info!(
                    repo = %repo.full_name,
                    score = verdict.score,
                    meaningful = reply.is_meaningful,
                    "deep assessment done"
                );
                verdict
            }
            Err(e) => {
                tracing::warn!(repo = %repo.full_name, error = %e, "deep assessment failed");
                Verdict::unknown("LLM evaluation failed").with_structure(structure)
            }
        }
    }

    /// Full validation of one repository URL.
    pub async fn validate(&self, url: &str, paper: &PaperRecord) -> Verdict {
        let Some((owner, name)) = repo_owner_name(url) else {
            return Verdict::rejected(0.0, "Invalid repository URL");
        };

        let repo = match self.hosting.get_repo(&owner, &name).await {
            Ok(repo) => repo,
            Err(HostingError::NotFound | HostingError::InvalidInput(_)) => {
                return Verdict::rejected(0.0, "Repository not found or inaccessible");
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "repository metadata unavailable");
                return Verdict::unknown(format!("Hosting service unavailable: {e}"));
            }
        };

        let (stage_one, root) = self.stage_one(&repo, &owner, &name, Utc::now().year()).await;
        tracing::info!(repo = %repo.full_name, reason = %stage_one.reason, "rule assessment");

        if stage_one.confident {
            return stage_one;
        }
        match (self.gateway, root) {
            (Some(gateway), Some(root)) if self.config.use_llm => {
                self.deep_assessment(gateway, paper, &repo, &owner, &name, &root, stage_one)
                    .await
            }
            _ => stage_one,
        }
    }
}

/// Validate `url` for `paper`. Stage 2 runs only when a gateway is given and
/// `config.use_llm` is set.
pub async fn validate_repository(
    hosting: &dyn HostingService,
    gateway: Option<&dyn ModelGateway>,
    config: &Config,
    url: &str,
    paper: &PaperRecord,
) -> Verdict {
    Assessor::new(hosting, gateway, config).validate(url, paper).await
}
