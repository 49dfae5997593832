//! Choosing one repository among several candidates.

use serde::Deserialize;

use crate::gateway::{ChatMessage, GatewayError, ModelGateway, complete_typed};
use crate::hosting::RepositorySummary;
use crate::{CandidateOrigin, PaperRecord, UrlCandidate, normalize_url};

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidate: Option<UrlCandidate>,
    pub reason: String,
    /// The first candidate was taken without a model decision.
    pub low_confidence: bool,
    pub used_model: bool,
}

impl Selection {
    fn none(reason: impl Into<String>, used_model: bool) -> Self {
        Self {
            candidate: None,
            reason: reason.into(),
            low_confidence: false,
            used_model,
        }
    }

    fn fallback(candidate: UrlCandidate, reason: impl Into<String>) -> Self {
        Self {
            candidate: Some(candidate),
            reason: reason.into(),
            low_confidence: true,
            used_model: false,
        }
    }
}

/// `selected` may be a URL, a 1-based index, or null.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Pick {
    Index(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct SelectReply {
    #[serde(alias = "selected_url")]
    selected: Option<Pick>,
    #[serde(default)]
    reason: String,
}

const SELECT_SYSTEM_PROMPT: &str = "You are a tool that picks the most likely official code \
repository for a research paper. Reply in JSON format.";

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn select_prompt(paper: &PaperRecord, candidates: &[UrlCandidate]) -> String {
    let listed = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let context = c.source_context.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{}. {}\n   Context: \"{}\"", i + 1, c.raw_url, context)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Paper title: "{title}"
Venue: {venue} {year}
Abstract: "{abstract_text}..."

Candidate repository URLs:
{listed}

Which one is MOST likely the official implementation of the paper?
Answer with the URL or its number, or null if none of them is.
Reply in JSON format:
{{
  "selected": "<url, number or null>",
  "reason": "brief explanation"
}}"#,
        title = paper.title,
        venue = paper.venue,
        year = paper.year,
        abstract_text = truncate_chars(&paper.abstract_text, 500),
    )
}

/// Resolve the model's answer against the listed candidates.
fn resolve_pick(pick: Option<Pick>, candidates: &[UrlCandidate]) -> Option<&UrlCandidate> {
    match pick? {
        Pick::Index(i) => {
            let i = usize::try_from(i).ok()?;
            candidates.get(i.checked_sub(1)?)
        }
        Pick::Text(text) => {
            let text = text.trim();
            if text.is_empty() || text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("null")
            {
                return None;
            }
            if let Ok(i) = text.parse::<usize>() {
                return candidates.get(i.checked_sub(1)?);
            }
            let wanted = normalize_url(text).to_lowercase();
            candidates
                .iter()
                .find(|c| c.normalized_url.to_lowercase() == wanted)
        }
    }
}

/// Pick one candidate for `paper`.
///
/// Zero or one candidate never reaches the model. With several, the model
/// decides; an explicit "none" is honoured. Without a model, or when the
/// call fails, the first candidate is taken and flagged low-confidence.
pub async fn select(
    gateway: Option<&dyn ModelGateway>,
    paper: &PaperRecord,
    candidates: &[UrlCandidate],
) -> Selection {
    match candidates {
        [] => return Selection::none("no candidates", false),
        [only] => {
            return Selection {
                candidate: Some(only.clone()),
                reason: "single candidate".into(),
                low_confidence: false,
                used_model: false,
            };
        }
        _ => {}
    }

    let Some(gateway) = gateway else {
        return Selection::fallback(candidates[0].clone(), "first candidate, model disabled");
    };

    let messages = vec![
        ChatMessage::system(SELECT_SYSTEM_PROMPT),
        ChatMessage::user(select_prompt(paper, candidates)),
    ];
    match complete_typed::<SelectReply>(gateway, messages, 0.1).await {
        Ok(reply) => match resolve_pick(reply.selected, candidates) {
            Some(chosen) => {
                tracing::info!(url = %chosen.raw_url, reason = %reply.reason, "model selected candidate");
                Selection {
                    candidate: Some(chosen.clone()),
                    reason: reply.reason,
                    low_confidence: false,
                    used_model: true,
                }
            }
            None => {
                tracing::info!(reason = %reply.reason, "model rejected all candidates");
                let reason = if reply.reason.is_empty() {
                    "no suitable candidate".to_string()
                } else {
                    reply.reason
                };
                Selection::none(reason, true)
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "selection failed, taking first candidate");
            Selection::fallback(candidates[0].clone(), format!("first candidate, model failed: {e}"))
        }
    }
}

/// A search result the model judged to implement the paper.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRepo {
    pub repo: RepositorySummary,
    pub relevance: f64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct Classification {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_implementation: bool,
    #[serde(default)]
    relevance: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ClassifyReply {
    repositories: Vec<Classification>,
}

const CLASSIFY_SYSTEM_PROMPT: &str = "You are a classifier that decides whether GitHub \
repositories implement a given research paper. Reply in JSON format.";

/// Relevance a classified repository must exceed to be kept.
pub const MIN_RELEVANCE: f64 = 0.3;

fn classify_prompt(paper: &PaperRecord, repos: &[RepositorySummary]) -> String {
    let listed = repos
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "{}. {} - {}\n   Description: {}\n   Stars: {}, Language: {}",
                i + 1,
                r.full_name,
                r.url,
                r.description,
                r.stars,
                r.primary_language.as_deref().unwrap_or("unknown"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Paper title: "{title}"
Year: {year}
Venue: {venue}
Abstract: "{abstract_text}..."

Repositories returned by a GitHub search:
{listed}

For each repository, decide whether it implements this paper (or is a very close re-implementation).
Reply in JSON format:
{{
  "repositories": [
    {{
      "full_name": "<owner/name>",
      "url": "<repository URL>",
      "is_implementation": true/false,
      "relevance": 0.0-1.0,
      "reason": "brief explanation"
    }}
  ]
}}"#,
        title = paper.title,
        year = paper.year,
        venue = paper.venue,
        abstract_text = truncate_chars(&paper.abstract_text, 500),
    )
}

/// Ask the model which search results implement `paper`.
///
/// Keeps results classified as implementations with relevance above
/// [`MIN_RELEVANCE`], most relevant first. Classifications are matched back
/// to `repos` by full name, then by URL; unmatched ones are dropped.
pub async fn filter_implementations(
    gateway: &dyn ModelGateway,
    paper: &PaperRecord,
    repos: &[RepositorySummary],
) -> Result<Vec<RankedRepo>, GatewayError> {
    if repos.is_empty() {
        return Ok(Vec::new());
    }

    let messages = vec![
        ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
        ChatMessage::user(classify_prompt(paper, repos)),
    ];
    let reply: ClassifyReply = complete_typed(gateway, messages, 0.1).await?;

    let mut kept: Vec<RankedRepo> = Vec::new();
    for item in reply.repositories {
        if !item.is_implementation || item.relevance.is_nan() || item.relevance <= MIN_RELEVANCE {
            continue;
        }
        let matched = repos
            .iter()
            .find(|r| r.full_name.eq_ignore_ascii_case(&item.full_name))
            .or_else(|| {
                let url = normalize_url(item.url.as_deref()?).to_lowercase();
                repos
                    .iter()
                    .find(|r| normalize_url(&r.url).to_lowercase() == url)
            });
        let Some(repo) = matched else {
            tracing::debug!(full_name = %item.full_name, "classification matches no search result");
            continue;
        };
        if kept.iter().any(|k| k.repo.full_name == repo.full_name) {
            continue;
        }
        kept.push(RankedRepo {
            repo: repo.clone(),
            relevance: item.relevance.min(1.0),
            reason: item.reason,
        });
    }

    kept.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    Ok(kept)
}

/// Search results that survived filtering, plus the one selected.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    /// Kept repository URLs, best first.
    pub kept_urls: Vec<String>,
    pub selection: Selection,
}

fn search_candidate(repo: &RepositorySummary) -> UrlCandidate {
    UrlCandidate::new(
        repo.url.clone(),
        format!("search result {}: {}", repo.full_name, repo.description),
        CandidateOrigin::HostingSearch,
    )
}

/// Narrow hosting search results down to one repository.
///
/// With a model the classification order decides; without one, or when
/// classification fails, the search order is kept and the pick is flagged
/// low-confidence.
pub async fn select_from_search(
    gateway: Option<&dyn ModelGateway>,
    paper: &PaperRecord,
    repos: &[RepositorySummary],
) -> SearchOutcome {
    let unfiltered = |reason: &str| {
        let kept_urls = repos.iter().map(|r| r.url.clone()).collect();
        let selection = match repos.first() {
            Some(first) => Selection::fallback(search_candidate(first), reason),
            None => Selection::none("no search results", false),
        };
        SearchOutcome {
            kept_urls,
            selection,
        }
    };

    let Some(gateway) = gateway else {
        return unfiltered("top search result, model disabled");
    };
    if repos.is_empty() {
        return unfiltered("no search results");
    }

    match filter_implementations(gateway, paper, repos).await {
        Ok(ranked) => {
            let kept_urls = ranked.iter().map(|r| r.repo.url.clone()).collect();
            let selection = match ranked.first() {
                Some(best) => Selection {
                    candidate: Some(search_candidate(&best.repo)),
                    reason: best.reason.clone(),
                    low_confidence: false,
                    used_model: true,
                },
                None => Selection::none("no search result implements the paper", true),
            };
            SearchOutcome {
                kept_urls,
                selection,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "search filtering failed, keeping search order");
            unfiltered("top search result, model failed")
        }
    }
}
