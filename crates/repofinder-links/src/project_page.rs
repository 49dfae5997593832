use std::collections::HashSet;

use scraper::{Html, Selector};

use crate::config::LinkConfig;
use crate::extract::{assemble_candidates, find_url_windows};
use crate::repair::repair_line_wraps;
use crate::{CandidateOrigin, UrlCandidate, normalize_url};

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Whether `url` looks like a paper's project page rather than a repository.
///
/// A project page is hosted on `*.github.io`, or has a path mentioning one
/// of the configured hints (`project`, `page`, ...). Known non-code domains
/// such as arxiv or YouTube never qualify.
pub fn is_project_page(url: &str, config: &LinkConfig) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    if config
        .non_code_domains
        .iter()
        .any(|d| host_matches(host, &d.to_ascii_lowercase()))
    {
        return false;
    }
    // Repository URLs are handled by the direct path.
    if config
        .hosting_domains
        .iter()
        .any(|d| host_matches(host, &d.to_ascii_lowercase()))
    {
        return false;
    }

    if host.ends_with(".github.io") {
        return true;
    }
    let path = parsed.path().to_ascii_lowercase();
    config
        .project_path_hints
        .iter()
        .any(|hint| path.contains(&hint.to_ascii_lowercase()))
}

/// Project-page URLs mentioned in `text`, de-duplicated, in order of first
/// appearance, capped at `config.max_project_pages`.
pub fn project_page_leads(text: &str, config: &LinkConfig) -> Vec<String> {
    let repaired = repair_line_wraps(text);
    let mut seen = HashSet::new();
    find_url_windows(&repaired, 0)
        .into_iter()
        .map(|w| w.url)
        .filter(|url| is_project_page(url, config))
        .filter(|url| seen.insert(normalize_url(url).to_lowercase()))
        .take(config.max_project_pages)
        .collect()
}

/// Scan a fetched project page for links into a code-hosting service.
///
/// Relative `href`s are resolved against `page_url`. The anchor text becomes
/// the candidate's context, prefixed with the page it was found on.
pub fn scan_page_links(html: &str, page_url: &str, config: &LinkConfig) -> Vec<UrlCandidate> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = url::Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let found = document.select(&selector).filter_map(|anchor| {
        let href = anchor.value().attr("href")?.trim();
        let absolute = match &base {
            Some(base) => base.join(href).ok()?.to_string(),
            None => url::Url::parse(href).ok()?.to_string(),
        };
        let text = anchor.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Some((absolute, format!("project page {page_url}: {text}")))
    });

    assemble_candidates(found, CandidateOrigin::PdfText, config)
}
