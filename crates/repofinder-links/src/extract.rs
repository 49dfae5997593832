use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LinkConfig;
use crate::repair::repair_line_wraps;
use crate::{CandidateOrigin, UrlCandidate};

/// Any `http(s)://` run up to whitespace or a character that cannot appear
/// unescaped in a URL.
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap());

/// A URL occurrence together with the text around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlWindow {
    /// URL as matched, trailing punctuation already removed.
    pub url: String,
    /// Byte offset of the match in the (repaired) text.
    pub start: usize,
    pub context: String,
}

/// Strip punctuation that PDF text tends to glue onto the end of a URL.
///
/// Closing brackets are removed only while unbalanced, so
/// `https://host/a_(b)` survives intact.
pub fn clean_url(url: &str) -> String {
    const TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"', '*'];
    let mut url = url.trim().trim_end_matches(TRAILING);

    loop {
        let before = url.len();
        for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
            if url.ends_with(close) && url.matches(close).count() > url.matches(open).count() {
                url = &url[..url.len() - 1];
                url = url.trim_end_matches(TRAILING);
            }
        }
        if url.len() == before {
            break;
        }
    }

    url.to_string()
}

/// Slice `radius` characters on each side of `start..end`, respecting char
/// boundaries.
fn context_window(text: &str, start: usize, end: usize, radius: usize) -> String {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(radius)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(start);
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());
    text[from..to].to_string()
}

/// Locate every `http(s)://` occurrence and capture its context window.
///
/// `text` should already have line wraps repaired.
pub fn find_url_windows(text: &str, radius: usize) -> Vec<UrlWindow> {
    URL_RE
        .find_iter(text)
        .filter_map(|m| {
            let url = clean_url(m.as_str());
            if url.len() <= "https://".len() {
                return None;
            }
            Some(UrlWindow {
                context: context_window(text, m.start(), m.start() + url.len(), radius),
                start: m.start(),
                url,
            })
        })
        .collect()
}

/// Whether `url` points into one of `domains` with an `owner/name` shaped path.
///
/// The host must equal a domain or end with `.domain`; a leading `www.` is
/// ignored.
pub fn is_hosting_url(url: &str, domains: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let domain_ok = domains.iter().any(|d| {
        let d = d.to_ascii_lowercase();
        host == d || host.ends_with(&format!(".{d}"))
    });
    if !domain_ok {
        return false;
    }

    parsed
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).count() >= 2)
        .unwrap_or(false)
}

/// Whether the context around a URL mentions code.
pub fn has_code_keyword(context: &str, keywords: &[String]) -> bool {
    let lower = context.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

/// Turn raw `(url, context)` pairs into ranked, de-duplicated candidates.
///
/// 1. Trailing punctuation is stripped.
/// 2. Only hosting-domain URLs with an owner/name path survive.
/// 3. Duplicates (by normalized URL) collapse onto the first occurrence.
/// 4. Candidates whose context contains a code keyword come first; order
///    inside each group is insertion order. The URL itself is masked out of
///    the context for this check, otherwise every GitHub link would match
///    the `github` keyword.
pub fn assemble_candidates<I>(
    found: I,
    origin: CandidateOrigin,
    config: &LinkConfig,
) -> Vec<UrlCandidate>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut seen = HashSet::new();
    let mut preferred = Vec::new();
    let mut rest = Vec::new();

    for (raw, context) in found {
        let raw = clean_url(&raw);
        if !is_hosting_url(&raw, &config.hosting_domains) {
            continue;
        }
        let candidate = UrlCandidate::new(raw, context, origin);
        if !seen.insert(candidate.normalized_url.to_lowercase()) {
            continue;
        }
        let surrounding = candidate.source_context.replace(&candidate.raw_url, " ");
        if has_code_keyword(&surrounding, &config.code_keywords) {
            preferred.push(candidate);
        } else {
            rest.push(candidate);
        }
    }

    preferred.extend(rest);
    preferred
}

/// Extract repository candidates from document text by pattern matching.
pub fn extract_candidates(text: &str, config: &LinkConfig) -> Vec<UrlCandidate> {
    let repaired = repair_line_wraps(text);
    let windows = find_url_windows(&repaired, config.context_radius);
    assemble_candidates(
        windows.into_iter().map(|w| (w.url, w.context)),
        CandidateOrigin::PdfText,
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LinkConfig {
        LinkConfig::default()
    }

    #[test]
    fn clean_url_trailing_punctuation() {
        assert_eq!(
            clean_url("https://github.com/acme/demo-net."),
            "https://github.com/acme/demo-net"
        );
        assert_eq!(
            clean_url("https://github.com/acme/demo-net)."),
            "https://github.com/acme/demo-net"
        );
        assert_eq!(
            clean_url("https://en.wikipedia.org/wiki/Foo_(bar)"),
            "https://en.wikipedia.org/wiki/Foo_(bar)"
        );
    }

    #[test]
    fn windows_capture_context() {
        let text = "See code at https://github.com/acme/demo-net for details";
        let windows = find_url_windows(text, 50);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].url, "https://github.com/acme/demo-net");
        assert_eq!(windows[0].context, text);
    }

    #[test]
    fn windows_are_char_boundary_safe() {
        let text = "代码 ééé https://github.com/acme/demo-net 见 ñ";
        let windows = find_url_windows(text, 3);
        assert_eq!(windows.len(), 1);
        assert!(windows[0].context.contains("https://github.com/acme/demo-net"));
    }

    #[test]
    fn hosting_url_domain_rules() {
        let domains = cfg().hosting_domains;
        assert!(is_hosting_url("https://github.com/acme/demo-net", &domains));
        assert!(is_hosting_url("https://www.github.com/acme/demo-net", &domains));
        assert!(is_hosting_url("https://GitLab.com/group/project", &domains));
        assert!(!is_hosting_url("https://github.com/acme", &domains));
        assert!(!is_hosting_url("https://github.com/", &domains));
        assert!(!is_hosting_url("https://notgithub.com/acme/demo", &domains));
        assert!(!is_hosting_url("https://acme.github.io/demo-net/", &domains));
    }

    #[test]
    fn scenario_single_code_link() {
        let text = "See code at https://github.com/acme/demo-net for details";
        let candidates = extract_candidates(text, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].normalized_url,
            "https://github.com/acme/demo-net"
        );
        assert!(has_code_keyword(
            &candidates[0].source_context,
            &cfg().code_keywords
        ));
    }

    #[test]
    fn keyword_group_preferred_insertion_order_kept() {
        let text = "\
Related: https://github.com/other/baseline was used as a baseline for comparison.\n\
Some unrelated sentence goes here to keep the windows apart from each other.\n\
Our code is available at https://github.com/acme/demo-net and mirrors.\n\
Some unrelated sentence goes here to keep the windows apart from each other.\n\
Also see https://github.com/third/tool which we did not write ourselves.\n\
Some unrelated sentence goes here to keep the windows apart from each other.\n\
The implementation: https://gitlab.com/acme/demo-net-jax for jax users.";
        let candidates = extract_candidates(text, &cfg());
        let urls: Vec<_> = candidates.iter().map(|c| c.normalized_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://github.com/acme/demo-net",
                "https://gitlab.com/acme/demo-net-jax",
                "https://github.com/other/baseline",
                "https://github.com/third/tool",
            ]
        );
    }

    #[test]
    fn duplicates_keep_first_context() {
        let text = "first mention https://github.com/acme/demo-net/ here.\n\
                    ...........................................................\n\
                    code again https://github.com/acme/demo-net.git";
        let candidates = extract_candidates(text, &cfg());
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].source_context.contains("first mention"));
    }

    #[test]
    fn wrapped_url_is_reconstructed() {
        let text = "Code: https://github.com/acme/\ndemo-net.";
        let candidates = extract_candidates(text, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].raw_url, "https://github.com/acme/demo-net");
    }

    #[test]
    fn trailing_slash_url_before_sentence() {
        let text = "Code: https://github.com/acme/demo-net/\nWe propose a new method.";
        let candidates = extract_candidates(text, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].normalized_url,
            "https://github.com/acme/demo-net"
        );
    }

    #[test]
    fn non_hosting_urls_dropped() {
        let text = "Paper at https://arxiv.org/abs/2301.12345 and https://acme.github.io/demo";
        assert!(extract_candidates(text, &cfg()).is_empty());
    }
}
