use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Upper bound on repair passes; each pass joins one break per URL.
const MAX_PASSES: usize = 4;

/// Re-join URLs that PDF text extraction broke across lines.
///
/// Handles:
/// - `https:\n//github.com/...` (scheme split)
/// - `https://\ngithub.com/...` (break right after the scheme)
/// - `https://github.\ncom/...` (break inside the host)
/// - `https://github.com/acme/\ndemo-net` (break after a path separator)
/// - `https://github.com/acme/demo-\nnet` (break after a hyphen, hyphen kept)
///
/// A URL that already names `owner/name` and ends in `/` is left alone when
/// the next line starts with a plain word.
pub fn repair_line_wraps(text: &str) -> Cow<'_, str> {
    // Scheme split before the slashes
    static FIX_SCHEME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(https?:)[ \t]*\r?\n[ \t]*(//)").unwrap());

    // Break directly after "://"
    static FIX_AFTER_SCHEME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(https?://)[ \t]*\r?\n[ \t]*(\S)").unwrap());

    // Break inside the host, after a dot, continuing lowercase
    static FIX_HOST: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"((?i:https?)://[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.)[ \t]*\r?\n[ \t]*([a-z])")
            .unwrap()
    });

    // Break after a path separator, hyphen or underscore; group 3 is a "/"
    // directly after the continuation token
    static FIX_PATH: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?i)(https?://[^\s/]+/[^\s]*[/\-_])[ \t]*\r?\n[ \t]*([A-Za-z0-9][\w\-.]*)(/?)",
        )
        .unwrap()
    });

    // Host followed by "/" on the next line
    static FIX_HOST_SLASH: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(https?://[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)+)[ \t]*\r?\n[ \t]*(/[\w\-.])")
            .unwrap()
    });

    let mut current: Cow<'_, str> = Cow::Borrowed(text);
    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for re in [&*FIX_SCHEME, &*FIX_AFTER_SCHEME, &*FIX_HOST, &*FIX_HOST_SLASH] {
            let replaced = match re.replace_all(&current, "$1$2") {
                Cow::Owned(fixed) => Some(fixed),
                Cow::Borrowed(_) => None,
            };
            if let Some(fixed) = replaced {
                current = Cow::Owned(fixed);
                changed = true;
            }
        }
        // A declined join re-emits the match, so compare instead of
        // trusting Cow::Owned.
        let replaced = match FIX_PATH.replace_all(&current, join_path_break) {
            Cow::Owned(fixed) if fixed != *current => Some(fixed),
            _ => None,
        };
        if let Some(fixed) = replaced {
            current = Cow::Owned(fixed);
            changed = true;
        }
        if !changed {
            break;
        }
    }
    current
}

fn join_path_break(caps: &Captures<'_>) -> String {
    let head = &caps[1];
    let token = &caps[2];
    let slash = &caps[3];
    if head.ends_with('/') && path_segments(head) >= 2 && slash.is_empty() && is_plain_word(token) {
        return caps[0].to_string();
    }
    format!("{head}{token}{slash}")
}

/// Non-empty path segments after the host.
fn path_segments(url: &str) -> usize {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split('/').skip(1).filter(|s| !s.is_empty()).count()
}

/// Letters only, ignoring sentence punctuation after it.
fn is_plain_word(token: &str) -> bool {
    let word = token.trim_end_matches(['.', ',']);
    !word.is_empty() && word.chars().all(|c| c.is_alphabetic())
}
