//! Paper directories on disk: `<root>/<venue>/<year>/<paper>/`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use repofinder_core::{PaperRecord, RepoVerdictRecord};

pub const PAPER_DATA_FILE: &str = "paper_data.json";
pub const RECORD_FILE: &str = "github_links.json";
const TEXT_FILE: &str = "paper.txt";
const PDF_FILE: &str = "paper.pdf";

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// All paper directories under `root` (venue / year / paper), sorted.
/// Directories without `paper_data.json` are ignored.
pub fn discover_papers(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for venue in sorted_subdirs(root) {
        for year in sorted_subdirs(&venue) {
            for paper in sorted_subdirs(&year) {
                if paper.join(PAPER_DATA_FILE).is_file() {
                    out.push(paper);
                }
            }
        }
    }
    out
}

/// Read `paper_data.json` and, unless `skip_document`, the paper text.
///
/// Text comes from `paper.txt` when present, otherwise from the first
/// `max_pages` pages of `paper.pdf` (with the `pdf` feature). A missing or
/// unreadable document leaves `document_text` empty.
pub fn load_paper(dir: &Path, skip_document: bool, max_pages: usize) -> anyhow::Result<PaperRecord> {
    let data_path = dir.join(PAPER_DATA_FILE);
    let raw = std::fs::read_to_string(&data_path)
        .with_context(|| format!("reading {}", data_path.display()))?;
    let mut paper: PaperRecord = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", data_path.display()))?;

    if !skip_document {
        paper.document_text = load_document_text(dir, max_pages);
    }
    Ok(paper)
}

fn load_document_text(dir: &Path, max_pages: usize) -> Option<String> {
    let text_path = dir.join(TEXT_FILE);
    if text_path.is_file() {
        match std::fs::read_to_string(&text_path) {
            Ok(text) => return Some(text),
            Err(e) => tracing::warn!(path = %text_path.display(), error = %e, "unreadable paper text"),
        }
    }
    pdf_text(dir, max_pages)
}

#[cfg(feature = "pdf")]
fn pdf_text(dir: &Path, max_pages: usize) -> Option<String> {
    use repofinder_core::PdfBackend;

    let pdf_path = dir.join(PDF_FILE);
    if !pdf_path.is_file() {
        return None;
    }
    match repofinder_pdf_mupdf::MupdfBackend::new().extract_text(&pdf_path, max_pages) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(path = %pdf_path.display(), error = %e, "PDF text extraction failed");
            None
        }
    }
}

#[cfg(not(feature = "pdf"))]
fn pdf_text(dir: &Path, _max_pages: usize) -> Option<String> {
    if dir.join(PDF_FILE).is_file() {
        tracing::debug!(dir = %dir.display(), "paper.pdf ignored: built without the `pdf` feature");
    }
    None
}

/// The saved record, or `None` when it is missing or unreadable.
pub fn load_record(dir: &Path) -> Option<RepoVerdictRecord> {
    let path = dir.join(RECORD_FILE);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable record");
            None
        }
    }
}

/// Write the record as pretty-printed JSON.
pub fn save_record(dir: &Path, record: &RepoVerdictRecord) -> anyhow::Result<()> {
    let path = dir.join(RECORD_FILE);
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
}
