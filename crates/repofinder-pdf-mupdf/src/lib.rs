use std::path::Path;

use mupdf::{Document, TextPageFlags};

use repofinder_core::{BackendError, PdfBackend};

/// MuPDF-based implementation of [`PdfBackend`].
///
/// Kept in its own crate so the AGPL mupdf dependency is only linked when
/// PDF input is enabled.
///
/// Unlike reference parsing, no header/footer band is cut away: code links
/// are frequently placed in first-page footnotes.
#[derive(Debug, Default)]
pub struct MupdfBackend;

impl MupdfBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PdfBackend for MupdfBackend {
    fn extract_text(&self, path: &Path, max_pages: usize) -> Result<String, BackendError> {
        // Missing or unreadable files surface as BackendError::Io
        std::fs::metadata(path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| BackendError::OpenError("invalid path encoding".into()))?;

        let document =
            Document::open(path_str).map_err(|e| BackendError::OpenError(e.to_string()))?;

        let mut pages_text = Vec::new();

        for page_result in document
            .pages()
            .map_err(|e| BackendError::ExtractionError(e.to_string()))?
            .take(max_pages)
        {
            let page = page_result.map_err(|e| BackendError::ExtractionError(e.to_string()))?;
            let text_page = page
                .to_text_page(TextPageFlags::empty())
                .map_err(|e| BackendError::ExtractionError(e.to_string()))?;

            // Block/line iteration keeps one output line per layout line, so
            // URLs broken across lines stay recognisable for repair.
            let mut page_text = String::new();
            for block in text_page.blocks() {
                for line in block.lines() {
                    let line_text: String = line
                        .chars()
                        .map(|c| c.char().unwrap_or('\u{FFFD}'))
                        .collect();
                    page_text.push_str(&line_text);
                    page_text.push('\n');
                }
            }
            pages_text.push(page_text);
        }

        tracing::debug!(path = %path.display(), pages = pages_text.len(), "extracted PDF text");
        Ok(pages_text.join("\n"))
    }
}
