use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to open PDF: {0}")]
    OpenError(String),
    #[error("failed to extract text: {0}")]
    ExtractionError(String),
    /// The file could not be read at all (missing, permissions).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for PDF text extraction backends.
///
/// Code links almost always sit on the first pages (title footnote,
/// abstract, introduction), so callers pass a page bound.
pub trait PdfBackend: Send + Sync {
    /// Extract the text of at most `max_pages` leading pages.
    fn extract_text(&self, path: &Path, max_pages: usize) -> Result<String, BackendError>;
}
