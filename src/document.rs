use anyhow::{Context, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text_by_pages;
use std::fs;
use std::path::Path;

/// One page of extracted text
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Zero-based page number
    pub number: usize,
    pub content: String,
}

/// Represents a document with its pages and metadata
#[derive(Debug, Clone)]
pub struct Document {
    /// The document's file name (used as document ID)
    pub document_id: String,
    /// The document's MIME type
    pub mime_type: String,
    /// Extracted text, page by page
    pub pages: Vec<Page>,
}

impl Document {
    /// Create a new document from a file path
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        if !path.exists() {
            anyhow::bail!("PDF file not found at {}", path.display());
        }

        let file_name = path
            .file_name()
            .context("Invalid file name")?
            .to_str()
            .context("Invalid file name encoding")?
            .to_string();

        // Detect MIME type
        let mime = from_path(path).first_or_octet_stream();
        let mime_type = mime.to_string();
        debug!("Detected MIME type: {}", mime_type);

        let pages = read_document_pages(path, &mime_type)?;

        if pages.iter().all(|page| page.content.is_empty()) {
            warn!("No text extracted from {}", path.display());
        }

        Ok(Document {
            document_id: file_name,
            mime_type,
            pages,
        })
    }

    /// Total number of characters across all pages
    pub fn char_count(&self) -> usize {
        self.pages.iter().map(|p| p.content.chars().count()).sum()
    }
}

/// Read the pages of a document based on its MIME type
pub fn read_document_pages<P: AsRef<Path>>(file_path: P, mime_type: &str) -> Result<Vec<Page>> {
    let path = file_path.as_ref();

    match mime_type {
        mime if mime.starts_with("application/pdf") => {
            info!("Processing PDF document: {}", path.display());
            let pages = extract_text_by_pages(path)
                .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;

            // PDF extraction can sometimes include excessive whitespace
            Ok(pages
                .iter()
                .enumerate()
                .map(|(number, text)| Page {
                    number,
                    content: normalize_whitespace(text),
                })
                .collect())
        }

        mime if mime.starts_with("text/") => {
            info!("Processing text document: {}", path.display());
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))?;
            Ok(vec![Page { number: 0, content }])
        }

        _ => Err(anyhow::anyhow!(
            "Unsupported document format: {}. Only text and PDF files are supported.",
            mime_type
        )),
    }
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            // At most two newlines (paragraph break)
            normalized.push_str(if newline_count >= 2 { "\n\n" } else { "\n" });
            newline_count = 0;
            prev_char = '\n';
        }

        if !(c == ' ' && prev_char == ' ') {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_whitespace() {
        let text = "This  has   multiple    spaces.\n\n\nAnd multiple newlines.\r\nAnd Windows line endings.";
        let expected =
            "This has multiple spaces.\n\nAnd multiple newlines.\nAnd Windows line endings.";
        assert_eq!(normalize_whitespace(text), expected);
    }

    #[test]
    fn test_normalize_keeps_chapter_headings_on_own_line() {
        let text = "  The Bhagavad Gita\nChapter 2\n\n\n\nVerse 47  ";
        assert_eq!(
            normalize_whitespace(text),
            "The Bhagavad Gita\nChapter 2\n\nVerse 47"
        );
    }

    #[test]
    fn test_missing_file() {
        let err = Document::from_file("/definitely/not/here.pdf").unwrap_err();
        assert!(err.to_string().starts_with("PDF file not found at"));
    }

    #[test]
    fn test_text_file_is_single_page() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write!(file, "Chapter 2\nVerse 47").unwrap();

        let document = Document::from_file(file.path()).unwrap();
        assert_eq!(document.mime_type, "text/plain");
        assert_eq!(
            document.pages,
            vec![Page {
                number: 0,
                content: "Chapter 2\nVerse 47".to_string()
            }]
        );
        assert_eq!(document.char_count(), 18);
    }

    #[test]
    fn test_unsupported_format() {
        let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        let err = Document::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported document format"));
    }
}
