use crate::document::Document;
use anyhow::Result;
use log::warn;

pub const CHUNK_SIZE: usize = 1000;
pub const CHUNK_OVERLAP: usize = 200;

/// Split points in order of preference. The empty separator splits into characters.
pub const SEPARATORS: [&str; 6] = ["\nChapter ", "\nVerse ", "\n\n", "\n", " ", ""];

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Unique identifier for the document this chunk belongs to
    pub document_id: String,
    /// Zero-based page the chunk was cut from
    pub page: usize,
    /// Position of the chunk in the whole document
    pub chunk_index: usize,
    /// Starting character position of this chunk within its page
    pub start_position: usize,
}

/// Recursive character splitter: fixed-size windows that prefer to break on
/// the earliest separator of the list that occurs in the text.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for TextSplitter {
    fn default() -> Self {
        TextSplitter {
            chunk_size: CHUNK_SIZE,
            chunk_overlap: CHUNK_OVERLAP,
            separators: SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize, separators: &[&str]) -> Result<Self> {
        if chunk_overlap > chunk_size {
            anyhow::bail!(
                "Chunk overlap ({}) is larger than chunk size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(TextSplitter {
            chunk_size,
            chunk_overlap,
            separators: separators.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Split every page of a document, numbering chunks across the whole document
    pub fn split_document(&self, document: &Document) -> Vec<TextChunk> {
        let mut chunks = Vec::new();

        for page in &document.pages {
            for (byte_start, text) in self.split_with_offsets(&page.content) {
                chunks.push(TextChunk {
                    text,
                    document_id: document.document_id.clone(),
                    page: page.number,
                    chunk_index: chunks.len(),
                    start_position: char_len(&page.content[..byte_start]),
                });
            }
        }

        chunks
    }

    /// Split a single string into chunks of at most `chunk_size` characters
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with_offsets(text)
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect()
    }

    /// Chunks paired with the byte offset where each starts in `text`
    fn split_with_offsets(&self, text: &str) -> Vec<(usize, String)> {
        self.split_recursive(text, 0, &self.separators)
    }

    fn split_recursive(&self, text: &str, offset: usize, separators: &[String]) -> Vec<(usize, String)> {
        let mut final_chunks = Vec::new();

        // Pick the first separator that occurs in the text
        let mut separator = separators.last().map(String::as_str).unwrap_or("");
        let mut remaining: &[String] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = "";
                break;
            }
            if text.contains(candidate.as_str()) {
                separator = candidate.as_str();
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut good_splits: Vec<(usize, &str)> = Vec::new();
        for (start, split) in split_keeping_separator(text, separator) {
            let start = offset + start;
            if char_len(split) < self.chunk_size {
                good_splits.push((start, split));
                continue;
            }

            if !good_splits.is_empty() {
                final_chunks.extend(self.merge_splits(&good_splits));
                good_splits.clear();
            }
            if remaining.is_empty() {
                final_chunks.push((start, split.to_string()));
            } else {
                final_chunks.extend(self.split_recursive(split, start, remaining));
            }
        }

        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits));
        }

        final_chunks
    }

    /// Greedily pack small adjacent pieces into windows, carrying up to
    /// `chunk_overlap` characters from the end of one window into the next.
    fn merge_splits(&self, splits: &[(usize, &str)]) -> Vec<(usize, String)> {
        let mut docs = Vec::new();
        let mut current: Vec<(usize, &str)> = Vec::new();
        let mut start = 0;
        let mut total = 0;

        for &(offset, split) in splits {
            let len = char_len(split);

            if total + len > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        "Created a chunk of size {}, which is longer than the specified {}",
                        total, self.chunk_size
                    );
                }
                if start < current.len() {
                    push_joined(&mut docs, &current[start..]);

                    while total > self.chunk_overlap
                        || (total + len > self.chunk_size && total > 0)
                    {
                        total -= char_len(current[start].1);
                        start += 1;
                    }
                }
            }

            current.push((offset, split));
            total += len;
        }

        push_joined(&mut docs, &current[start..]);
        docs
    }
}

/// Split `text` on `separator`, attaching each separator to the piece that follows it.
/// Pieces come with their byte offset in `text`. Empty pieces are dropped;
/// an empty separator yields single characters.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<(usize, &'a str)> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| (i, &text[i..i + c.len_utf8()]))
            .collect();
    }

    let mut pieces = Vec::new();
    let mut last = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > last {
            pieces.push((last, &text[last..idx]));
        }
        last = idx;
    }
    if last < text.len() {
        pieces.push((last, &text[last..]));
    }
    pieces
}

/// Join adjacent pieces and trim, moving the start offset past leading whitespace
fn push_joined(docs: &mut Vec<(usize, String)>, parts: &[(usize, &str)]) {
    let Some(&(offset, _)) = parts.first() else {
        return;
    };
    let joined: String = parts.iter().map(|(_, part)| *part).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        let leading = joined.len() - joined.trim_start().len();
        docs.push((offset + leading, trimmed.to_string()));
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Page;

    #[test]
    fn test_short_text_is_single_chunk() {
        let splitter = TextSplitter::default();
        let chunks = splitter.split_text("  Chapter 2\nVerse 47\nYou have a right to perform your duties.  ");
        assert_eq!(
            chunks,
            vec!["Chapter 2\nVerse 47\nYou have a right to perform your duties."]
        );
    }

    #[test]
    fn test_whitespace_only_text_yields_nothing() {
        assert!(TextSplitter::default().split_text(" \n\n  ").is_empty());
    }

    #[test]
    fn test_separator_is_kept_at_start_of_next_piece() {
        assert_eq!(
            split_keeping_separator("a\nVerse 1\nVerse 2", "\nVerse "),
            vec![(0, "a"), (1, "\nVerse 1"), (9, "\nVerse 2")]
        );
        assert_eq!(
            split_keeping_separator("héj", ""),
            vec![(0, "h"), (1, "é"), (3, "j")]
        );
    }

    #[test]
    fn test_word_windows_with_overlap() {
        let splitter = TextSplitter::new(10, 5, &["\n\n", "\n", " ", ""]).unwrap();
        let chunks = splitter.split_text("aaa bbb ccc ddd eee");
        assert_eq!(chunks, vec!["aaa bbb", "bbb ccc", "ccc ddd", "ddd eee"]);
    }

    #[test]
    fn test_prefers_chapter_boundaries() {
        let splitter = TextSplitter::new(30, 0, &SEPARATORS).unwrap();
        let text = "Intro line\nChapter 1 duty and action\nChapter 2 the self is eternal";
        let chunks = splitter.split_text(text);
        assert_eq!(
            chunks,
            vec![
                "Intro line",
                "Chapter 1 duty and action",
                "Chapter 2 the self is eternal"
            ]
        );
    }

    #[test]
    fn test_long_word_falls_back_to_characters() {
        let splitter = TextSplitter::new(4, 0, &[" ", ""]).unwrap();
        let chunks = splitter.split_text("ab abcdefghij");
        // the leading space of " abcdefghij" takes a slot in the first window
        assert_eq!(chunks, vec!["ab", "abc", "defg", "hij"]);
    }

    #[test]
    fn test_chunks_respect_size_on_long_text() {
        let verse = "You have a right to perform your prescribed duties, but you are not entitled to the fruits of your actions. ";
        let mut text = String::from("The Bhagavad Gita");
        for chapter in 1..=3 {
            text.push_str(&format!("\nChapter {}\n", chapter));
            for verse_no in 1..=10 {
                text.push_str(&format!("\nVerse {} {}", verse_no, verse.repeat(2)));
            }
        }

        let chunks = TextSplitter::default().split_text(&text);
        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(char_len(chunk) <= CHUNK_SIZE, "chunk too long: {}", char_len(chunk));
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_overlap_larger_than_size_is_rejected() {
        assert!(TextSplitter::new(100, 200, &SEPARATORS).is_err());
    }

    #[test]
    fn test_split_document_numbers_chunks_across_pages() {
        let document = Document {
            document_id: "gita.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            pages: vec![
                Page {
                    number: 0,
                    content: "aaa bbb ccc".to_string(),
                },
                Page {
                    number: 1,
                    content: String::new(),
                },
                Page {
                    number: 2,
                    content: "ddd eee".to_string(),
                },
            ],
        };

        let splitter = TextSplitter::new(7, 0, &[" ", ""]).unwrap();
        let chunks = splitter.split_document(&document);

        let summary: Vec<(usize, usize, usize, &str)> = chunks
            .iter()
            .map(|c| (c.chunk_index, c.page, c.start_position, c.text.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![(0, 0, 0, "aaa bbb"), (1, 0, 8, "ccc"), (2, 2, 0, "ddd eee")]
        );
        assert!(chunks.iter().all(|c| c.document_id == "gita.pdf"));
    }

    #[test]
    fn test_start_positions_on_repetitive_page() {
        let document = Document {
            document_id: "mantra.txt".to_string(),
            mime_type: "text/plain".to_string(),
            pages: vec![Page {
                number: 0,
                content: "om om om om".to_string(),
            }],
        };

        let splitter = TextSplitter::new(5, 0, &[" ", ""]).unwrap();
        let chunks: Vec<(usize, String)> = splitter
            .split_document(&document)
            .into_iter()
            .map(|c| (c.start_position, c.text))
            .collect();
        assert_eq!(
            chunks,
            vec![
                (0, "om om".to_string()),
                (6, "om".to_string()),
                (9, "om".to_string())
            ]
        );
    }

    #[test]
    fn test_offsets_point_at_chunk_text() {
        let page = "ॐ aaa bbb ccc";
        let splitter = TextSplitter::new(7, 3, &[" ", ""]).unwrap();
        let chunks = splitter.split_with_offsets(page);
        for (byte_start, text) in &chunks {
            assert!(page[*byte_start..].starts_with(text.as_str()), "{} at {}", text, byte_start);
        }
    }
}
