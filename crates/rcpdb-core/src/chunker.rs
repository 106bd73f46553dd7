//! Sliding-window chunking over parsed sections.
//!
//! Windows are sized and advanced in characters, never bytes, because the
//! corpus carries diacritics. Within the last 15% of a window the chunker
//! prefers to end at a sentence terminator or newline; a short final
//! remainder is merged into the previous chunk instead of emitted as an
//! orphan fragment.

use crate::error::{Error, Result};
use crate::section::ParsedDocument;
use crate::types::{Chunk, ChunkingMethod, Section};

/// Fraction of the window, from the end, searched for a sentence break.
const BREAK_WINDOW_FRACTION: f64 = 0.15;
const SENTENCE_TERMINATORS: [char; 4] = ['.', '!', '?', '\n'];

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Characters shared with the previous chunk of the same section.
    pub overlap: usize,
    /// When false, sections are concatenated before windowing and chunk
    /// metadata records only the source document and running index.
    pub chunk_by_section: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 100,
            chunk_by_section: true,
        }
    }
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if config.overlap >= config.chunk_size {
            return Err(Error::Config(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                config.overlap, config.chunk_size
            )));
        }
        Ok(Self { config })
    }

    /// Chunk a parsed document. `chunk_id`s are deterministic
    /// (`<source_id>:<section_number>:<chunk_index>`), so re-chunking the
    /// same input yields identical ids and texts.
    pub fn chunk_document(&self, source_id: &str, document: &ParsedDocument) -> Vec<Chunk> {
        if self.config.chunk_by_section {
            let mut chunks = Vec::new();
            for section in &document.sections {
                self.chunk_section(source_id, section, document.method, &mut chunks);
            }
            chunks
        } else {
            self.chunk_concatenated(source_id, &document.sections)
        }
    }

    fn chunk_section(
        &self,
        source_id: &str,
        section: &Section,
        method: ChunkingMethod,
        out: &mut Vec<Chunk>,
    ) {
        let mut chunk_index = 0usize;
        for text in self.windows(&section.text) {
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            out.push(Chunk {
                chunk_id: chunk_id(source_id, &section.number, chunk_index),
                text,
                source_id: source_id.to_string(),
                section_number: section.number.clone(),
                section_title: section.title.clone(),
                chunk_index,
                chunking_method: method,
            });
            chunk_index += 1;
        }
    }

    /// Whole-document mode: section titles become sentinel lines and section
    /// boundaries no longer constrain windows.
    fn chunk_concatenated(&self, source_id: &str, sections: &[Section]) -> Vec<Chunk> {
        let mut joined = String::new();
        for section in sections {
            if !section.title.is_empty() {
                joined.push_str(&section.title);
                joined.push('\n');
            }
            joined.push_str(&section.text);
            joined.push('\n');
        }
        let mut chunks = Vec::new();
        let mut chunk_index = 0usize;
        for text in self.windows(&joined) {
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            chunks.push(Chunk {
                chunk_id: chunk_id(source_id, "0", chunk_index),
                text,
                source_id: source_id.to_string(),
                section_number: "0".to_string(),
                section_title: String::new(),
                chunk_index,
                chunking_method: ChunkingMethod::Fallback,
            });
            chunk_index += 1;
        }
        chunks
    }

    fn windows(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let size = self.config.chunk_size;
        let overlap = self.config.overlap;

        if len <= size {
            return vec![text.to_string()];
        }

        let mut out: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        loop {
            let remaining = len - start;
            if remaining <= size {
                if remaining >= size / 4 || out.is_empty() {
                    // Shift the final window left so it keeps full size.
                    out.push((len.saturating_sub(size), len));
                } else if let Some(last) = out.last_mut() {
                    // Orphan remainder: absorb into the previous chunk.
                    last.1 = len;
                }
                break;
            }
            let end = self.preferred_break(&chars, start, start + size);
            out.push((start, end));
            // The overlap must never stall or reverse the walk.
            start = end.saturating_sub(overlap).max(start + 1);
        }

        out.into_iter()
            .map(|(s, e)| chars[s..e].iter().collect())
            .collect()
    }

    /// Within the last 15% of the window, break after the nearest sentence
    /// terminator or newline; otherwise break at the window boundary.
    fn preferred_break(&self, chars: &[char], start: usize, end: usize) -> usize {
        let span = ((self.config.chunk_size as f64) * BREAK_WINDOW_FRACTION).ceil() as usize;
        let floor = end.saturating_sub(span).max(start + 1);
        for pos in (floor..end).rev() {
            if SENTENCE_TERMINATORS.contains(&chars[pos]) {
                return pos + 1;
            }
        }
        end
    }
}

/// Deterministic chunk identity within a collection.
pub fn chunk_id(source_id: &str, section_number: &str, chunk_index: usize) -> String {
    format!("{}:{}:{}", source_id, section_number, chunk_index)
}
