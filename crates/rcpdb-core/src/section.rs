//! Section parsing for RCP leaflet text.
//!
//! Leaflets follow a standard numbered layout (4.1 Indications,
//! 4.3 Contraindications, 4.8 Adverse reactions, ...). Header lines carry a
//! multi-level number and an uppercase or title-cased heading; everything
//! between two headers belongs to the preceding section.

use regex::Regex;
use serde::Serialize;

use crate::types::{ChunkingMethod, Section};

/// Number prefix (`4`, `4.1`, `4.2.1`) followed by an uppercase heading run
/// (Romanian diacritics included) or title-cased words, to end of line.
const DEFAULT_HEADER_PATTERN: &str =
    r"^(\d+(?:\.\d+)*)[ \t]+((?:\p{Lu}[\p{Lu}\d\s,\-/()']*)|(?:\p{Lu}\p{Ll}+(?:[ \-]\p{Lu}\p{Ll}+)*))$";

pub const PREAMBLE_TITLE: &str = "PREAMBLE";
pub const FALLBACK_TITLE: &str = "FULL_TEXT";

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub sections: Vec<Section>,
    pub method: ChunkingMethod,
}

/// Streaming line parser with a pluggable header recognizer.
pub struct SectionParser {
    header: Regex,
}

impl Default for SectionParser {
    fn default() -> Self {
        Self {
            header: Regex::new(DEFAULT_HEADER_PATTERN).expect("default header pattern compiles"),
        }
    }
}

impl SectionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a corpus-specific header recognizer.
    pub fn with_pattern(header: Regex) -> Self {
        Self { header }
    }

    /// Never fails; always yields at least one section. With fewer than two
    /// recognized headers the whole document becomes a single fallback
    /// section and chunking degrades to `Fallback`.
    pub fn parse(&self, text: &str) -> ParsedDocument {
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<(String, String)> = None;
        let mut buf: Vec<&str> = Vec::new();
        let mut header_count = 0usize;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(caps) = self.header.captures(trimmed) {
                let number = caps[1].to_string();
                let title = caps[2].trim().to_string();
                self.flush(&mut sections, current.take(), &mut buf);
                current = Some((number, title));
                header_count += 1;
            } else {
                buf.push(trimmed);
            }
        }
        self.flush(&mut sections, current.take(), &mut buf);

        if header_count < 2 {
            return ParsedDocument {
                sections: vec![Section {
                    number: "0".to_string(),
                    title: FALLBACK_TITLE.to_string(),
                    text: text.trim().to_string(),
                    ordinal: 0,
                }],
                method: ChunkingMethod::Fallback,
            };
        }

        for (ordinal, section) in sections.iter_mut().enumerate() {
            section.ordinal = ordinal;
        }
        ParsedDocument {
            sections,
            method: ChunkingMethod::SectionAware,
        }
    }

    fn flush(
        &self,
        sections: &mut Vec<Section>,
        current: Option<(String, String)>,
        buf: &mut Vec<&str>,
    ) {
        let text = join_lines(buf);
        buf.clear();
        match current {
            Some((number, title)) => sections.push(Section {
                number,
                title,
                text,
                ordinal: 0,
            }),
            None => {
                // Text before the first header becomes a pseudo-section.
                if !text.is_empty() {
                    sections.push(Section {
                        number: "0".to_string(),
                        title: PREAMBLE_TITLE.to_string(),
                        text,
                        ordinal: 0,
                    });
                }
            }
        }
    }
}

/// Join content lines, repairing words hyphenated across line breaks.
fn join_lines(lines: &[&str]) -> String {
    let mut out = String::new();
    let mut join_direct = false;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() && !join_direct {
            out.push('\n');
        }
        if let Some(stripped) = line.strip_suffix('-') {
            out.push_str(stripped);
            join_direct = true;
        } else {
            out.push_str(line);
            join_direct = false;
        }
    }
    out.trim().to_string()
}

pub fn section_by_number<'a>(sections: &'a [Section], number: &str) -> Option<&'a Section> {
    sections.iter().find(|s| s.number == number)
}

/// All sections whose number starts with the prefix, e.g. "4" matches
/// 4, 4.1, 4.2, ...
pub fn sections_by_prefix<'a>(sections: &'a [Section], prefix: &str) -> Vec<&'a Section> {
    sections
        .iter()
        .filter(|s| {
            s.number == prefix
                || s.number
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionStats {
    pub total_sections: usize,
    pub total_characters: usize,
    pub min_section_length: usize,
    pub max_section_length: usize,
    pub avg_section_length: usize,
}

pub fn section_stats(sections: &[Section]) -> SectionStats {
    let lengths: Vec<usize> = sections.iter().map(|s| s.text.chars().count()).collect();
    let total: usize = lengths.iter().sum();
    SectionStats {
        total_sections: sections.len(),
        total_characters: total,
        min_section_length: lengths.iter().copied().min().unwrap_or(0),
        max_section_length: lengths.iter().copied().max().unwrap_or(0),
        avg_section_length: if sections.is_empty() {
            0
        } else {
            total / sections.len()
        },
    }
}
