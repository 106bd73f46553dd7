//! Lexical tokenization for the sparse index and sparse query path.
//!
//! The embedding model carries its own subword tokenizer; this one exists so
//! that domain compounds like "5-Fluorouracil" survive as single terms.
//! No stopword removal: short function words matter in clinical queries.

/// Case-folded tokens: maximal alphanumeric runs, with a hyphen kept only
/// when it joins two alphanumeric characters on both sides.
///
/// "5-Fluorouracil" -> ["5-fluorouracil"]; "Drug A, Drug B" -> ["drug", "a",
/// "drug", "b"]; numeric tokens are retained.
pub fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                current.push(lower);
            }
        } else if c == '-'
            && !current.is_empty()
            && chars.get(i + 1).is_some_and(|next| next.is_alphanumeric())
        {
            current.push('-');
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
