//! Okapi BM25 over an in-memory inverted index.
//!
//! Single-writer / multi-reader: the index holds its state in an `Arc`
//! behind an `RwLock`. Readers clone the `Arc` and score against an
//! immutable snapshot; the writer mutates copy-on-write, so a snapshot taken
//! before an update never observes a partial one. Appends are deterministic:
//! term indices are assigned in first-encounter order and documents keep
//! their insertion order, which makes the persisted form byte-stable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rcpdb_core::types::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Posting {
    pub(crate) doc: u32,
    pub(crate) tf: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct Term {
    pub(crate) text: String,
    pub(crate) df: u32,
    pub(crate) postings: Vec<Posting>,
}

/// Immutable scoring state published to readers.
#[derive(Debug, Clone)]
pub struct Bm25State {
    pub(crate) params: Bm25Params,
    /// Terms in index order; the position is the persisted term index.
    pub(crate) terms: Vec<Term>,
    pub(crate) lookup: HashMap<String, u32>,
    /// Chunk ids in insertion order; the position is the internal doc index.
    pub(crate) doc_ids: Vec<ChunkId>,
    pub(crate) doc_lens: Vec<u32>,
    pub(crate) total_len: u64,
}

impl Bm25State {
    pub(crate) fn empty(params: Bm25Params) -> Self {
        Self {
            params,
            terms: Vec::new(),
            lookup: HashMap::new(),
            doc_ids: Vec::new(),
            doc_lens: Vec::new(),
            total_len: 0,
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn n_docs(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn avgdl(&self) -> f64 {
        if self.doc_ids.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.doc_ids.len() as f64
        }
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.doc_ids.iter().any(|id| id == chunk_id)
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.doc_ids
    }

    fn push_doc(&mut self, chunk_id: &str, tokens: &[String]) {
        let doc = self.doc_ids.len() as u32;
        self.doc_ids.push(chunk_id.to_string());
        self.doc_lens.push(tokens.len() as u32);
        self.total_len += tokens.len() as u64;

        // Per-document term frequencies, in first-encounter order so that
        // new vocabulary entries are assigned deterministically.
        let mut order: Vec<u32> = Vec::new();
        let mut tfs: HashMap<u32, u32> = HashMap::new();
        for token in tokens {
            let term_index = match self.lookup.get(token) {
                Some(&i) => i,
                None => {
                    let i = self.terms.len() as u32;
                    self.terms.push(Term {
                        text: token.clone(),
                        df: 0,
                        postings: Vec::new(),
                    });
                    self.lookup.insert(token.clone(), i);
                    i
                }
            };
            if !tfs.contains_key(&term_index) {
                order.push(term_index);
            }
            *tfs.entry(term_index).or_insert(0) += 1;
        }
        for term_index in order {
            let term = &mut self.terms[term_index as usize];
            term.df += 1;
            term.postings.push(Posting {
                doc,
                tf: tfs[&term_index],
            });
        }
    }

    /// IDF with the +1 smoothing that keeps every value positive.
    fn idf(&self, df: u32) -> f64 {
        let n = self.doc_ids.len() as f64;
        let df = df as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Score descending; exact ties resolve to the lower internal doc index.
    pub fn score(&self, query_tokens: &[String], top_k: usize) -> Vec<(ChunkId, f64)> {
        if self.doc_ids.is_empty() || query_tokens.is_empty() {
            return Vec::new();
        }
        let Bm25Params { k1, b } = self.params;
        let avgdl = self.avgdl();
        let mut scores: HashMap<u32, f64> = HashMap::new();

        for token in query_tokens {
            let Some(&term_index) = self.lookup.get(token) else {
                continue;
            };
            let term = &self.terms[term_index as usize];
            let idf = self.idf(term.df);
            for posting in &term.postings {
                let tf = posting.tf as f64;
                let dl = self.doc_lens[posting.doc as usize] as f64;
                let denom = tf + k1 * (1.0 - b + b * dl / avgdl);
                *scores.entry(posting.doc).or_insert(0.0) += idf * (tf * (k1 + 1.0)) / denom;
            }
        }

        let mut ranked: Vec<(u32, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
            .into_iter()
            .map(|(doc, score)| (self.doc_ids[doc as usize].clone(), score))
            .collect()
    }
}

/// Handle owning the mutable index; cheap to share behind an `Arc`.
pub struct Bm25Index {
    state: RwLock<Arc<Bm25State>>,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            state: RwLock::new(Arc::new(Bm25State::empty(params))),
        }
    }

    pub(crate) fn from_state(state: Bm25State) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
        }
    }

    /// Consistent point-in-time view for scoring and persistence.
    pub fn snapshot(&self) -> Arc<Bm25State> {
        self.state.read().expect("bm25 lock").clone()
    }

    /// Append documents in order. Identical input order reproduces identical
    /// state, including the persisted byte form.
    pub fn add_documents(&self, items: &[(ChunkId, Vec<String>)]) {
        let mut guard = self.state.write().expect("bm25 lock");
        let state = Arc::make_mut(&mut guard);
        for (chunk_id, tokens) in items {
            state.push_doc(chunk_id, tokens);
        }
    }

    pub fn query(&self, query_tokens: &[String], top_k: usize) -> Vec<(ChunkId, f64)> {
        self.snapshot().score(query_tokens, top_k)
    }

    pub fn n_docs(&self) -> usize {
        self.snapshot().n_docs()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.snapshot().contains(chunk_id)
    }
}
