//! Binary persistence for the BM25 index.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic      : 8 bytes  "BM25IDX\0"
//! version    : u32 (current = 1)
//! k1, b      : f64 x 2
//! n_docs     : u64
//! avgdl      : f64
//! vocab_size : u64
//! vocab      : per term: u32 len + UTF-8 bytes + u32 df
//! doc_ids    : per doc: u32 len + UTF-8 chunk_id bytes
//! postings   : per doc: u32 tf_count + tf_count x (u32 term_index, u32 tf) + u32 doc_len
//! trailer    : u32 CRC32 of everything above
//! ```
//!
//! Writes go to `<path>.tmp` and are atomically renamed into place, so a
//! crashed writer can never leave a half-written file under the real name; a
//! stray `.tmp` is simply overwritten by the next save. Any defect on read
//! (magic, version, truncation, checksum) reports `IndexCorrupt` and means
//! the index must be rebuilt.

use std::fs;
use std::path::Path;

use rcpdb_core::error::{Error, Result};
use tracing::{info, warn};

use crate::index::{Bm25Index, Bm25Params, Bm25State};

const MAGIC: &[u8; 8] = b"BM25IDX\0";
const FORMAT_VERSION: u32 = 1;

impl Bm25Index {
    /// Serialize a snapshot and atomically replace the file at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.snapshot();
        let bytes = encode(&state);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        info!(
            path = %path.display(),
            docs = state.n_docs(),
            terms = state.terms.len(),
            "saved bm25 index"
        );
        Ok(())
    }

    /// Load a previously saved index. A missing file is `NotFound`; any
    /// malformed content is `IndexCorrupt`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "bm25 index file {}",
                path.display()
            )));
        }
        let bytes = fs::read(path)?;
        let state = decode(&bytes)?;
        info!(path = %path.display(), docs = state.n_docs(), "loaded bm25 index");
        Ok(Self::from_state(state))
    }

    /// Load if present and intact, otherwise start empty with `params`.
    /// Corruption is logged and surfaced as a rebuild (empty index).
    pub fn load_or_new(path: &Path, params: Bm25Params) -> Self {
        match Self::load(path) {
            Ok(index) => index,
            Err(Error::NotFound(_)) => Self::new(params),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "bm25 index unusable, rebuilding");
                Self::new(params)
            }
        }
    }
}

fn encode(state: &Bm25State) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&state.params.k1.to_le_bytes());
    buf.extend_from_slice(&state.params.b.to_le_bytes());
    buf.extend_from_slice(&(state.doc_ids.len() as u64).to_le_bytes());
    buf.extend_from_slice(&state.avgdl().to_le_bytes());
    buf.extend_from_slice(&(state.terms.len() as u64).to_le_bytes());

    for term in &state.terms {
        put_str(&mut buf, &term.text);
        buf.extend_from_slice(&term.df.to_le_bytes());
    }
    for chunk_id in &state.doc_ids {
        put_str(&mut buf, chunk_id);
    }

    // Per-document term vectors, rebuilt from the inverted lists. Postings
    // are appended in doc order, so each per-doc vector comes out sorted by
    // term index without an extra sort.
    let mut doc_terms: Vec<Vec<(u32, u32)>> = vec![Vec::new(); state.doc_ids.len()];
    for (term_index, term) in state.terms.iter().enumerate() {
        for posting in &term.postings {
            doc_terms[posting.doc as usize].push((term_index as u32, posting.tf));
        }
    }
    for (doc, terms) in doc_terms.iter().enumerate() {
        buf.extend_from_slice(&(terms.len() as u32).to_le_bytes());
        for (term_index, tf) in terms {
            buf.extend_from_slice(&term_index.to_le_bytes());
            buf.extend_from_slice(&tf.to_le_bytes());
        }
        buf.extend_from_slice(&state.doc_lens[doc].to_le_bytes());
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode(bytes: &[u8]) -> Result<Bm25State> {
    if bytes.len() < MAGIC.len() + 4 + 4 {
        return Err(corrupt("file shorter than header"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let mut r = Reader::new(body);
    if r.take(MAGIC.len())? != MAGIC.as_slice() {
        return Err(corrupt("bad magic"));
    }
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let k1 = r.f64()?;
    let b = r.f64()?;
    let n_docs = r.u64()? as usize;
    let _avgdl = r.f64()?;
    let vocab_size = r.u64()? as usize;

    let mut state = Bm25State::empty(Bm25Params { k1, b });
    state.terms.reserve(vocab_size);
    for i in 0..vocab_size {
        let text = r.string()?;
        let df = r.u32()?;
        state.lookup.insert(text.clone(), i as u32);
        state.terms.push(crate::index::Term {
            text,
            df,
            postings: Vec::new(),
        });
    }
    state.doc_ids.reserve(n_docs);
    for _ in 0..n_docs {
        state.doc_ids.push(r.string()?);
    }
    for doc in 0..n_docs {
        let tf_count = r.u32()? as usize;
        for _ in 0..tf_count {
            let term_index = r.u32()? as usize;
            let tf = r.u32()?;
            let term = state
                .terms
                .get_mut(term_index)
                .ok_or_else(|| corrupt("term index out of range"))?;
            term.postings.push(crate::index::Posting {
                doc: doc as u32,
                tf,
            });
        }
        let doc_len = r.u32()?;
        state.doc_lens.push(doc_len);
        state.total_len += doc_len as u64;
    }
    if !r.bytes.is_empty() {
        return Err(corrupt("trailing bytes after postings"));
    }
    Ok(state)
}

fn corrupt(detail: &str) -> Error {
    Error::IndexCorrupt(format!("bm25 index: {}", detail))
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(corrupt("truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("invalid utf-8"))
    }
}
