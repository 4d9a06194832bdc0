//! Fulltext index: postings with Okapi BM25 scoring.
//!
//! Storage layout in the `index` column family:
//!
//! ```text
//! ftidx:{name}:{term}\x00{pk}  -> u32 term frequency
//! ftdoc:{name}:{pk}            -> u32 document length (tokens)
//! ftterm:{name}:{term}         -> u64 document frequency
//! ftstat:{name}                -> (u64 doc count, u64 total length)
//! ```
//!
//! All bookkeeping is maintained in the same transaction as the record
//! mutation, so document frequency, term frequency, and document length
//! are always consistent with the set of live records. Queries analyze
//! with the index's stored analyzer config, intersect the posting lists
//! of all query terms, and score with BM25 (`k1 = 1.2`, `b = 0.75`).

pub mod analyzer;

pub use analyzer::{AnalyzerConfig, Language};

use crate::catalog::{IndexConfig, IndexDescriptor};
use crate::keys::{index_prefix, prefix, CF_INDEX};
use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use themis_core::error::{Result, ThemisError};
use themis_core::limits::{BM25_B, BM25_K1};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};

fn analyzer_of(descriptor: &IndexDescriptor) -> Result<&AnalyzerConfig> {
    match &descriptor.config {
        IndexConfig::Fulltext(cfg) => Ok(cfg),
        _ => Err(ThemisError::internal(format!(
            "index '{}' is not a fulltext index",
            descriptor.name
        ))),
    }
}

fn posting_key(name: &str, term: &str, pk: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::FULLTEXT, name);
    key.extend_from_slice(term.as_bytes());
    key.push(0);
    key.extend_from_slice(pk.as_bytes());
    key
}

fn doc_key(name: &str, pk: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::FT_DOC, name);
    key.extend_from_slice(pk.as_bytes());
    key
}

fn term_key(name: &str, term: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::FT_TERM, name);
    key.extend_from_slice(term.as_bytes());
    key
}

fn stat_key(name: &str) -> Vec<u8> {
    format!("{}:{}", prefix::FT_STAT, name).into_bytes()
}

fn term_counts(cfg: &AnalyzerConfig, text: &str) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for token in cfg.analyze(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    counts
}

fn field_text<'v>(descriptor: &IndexDescriptor, value: &'v Value) -> Option<&'v str> {
    value.get_path(&descriptor.fields[0]).and_then(Value::as_str)
}

fn read_u32(txn: &StoreTxn, key: &[u8]) -> u32 {
    txn.get(CF_INDEX, key)
        .map(|v| LittleEndian::read_u32(&v))
        .unwrap_or(0)
}

fn read_u64(txn: &StoreTxn, key: &[u8]) -> u64 {
    txn.get(CF_INDEX, key)
        .map(|v| LittleEndian::read_u64(&v))
        .unwrap_or(0)
}

fn write_u32(txn: &mut StoreTxn, key: &[u8], value: u32) -> Result<()> {
    if value == 0 {
        txn.delete(CF_INDEX, key)
    } else {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        txn.put(CF_INDEX, key, &buf)
    }
}

fn write_u64(txn: &mut StoreTxn, key: &[u8], value: u64) -> Result<()> {
    if value == 0 {
        txn.delete(CF_INDEX, key)
    } else {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        txn.put(CF_INDEX, key, &buf)
    }
}

/// Corpus statistics: live document count and summed document length.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorpusStats {
    /// Documents with at least one indexed token.
    pub doc_count: u64,
    /// Sum of document lengths, in tokens.
    pub total_len: u64,
}

impl CorpusStats {
    fn read(txn: &StoreTxn, name: &str) -> Self {
        match txn.get(CF_INDEX, &stat_key(name)) {
            Some(v) if v.len() >= 16 => CorpusStats {
                doc_count: LittleEndian::read_u64(&v[..8]),
                total_len: LittleEndian::read_u64(&v[8..16]),
            },
            _ => CorpusStats::default(),
        }
    }

    fn read_snapshot(store: &Store, snapshot: &Snapshot, name: &str) -> Self {
        match store.get(CF_INDEX, &stat_key(name), snapshot) {
            Some(v) if v.len() >= 16 => CorpusStats {
                doc_count: LittleEndian::read_u64(&v[..8]),
                total_len: LittleEndian::read_u64(&v[8..16]),
            },
            _ => CorpusStats::default(),
        }
    }

    fn write(&self, txn: &mut StoreTxn, name: &str) -> Result<()> {
        if self.doc_count == 0 && self.total_len == 0 {
            return txn.delete(CF_INDEX, &stat_key(name));
        }
        let mut buf = [0u8; 16];
        LittleEndian::write_u64(&mut buf[..8], self.doc_count);
        LittleEndian::write_u64(&mut buf[8..], self.total_len);
        txn.put(CF_INDEX, &stat_key(name), &buf)
    }

    /// Average document length, floored at 1 to keep BM25 finite.
    pub fn avg_doc_len(&self) -> f64 {
        if self.doc_count == 0 {
            1.0
        } else {
            (self.total_len as f64 / self.doc_count as f64).max(1.0)
        }
    }
}

/// Stage the posting-list mutation for one record change.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let cfg = analyzer_of(descriptor)?;
    let name = &descriptor.name;
    let old_counts = before
        .and_then(|v| field_text(descriptor, v))
        .map(|text| term_counts(cfg, text))
        .unwrap_or_default();
    let new_counts = after
        .and_then(|v| field_text(descriptor, v))
        .map(|text| term_counts(cfg, text))
        .unwrap_or_default();
    if old_counts == new_counts {
        return Ok(());
    }

    let mut stats = CorpusStats::read(txn, name);

    // Removed or changed terms.
    for (term, old_tf) in &old_counts {
        let new_tf = new_counts.get(term).copied().unwrap_or(0);
        if new_tf == *old_tf {
            continue;
        }
        write_u32(txn, &posting_key(name, term, pk), new_tf)?;
        if new_tf == 0 {
            let df = read_u64(txn, &term_key(name, term));
            write_u64(txn, &term_key(name, term), df.saturating_sub(1))?;
        }
    }
    // Newly added terms.
    for (term, new_tf) in &new_counts {
        if old_counts.contains_key(term) {
            continue;
        }
        write_u32(txn, &posting_key(name, term, pk), *new_tf)?;
        let df = read_u64(txn, &term_key(name, term));
        write_u64(txn, &term_key(name, term), df + 1)?;
    }

    // Document length and corpus stats.
    let old_len: u32 = old_counts.values().sum();
    let new_len: u32 = new_counts.values().sum();
    write_u32(txn, &doc_key(name, pk), new_len)?;
    if old_len == 0 && new_len > 0 {
        stats.doc_count += 1;
    } else if old_len > 0 && new_len == 0 {
        stats.doc_count = stats.doc_count.saturating_sub(1);
    }
    stats.total_len = stats.total_len.saturating_sub(old_len as u64) + new_len as u64;
    stats.write(txn, name)?;
    Ok(())
}

/// A scored fulltext hit.
#[derive(Debug, Clone, PartialEq)]
pub struct FulltextHit {
    /// Primary key.
    pub pk: String,
    /// BM25 score (higher is better).
    pub score: f64,
}

/// Search the index: analyze the query, intersect posting lists of all
/// terms, score the intersection with BM25, and return hits sorted by
/// descending score (pk ascending on ties), truncated to `limit`.
pub fn search(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    query: &str,
    limit: usize,
) -> Result<Vec<FulltextHit>> {
    let cfg = analyzer_of(descriptor)?;
    let name = &descriptor.name;
    let mut terms: Vec<String> = Vec::new();
    for t in cfg.analyze(query) {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let stats = CorpusStats::read_snapshot(store, snapshot, name);
    if stats.doc_count == 0 {
        return Ok(Vec::new());
    }
    let n = stats.doc_count as f64;
    let avgdl = stats.avg_doc_len();

    // Posting map per term, plus its document frequency for IDF.
    let mut per_term: Vec<(f64, FxHashMap<String, u32>)> = Vec::with_capacity(terms.len());
    for term in &terms {
        let mut probe = index_prefix(prefix::FULLTEXT, name);
        probe.extend_from_slice(term.as_bytes());
        probe.push(0);
        let prefix_len = probe.len();
        let mut postings = FxHashMap::default();
        for (key, value) in store.prefix_iter(CF_INDEX, &probe, snapshot, Direction::Forward) {
            let pk = String::from_utf8_lossy(&key[prefix_len..]).into_owned();
            postings.insert(pk, LittleEndian::read_u32(&value));
        }
        if postings.is_empty() {
            // One empty term empties the whole intersection.
            return Ok(Vec::new());
        }
        let df = postings.len() as f64;
        // IDF with the usual smoothing, never negative.
        let idf = (((n - df + 0.5) / (df + 0.5)) + 1.0).ln();
        per_term.push((idf, postings));
    }

    // Intersect, driving from the rarest term.
    per_term.sort_by(|a, b| a.1.len().cmp(&b.1.len()));
    let (first_idf, first) = &per_term[0];
    let mut hits = Vec::new();
    'candidates: for (pk, tf0) in first {
        let doc_len = store
            .get(CF_INDEX, &doc_key(name, pk), snapshot)
            .map(|v| LittleEndian::read_u32(&v))
            .unwrap_or(0) as f64;
        let norm = |tf: f64| {
            (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avgdl))
        };
        let mut score = first_idf * norm(*tf0 as f64);
        for (idf, postings) in &per_term[1..] {
            match postings.get(pk) {
                Some(tf) => score += idf * norm(*tf as f64),
                None => continue 'candidates,
            }
        }
        hits.push(FulltextHit {
            pk: pk.clone(),
            score,
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pk.cmp(&b.pk))
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Document frequency of the rarest query term, capped. The optimizer's
/// selectivity probe for `FULLTEXT` predicates.
pub fn probe_count(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    query: &str,
    cap: usize,
) -> Result<usize> {
    let cfg = analyzer_of(descriptor)?;
    let mut min_df = usize::MAX;
    for term in cfg.analyze(query) {
        let df = store
            .get(CF_INDEX, &term_key(&descriptor.name, &term), snapshot)
            .map(|v| LittleEndian::read_u64(&v) as usize)
            .unwrap_or(0);
        min_df = min_df.min(df);
    }
    if min_df == usize::MAX {
        min_df = 0;
    }
    Ok(min_df.min(cap))
}
