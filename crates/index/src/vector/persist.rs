//! The vector persistence triple: `meta.txt`, `labels.txt`, `index.bin`.
//!
//! `meta.txt` is human-readable `key=value` lines (dimension, metric,
//! M, efConstruction); `labels.txt` maps dense labels to pks, one per
//! line; `index.bin` is the bincode dump of the HNSW graph. Readers
//! refuse a triple whose meta disagrees with the index configuration —
//! a mismatched triple is stale state from an older create, never
//! something to silently reinterpret.

use super::hnsw::{Hnsw, HnswDump};
use super::VectorConfig;
use std::io::Write;
use std::path::Path;
use themis_core::error::{Result, ThemisError};
use tracing::warn;

const META_FILE: &str = "meta.txt";
const LABELS_FILE: &str = "labels.txt";
const INDEX_FILE: &str = "index.bin";

/// Write the triple atomically enough for a single writer: temp files
/// renamed into place, meta last so a torn save is detected as absent.
pub fn save(dir: &Path, dump: &HnswDump, labels: &[String]) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let index_tmp = dir.join(format!("{}.tmp", INDEX_FILE));
    std::fs::write(&index_tmp, bincode::serialize(dump)?)?;
    std::fs::rename(&index_tmp, dir.join(INDEX_FILE))?;

    let labels_tmp = dir.join(format!("{}.tmp", LABELS_FILE));
    {
        let mut file = std::fs::File::create(&labels_tmp)?;
        for pk in labels {
            writeln!(file, "{}", pk)?;
        }
        file.sync_data()?;
    }
    std::fs::rename(&labels_tmp, dir.join(LABELS_FILE))?;

    let meta_tmp = dir.join(format!("{}.tmp", META_FILE));
    std::fs::write(
        &meta_tmp,
        format!(
            "dim={}\nmetric={}\nm={}\nef_construction={}\n",
            dump.dim,
            dump.metric.name(),
            dump.m,
            dump.ef_construction
        ),
    )?;
    std::fs::rename(&meta_tmp, dir.join(META_FILE))?;
    Ok(())
}

/// Load the triple. Returns `None` when no complete triple exists;
/// fails when the meta disagrees with `expected`.
pub fn load(dir: &Path, expected: &VectorConfig) -> Result<Option<(Hnsw, Vec<String>)>> {
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta = std::fs::read_to_string(&meta_path)?;
    let mut dim = None;
    let mut metric = None;
    let mut m = None;
    let mut ef_construction = None;
    for line in meta.lines() {
        match line.split_once('=') {
            Some(("dim", v)) => dim = v.trim().parse::<usize>().ok(),
            Some(("metric", v)) => metric = Some(v.trim().to_string()),
            Some(("m", v)) => m = v.trim().parse::<usize>().ok(),
            Some(("ef_construction", v)) => ef_construction = v.trim().parse::<usize>().ok(),
            _ => {}
        }
    }
    let (dim, metric, m, ef_construction) = match (dim, metric, m, ef_construction) {
        (Some(d), Some(met), Some(m), Some(efc)) => (d, met, m, efc),
        _ => {
            return Err(ThemisError::storage(format!(
                "vector meta file {} is incomplete",
                meta_path.display()
            )))
        }
    };
    if dim != expected.dim
        || metric != expected.metric.name()
        || m != expected.m
        || ef_construction != expected.ef_construction
    {
        return Err(ThemisError::storage(format!(
            "vector triple in {} was written with dim={} metric={} M={} efConstruction={}, \
             which does not match the index configuration",
            dir.display(),
            dim,
            metric,
            m,
            ef_construction
        )));
    }

    let index_path = dir.join(INDEX_FILE);
    let labels_path = dir.join(LABELS_FILE);
    if !index_path.exists() || !labels_path.exists() {
        warn!(dir = %dir.display(), "vector triple incomplete; falling back to rebuild");
        return Ok(None);
    }
    let dump: HnswDump = bincode::deserialize(&std::fs::read(&index_path)?)?;
    let labels: Vec<String> = std::fs::read_to_string(&labels_path)?
        .lines()
        .map(str::to_string)
        .collect();
    Ok(Some((Hnsw::from_dump(dump), labels)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::hnsw::Metric;
    use tempfile::TempDir;

    fn sample() -> (Hnsw, Vec<String>) {
        let mut hnsw = Hnsw::new(3, Metric::L2, 8, 32);
        let mut labels = Vec::new();
        for i in 0..20 {
            hnsw.insert(vec![i as f32, 0.0, 1.0]).unwrap();
            labels.push(format!("docs:{}", i));
        }
        (hnsw, labels)
    }

    fn config() -> VectorConfig {
        VectorConfig {
            m: 8,
            ef_construction: 32,
            ..VectorConfig::new(3, Metric::L2)
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let (hnsw, labels) = sample();
        save(dir.path(), &hnsw.dump(), &labels).unwrap();

        let (loaded, loaded_labels) = load(dir.path(), &config()).unwrap().unwrap();
        assert_eq!(loaded.len(), 20);
        assert_eq!(loaded_labels, labels);

        let query = [7.2f32, 0.0, 1.0];
        assert_eq!(
            hnsw.search(&query, 5, 32, None, None).unwrap(),
            loaded.search(&query, 5, 32, None, None).unwrap()
        );
    }

    #[test]
    fn test_missing_triple_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path(), &config()).unwrap().is_none());
    }

    #[test]
    fn test_meta_mismatch_refused() {
        let dir = TempDir::new().unwrap();
        let (hnsw, labels) = sample();
        save(dir.path(), &hnsw.dump(), &labels).unwrap();

        let mut wrong_dim = config();
        wrong_dim.dim = 4;
        assert!(load(dir.path(), &wrong_dim).is_err());

        let mut wrong_metric = config();
        wrong_metric.metric = Metric::Cosine;
        assert!(load(dir.path(), &wrong_metric).is_err());

        let mut wrong_m = config();
        wrong_m.m = 16;
        assert!(load(dir.path(), &wrong_m).is_err());
    }

    #[test]
    fn test_partial_triple_falls_back_to_rebuild() {
        let dir = TempDir::new().unwrap();
        let (hnsw, labels) = sample();
        save(dir.path(), &hnsw.dump(), &labels).unwrap();
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();
        assert!(load(dir.path(), &config()).unwrap().is_none());
    }
}
