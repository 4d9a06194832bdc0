//! Snapshot files, manifests, and checkpoint archives.
//!
//! The on-disk layout of a data (or checkpoint) directory:
//!
//! ```text
//! MANIFEST.json     format version, snapshot sequence, content hash
//! snapshot.bin.zst  bincode full state, zstd-compressed
//! wal.log           commit records past the snapshot barrier
//! LOCK              advisory lock file
//! ```
//!
//! A checkpoint directory is the same layout minus the WAL (its state is
//! already folded into the snapshot), so it can be opened in place or
//! copied over a fresh directory to restore. `export_archive` wraps a
//! checkpoint into a single tar file for transport.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use themis_core::error::{Result, ThemisError};
use tracing::info;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "MANIFEST.json";
/// Snapshot file name.
pub const SNAPSHOT_FILE: &str = "snapshot.bin.zst";
/// WAL file name.
pub const WAL_FILE: &str = "wal.log";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Directory manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Layout version of the directory.
    pub format_version: u32,
    /// Commit sequence the snapshot file captures.
    pub snapshot_seq: u64,
    /// xxh3 of the compressed snapshot file.
    pub snapshot_hash: u64,
}

/// Full-state payload of a snapshot file: per column family, the live
/// `(key, value)` pairs at the snapshot sequence.
pub type SnapshotState = Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>;

/// Write the snapshot file and manifest into `dir`.
pub fn write_snapshot_file(
    dir: &Path,
    seq: u64,
    state: &SnapshotState,
    compression_level: i32,
) -> Result<()> {
    let payload = bincode::serialize(state)?;
    let compressed = zstd::encode_all(&payload[..], compression_level)
        .map_err(|e| ThemisError::storage_with_source("snapshot compression failed", e))?;
    let hash = xxhash_rust::xxh3::xxh3_64(&compressed);

    // Write-then-rename so a crash mid-write never leaves a half
    // snapshot behind the manifest.
    let tmp = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&compressed)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        snapshot_seq: seq,
        snapshot_hash: hash,
    };
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
    std::fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
    Ok(())
}

/// Read the manifest of `dir`, if one exists.
pub fn read_manifest(dir: &Path) -> Result<Option<Manifest>> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    let manifest: Manifest = serde_json::from_slice(&bytes)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(ThemisError::storage(format!(
            "unsupported on-disk format version {}",
            manifest.format_version
        )));
    }
    Ok(Some(manifest))
}

/// Load the snapshot file referenced by the manifest of `dir`. Returns
/// `None` for a fresh directory; a hash mismatch is corruption.
pub fn load_snapshot_file(dir: &Path) -> Result<Option<(Manifest, SnapshotState)>> {
    let manifest = match read_manifest(dir)? {
        Some(m) => m,
        None => return Ok(None),
    };
    let path = dir.join(SNAPSHOT_FILE);
    let compressed = std::fs::read(&path)?;
    if xxhash_rust::xxh3::xxh3_64(&compressed) != manifest.snapshot_hash {
        return Err(ThemisError::storage(format!(
            "snapshot file {} fails its manifest hash",
            path.display()
        )));
    }
    let payload = zstd::decode_all(&compressed[..])
        .map_err(|e| ThemisError::storage_with_source("snapshot decompression failed", e))?;
    let state: SnapshotState = bincode::deserialize(&payload)?;
    Ok(Some((manifest, state)))
}

/// Copy checkpoint files into a fresh directory. Refuses to overwrite an
/// existing store.
pub fn restore_files(checkpoint_dir: &Path, dest: &Path) -> Result<()> {
    if read_manifest(checkpoint_dir)?.is_none() {
        return Err(ThemisError::not_found(format!(
            "checkpoint at {}",
            checkpoint_dir.display()
        )));
    }
    if dest.join(MANIFEST_FILE).exists() {
        return Err(ThemisError::storage(format!(
            "destination {} already contains a store",
            dest.display()
        )));
    }
    std::fs::create_dir_all(dest)?;
    for name in [MANIFEST_FILE, SNAPSHOT_FILE] {
        std::fs::copy(checkpoint_dir.join(name), dest.join(name))?;
    }
    info!(from = %checkpoint_dir.display(), to = %dest.display(), "checkpoint restored");
    Ok(())
}

/// Bundle a checkpoint directory into a single tar archive.
pub fn export_archive(checkpoint_dir: &Path, archive_path: &Path) -> Result<()> {
    if read_manifest(checkpoint_dir)?.is_none() {
        return Err(ThemisError::not_found(format!(
            "checkpoint at {}",
            checkpoint_dir.display()
        )));
    }
    let file = File::create(archive_path)?;
    let mut builder = tar::Builder::new(file);
    for name in [MANIFEST_FILE, SNAPSHOT_FILE] {
        let mut f = File::open(checkpoint_dir.join(name))?;
        builder.append_file(name, &mut f)?;
    }
    builder.into_inner()?.sync_data()?;
    Ok(())
}

/// Unpack a checkpoint archive into `dest` (a fresh directory).
pub fn import_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    if dest.join(MANIFEST_FILE).exists() {
        return Err(ThemisError::storage(format!(
            "destination {} already contains a store",
            dest.display()
        )));
    }
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry
            .path()?
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ThemisError::storage("archive entry without a file name"))?;
        if name != MANIFEST_FILE && name != SNAPSHOT_FILE {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        std::fs::write(dest.join(&name), bytes)?;
    }
    if read_manifest(dest)?.is_none() {
        return Err(ThemisError::storage("archive did not contain a manifest"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> SnapshotState {
        vec![
            (
                "entities".to_string(),
                vec![
                    (b"users:1".to_vec(), b"alice".to_vec()),
                    (b"users:2".to_vec(), b"bob".to_vec()),
                ],
            ),
            ("index".to_string(), vec![(b"idx:a:1".to_vec(), vec![])]),
        ]
    }

    #[test]
    fn test_snapshot_file_round_trip() {
        let dir = TempDir::new().unwrap();
        write_snapshot_file(dir.path(), 7, &sample_state(), 1).unwrap();
        let (manifest, state) = load_snapshot_file(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.snapshot_seq, 7);
        assert_eq!(state, sample_state());
    }

    #[test]
    fn test_missing_manifest_reads_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_snapshot_file(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_hash_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        write_snapshot_file(dir.path(), 1, &sample_state(), 1).unwrap();
        // Flip one byte of the snapshot file.
        let path = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            load_snapshot_file(dir.path()),
            Err(ThemisError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_restore_refuses_overwrite() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_snapshot_file(src.path(), 1, &sample_state(), 1).unwrap();
        write_snapshot_file(dst.path(), 2, &sample_state(), 1).unwrap();
        assert!(restore_files(src.path(), dst.path()).is_err());
    }

    #[test]
    fn test_archive_round_trip() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_snapshot_file(src.path(), 5, &sample_state(), 3).unwrap();

        let archive = out.path().join("backup.tar");
        export_archive(src.path(), &archive).unwrap();

        let dest = out.path().join("restored");
        import_archive(&archive, &dest).unwrap();
        let (manifest, state) = load_snapshot_file(&dest).unwrap().unwrap();
        assert_eq!(manifest.snapshot_seq, 5);
        assert_eq!(state, sample_state());
    }
}
