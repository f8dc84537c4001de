//! Memory-mapped, read-only shard set.
//!
//! [`ShardStore`] is the single owner of every mapping for the lifetime of a
//! run.  Workers hold it behind an `Arc` and receive `&[u8]` views borrowed
//! from it; nothing is copied out of the page cache until the request body
//! is encoded.  Dropping the store (or calling [`ShardStore::close`])
//! releases every mapping exactly once.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::{ShardIndex, ShardRecord, StoreError};

// ---------------------------------------------------------------------------
// Shard discovery
// ---------------------------------------------------------------------------

/// List `<prefix><n><suffix>` files in `dir`, ordered by their numeric `n`.
///
/// Files whose middle part is not a number are ignored.
///
/// # Errors
///
/// [`StoreError::NoShards`] when nothing matches, [`StoreError::Open`] when
/// the directory cannot be read.
pub fn discover_shards(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>, StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Open {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        match middle.parse::<u64>() {
            Ok(n) => numbered.push((n, entry.path())),
            Err(_) => log::debug!("store: ignoring non-numbered shard name {name}"),
        }
    }

    if numbered.is_empty() {
        return Err(StoreError::NoShards {
            dir: dir.to_path_buf(),
            pattern: format!("{prefix}*{suffix}"),
        });
    }

    numbered.sort();
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

// ---------------------------------------------------------------------------
// ShardStore
// ---------------------------------------------------------------------------

struct Shard {
    path: PathBuf,
    map: Mmap,
}

/// Read-only random access over an ordered set of shard files.
pub struct ShardStore {
    shards: Vec<Shard>,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl ShardStore {
    /// Map every file in `paths`; shard `i` of the index is `paths[i]`.
    ///
    /// If any file fails, the mappings acquired so far are dropped before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NoShards`]: `paths` is empty.
    /// - [`StoreError::Open`] / [`StoreError::Map`]: a file could not be
    ///   opened or mapped.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, StoreError> {
        if paths.is_empty() {
            return Err(StoreError::NoShards {
                dir: PathBuf::new(),
                pattern: String::new(),
            });
        }

        let mut shards = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path).map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            // SAFETY: shard files are append-only blobs that are never
            // modified or truncated while a run is reading them.
            let map = unsafe { Mmap::map(&file) }.map_err(|source| StoreError::Map {
                path: path.to_path_buf(),
                source,
            })?;
            shards.push(Shard {
                path: path.to_path_buf(),
                map,
            });
        }

        log::info!("store: mapped {} shard files", shards.len());
        Ok(Self { shards })
    }

    /// Discover `<prefix><n><suffix>` files in `dir` and map them.
    pub fn open_dir(dir: &Path, prefix: &str, suffix: &str) -> Result<Self, StoreError> {
        let paths = discover_shards(dir, prefix, suffix)?;
        Self::open(&paths)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Length in bytes of shard `index`, if it exists.
    pub fn shard_len(&self, index: u32) -> Option<u64> {
        self.shards
            .get(index as usize)
            .map(|s| s.map.len() as u64)
    }

    pub fn shard_path(&self, index: u32) -> Option<&Path> {
        self.shards.get(index as usize).map(|s| s.path.as_path())
    }

    /// Zero-copy view of `record`'s bytes.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownShard`] / [`StoreError::OutOfBounds`]: the
    /// record does not describe a range inside the mapped set.  Both mean
    /// the index and the shards disagree; neither is transient.
    pub fn fetch(&self, record: &ShardRecord) -> Result<&[u8], StoreError> {
        let shard = self
            .shards
            .get(record.shard_index as usize)
            .ok_or(StoreError::UnknownShard {
                id: record.id,
                shard: record.shard_index,
                shard_count: self.shards.len(),
            })?;

        let out_of_bounds = || StoreError::OutOfBounds {
            id: record.id,
            shard: record.shard_index,
            offset: record.byte_offset,
            size: record.byte_size,
            shard_len: shard.map.len() as u64,
        };

        let start = usize::try_from(record.byte_offset).map_err(|_| out_of_bounds())?;
        let end = record
            .byte_end()
            .and_then(|e| usize::try_from(e).ok())
            .ok_or_else(out_of_bounds)?;

        shard.map.get(start..end).ok_or_else(out_of_bounds)
    }

    /// Check every record of `index` against the mapped shard set.
    ///
    /// Returns the first mismatch found, in id order.
    pub fn validate(&self, index: &ShardIndex) -> Result<(), StoreError> {
        for record in index.iter() {
            self.fetch(record)?;
        }
        Ok(())
    }

    /// Release every mapping.  Equivalent to dropping the store.
    pub fn close(self) {
        log::debug!("store: unmapping {} shard files", self.shards.len());
        drop(self);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{build_index, MetadataRow};
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn row(shard: i64, offset: i64, size: i64) -> MetadataRow {
        MetadataRow {
            shard_index: shard,
            byte_offset: offset,
            byte_size: size,
            sample_rate: None,
            channels: None,
        }
    }

    fn rec(id: u64, shard: u32, offset: u64, size: u64) -> ShardRecord {
        ShardRecord {
            id,
            shard_index: shard,
            byte_offset: offset,
            byte_size: size,
            declared_sample_rate: None,
            channel_count: None,
        }
    }

    #[test]
    fn discovery_orders_by_numeric_suffix() {
        let dir = tempdir().unwrap();
        write(dir.path(), "arkive_10.bin", b"x");
        write(dir.path(), "arkive_2.bin", b"x");
        write(dir.path(), "arkive_0.bin", b"x");
        write(dir.path(), "arkive_tmp.bin", b"x");
        write(dir.path(), "metadata.parquet", b"x");

        let paths = discover_shards(dir.path(), "arkive_", ".bin").unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["arkive_0.bin", "arkive_2.bin", "arkive_10.bin"]);
    }

    #[test]
    fn discovery_without_shards_fails() {
        let dir = tempdir().unwrap();
        let err = discover_shards(dir.path(), "arkive_", ".bin").unwrap_err();
        assert!(matches!(err, StoreError::NoShards { .. }));
    }

    #[test]
    fn open_empty_list_fails() {
        let paths: Vec<PathBuf> = Vec::new();
        assert!(matches!(
            ShardStore::open(&paths),
            Err(StoreError::NoShards { .. })
        ));
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let good = write(dir.path(), "arkive_0.bin", b"abc");
        let missing = dir.path().join("arkive_1.bin");
        let err = ShardStore::open(&[good, missing]).unwrap_err();
        assert!(matches!(err, StoreError::Open { .. }));
    }

    #[test]
    fn fetch_returns_exact_byte_ranges() {
        let dir = tempdir().unwrap();
        let shard0: Vec<u8> = (0u8..=99).collect();
        let shard1: Vec<u8> = (100u8..=199).rev().collect();
        let p0 = write(dir.path(), "arkive_0.bin", &shard0);
        let p1 = write(dir.path(), "arkive_1.bin", &shard1);
        let store = ShardStore::open(&[p0, p1]).unwrap();

        let index = build_index(vec![
            row(1, 40, 60),
            row(0, 10, 25),
            row(0, 0, 10),
            row(1, 0, 0),
        ])
        .unwrap();
        store.validate(&index).unwrap();

        let sources = [&shard0, &shard1];
        for record in index.iter() {
            let view = store.fetch(record).unwrap();
            let start = record.byte_offset as usize;
            let end = start + record.byte_size as usize;
            assert_eq!(view.len() as u64, record.byte_size);
            assert_eq!(view, &sources[record.shard_index as usize][start..end]);
        }
        assert_eq!(store.shard_len(0), Some(100));
        store.close();
    }

    #[test]
    fn out_of_range_records_are_rejected() {
        let dir = tempdir().unwrap();
        let p0 = write(dir.path(), "arkive_0.bin", &[0u8; 16]);
        let store = ShardStore::open(&[p0]).unwrap();

        assert!(matches!(
            store.fetch(&rec(0, 0, 10, 7)),
            Err(StoreError::OutOfBounds { id: 0, shard_len: 16, .. })
        ));
        assert!(matches!(
            store.fetch(&rec(1, 3, 0, 1)),
            Err(StoreError::UnknownShard { shard: 3, shard_count: 1, .. })
        ));
        assert!(matches!(
            store.fetch(&rec(2, 0, u64::MAX, 2)),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert_eq!(store.fetch(&rec(3, 0, 10, 6)).unwrap().len(), 6);
    }

    #[test]
    fn store_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ShardStore>();
    }
}
