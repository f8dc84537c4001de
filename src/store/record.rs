//! Compact index records and the deterministic index builder.
//!
//! Ids are dense `0..N` and are assigned by sorting metadata rows on
//! `(shard_index, byte_offset)`.  The same metadata table therefore always
//! yields the same id for the same clip, which is what lets the ledger be
//! joined against the index across separate runs.

use std::ops::Range;

use super::IndexError;

// ---------------------------------------------------------------------------
// MetadataRow
// ---------------------------------------------------------------------------

/// One row of the metadata table, as read from disk and before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRow {
    pub shard_index: i64,
    pub byte_offset: i64,
    pub byte_size: i64,
    pub sample_rate: Option<i64>,
    pub channels: Option<i64>,
}

// ---------------------------------------------------------------------------
// ShardRecord
// ---------------------------------------------------------------------------

/// Location of one clip inside the shard set.
///
/// `declared_sample_rate` and `channel_count` come straight from the
/// metadata table and are `None` when the table does not carry them (or
/// carries a non-positive value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRecord {
    pub id: u64,
    pub shard_index: u32,
    pub byte_offset: u64,
    pub byte_size: u64,
    pub declared_sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
}

impl ShardRecord {
    /// Exclusive end offset, or `None` if `offset + size` overflows.
    pub fn byte_end(&self) -> Option<u64> {
        self.byte_offset.checked_add(self.byte_size)
    }
}

// ---------------------------------------------------------------------------
// ShardIndex
// ---------------------------------------------------------------------------

/// Id-ordered list of [`ShardRecord`]s; `records[i].id == i`.
#[derive(Debug, Clone, Default)]
pub struct ShardIndex {
    records: Vec<ShardRecord>,
}

impl ShardIndex {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&ShardRecord> {
        usize::try_from(id).ok().and_then(|i| self.records.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRecord> {
        self.records.iter()
    }

    /// Clamp `[start, end)` to the index; `end = None` means "to the last id".
    pub fn clamp_range(&self, start: u64, end: Option<u64>) -> Range<u64> {
        let len = self.records.len() as u64;
        let end = end.map_or(len, |e| e.min(len));
        start..end
    }
}

// ---------------------------------------------------------------------------
// build_index
// ---------------------------------------------------------------------------

/// Sort metadata rows by `(shard_index, byte_offset)` and assign dense ids.
///
/// The sort is stable, so rows sharing the same key keep their table order
/// and the id assignment stays reproducible.
///
/// # Errors
///
/// [`IndexError::InvalidRow`] when a required value is negative or does not
/// fit the record's field width.  The row number refers to the table order.
pub fn build_index(rows: Vec<MetadataRow>) -> Result<ShardIndex, IndexError> {
    let mut keyed: Vec<(usize, MetadataRow)> = rows.into_iter().enumerate().collect();
    keyed.sort_by_key(|(_, r)| (r.shard_index, r.byte_offset));

    let mut records = Vec::with_capacity(keyed.len());
    for (id, (row_no, row)) in keyed.into_iter().enumerate() {
        let shard_index = u32::try_from(row.shard_index).map_err(|_| IndexError::InvalidRow {
            row: row_no,
            reason: format!("shard index {} out of range", row.shard_index),
        })?;
        let byte_offset = u64::try_from(row.byte_offset).map_err(|_| IndexError::InvalidRow {
            row: row_no,
            reason: format!("negative byte offset {}", row.byte_offset),
        })?;
        let byte_size = u64::try_from(row.byte_size).map_err(|_| IndexError::InvalidRow {
            row: row_no,
            reason: format!("negative byte size {}", row.byte_size),
        })?;

        records.push(ShardRecord {
            id: id as u64,
            shard_index,
            byte_offset,
            byte_size,
            declared_sample_rate: known(row.sample_rate),
            channel_count: known(row.channels),
        });
    }

    Ok(ShardIndex { records })
}

/// Optional metadata values: anything missing or non-positive is unknown.
fn known(value: Option<i64>) -> Option<u32> {
    value
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row(shard: i64, offset: i64, size: i64) -> MetadataRow {
        MetadataRow {
            shard_index: shard,
            byte_offset: offset,
            byte_size: size,
            sample_rate: Some(16_000),
            channels: Some(1),
        }
    }

    #[test]
    fn ids_follow_shard_then_offset_order() {
        let rows = vec![row(1, 0, 10), row(0, 50, 5), row(0, 0, 50), row(1, 10, 3)];
        let index = build_index(rows).unwrap();

        let keys: Vec<(u32, u64)> = index.iter().map(|r| (r.shard_index, r.byte_offset)).collect();
        assert_eq!(keys, vec![(0, 0), (0, 50), (1, 0), (1, 10)]);
        for (i, rec) in index.iter().enumerate() {
            assert_eq!(rec.id, i as u64);
        }
    }

    #[test]
    fn rebuild_from_shuffled_rows_is_identical() {
        let a = vec![row(2, 7, 1), row(0, 3, 2), row(1, 0, 9), row(0, 0, 3)];
        let mut b = a.clone();
        b.reverse();

        let ia = build_index(a).unwrap();
        let ib = build_index(b).unwrap();
        let va: Vec<_> = ia.iter().copied().collect();
        let vb: Vec<_> = ib.iter().copied().collect();
        assert_eq!(va, vb);
    }

    #[test]
    fn missing_optional_columns_are_unknown() {
        let rows = vec![MetadataRow {
            shard_index: 0,
            byte_offset: 0,
            byte_size: 4,
            sample_rate: None,
            channels: Some(-1),
        }];
        let index = build_index(rows).unwrap();
        let rec = index.get(0).unwrap();
        assert_eq!(rec.declared_sample_rate, None);
        assert_eq!(rec.channel_count, None);
    }

    #[test]
    fn negative_offset_is_rejected() {
        let err = build_index(vec![row(0, 0, 4), row(0, -8, 4)]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidRow { row: 1, .. }), "{err:?}");
    }

    #[test]
    fn clamp_range_limits_end_to_len() {
        let index = build_index(vec![row(0, 0, 1), row(0, 1, 1), row(0, 2, 1)]).unwrap();
        assert_eq!(index.clamp_range(0, None), 0..3);
        assert_eq!(index.clamp_range(1, Some(100)), 1..3);
        assert_eq!(index.clamp_range(0, Some(2)), 0..2);
        assert!(index.get(3).is_none());
    }
}
