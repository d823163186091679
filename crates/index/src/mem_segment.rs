//! In-memory brute-force index kernel.
//!
//! One segment stores, per primary key, the packed feature blob of every
//! index column plus the serialized forward tuple. Search is an exact scan
//! with squared Euclidean distance (score ascending, smaller is better).
//! Deletes are tombstones; `optimize` rewrites the segment without them.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use quiver_core::error::{Error, Result};
use quiver_core::meta::ColumnMeta;
use quiver_core::vector::unpack_to_f32;

use crate::segment::{QueryParams, QueryResult, Segment};

/// One stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEntry {
    /// Packed feature blob per index column, schema order
    pub features: Vec<Vec<u8>>,
    /// Serialized forward tuple
    pub forward_data: Vec<u8>,
    /// Schema revision of the write
    pub revision: u64,
    /// Log sequence number of the write
    pub lsn: u64,
}

/// Serializable image of a segment, written by `flush`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    /// Segment identifier
    pub segment_id: u64,
    /// Live and tombstoned rows
    pub rows: BTreeMap<u64, RowEntry>,
    /// Tombstoned keys
    pub deleted: BTreeSet<u64>,
}

struct Rows {
    entries: BTreeMap<u64, RowEntry>,
    deleted: BTreeSet<u64>,
}

/// Brute-force kernel segment.
pub struct MemSegment {
    segment_id: u64,
    columns: Vec<ColumnMeta>,
    rows: RwLock<Rows>,
}

impl MemSegment {
    /// Empty segment for the given index columns.
    pub fn new(segment_id: u64, columns: Vec<ColumnMeta>) -> Self {
        MemSegment {
            segment_id,
            columns,
            rows: RwLock::new(Rows {
                entries: BTreeMap::new(),
                deleted: BTreeSet::new(),
            }),
        }
    }

    /// Rebuild a segment from a flushed snapshot.
    pub fn from_snapshot(snapshot: SegmentSnapshot, columns: Vec<ColumnMeta>) -> Self {
        MemSegment {
            segment_id: snapshot.segment_id,
            columns,
            rows: RwLock::new(Rows {
                entries: snapshot.rows,
                deleted: snapshot.deleted,
            }),
        }
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> SegmentSnapshot {
        let rows = self.rows.read();
        SegmentSnapshot {
            segment_id: self.segment_id,
            rows: rows.entries.clone(),
            deleted: rows.deleted.clone(),
        }
    }

    /// Insert or overwrite a row.
    pub fn insert(&self, primary_key: u64, entry: RowEntry) -> Result<()> {
        if entry.features.len() != self.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "row has {} index values, segment expects {}",
                entry.features.len(),
                self.columns.len()
            )));
        }
        let mut rows = self.rows.write();
        rows.deleted.remove(&primary_key);
        rows.entries.insert(primary_key, entry);
        Ok(())
    }

    /// Tombstone a row; returns whether it was present and live.
    pub fn remove(&self, primary_key: u64) -> bool {
        let mut rows = self.rows.write();
        if rows.entries.contains_key(&primary_key) && !rows.deleted.contains(&primary_key) {
            rows.deleted.insert(primary_key);
            true
        } else {
            false
        }
    }

    /// Whether the key is addressed and live.
    pub fn contains(&self, primary_key: u64) -> bool {
        let rows = self.rows.read();
        rows.entries.contains_key(&primary_key) && !rows.deleted.contains(&primary_key)
    }

    /// Live rows (excludes tombstones).
    pub fn live_count(&self) -> u64 {
        let rows = self.rows.read();
        (rows.entries.len() - rows.deleted.len()) as u64
    }

    /// Rewrite the segment without tombstoned rows.
    pub fn optimize(&self) {
        let mut rows = self.rows.write();
        if rows.deleted.is_empty() {
            return;
        }
        let deleted = std::mem::take(&mut rows.deleted);
        rows.entries.retain(|pk, _| !deleted.contains(pk));
        debug!(
            segment_id = self.segment_id,
            removed = deleted.len(),
            "segment optimized"
        );
    }

    fn column_position(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| Error::InexistentColumn(column.to_string()))
    }
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl Segment for MemSegment {
    fn segment_id(&self) -> u64 {
        self.segment_id
    }

    fn doc_count(&self) -> u64 {
        self.rows.read().entries.len() as u64
    }

    fn knn_search(
        &self,
        column: &str,
        features: &[u8],
        params: &QueryParams,
        batch: u32,
    ) -> Result<Vec<Vec<QueryResult>>> {
        let position = self.column_position(column)?;
        let meta = &self.columns[position];
        let vector_size = meta.vector_size();
        if vector_size == 0 || features.len() != vector_size * batch as usize {
            return Err(Error::InvalidVectorFormat(format!(
                "feature bytes {} do not cover batch {} of {}-byte vectors",
                features.len(),
                batch,
                vector_size
            )));
        }

        let rows = self.rows.read();
        let mut results = Vec::with_capacity(batch as usize);
        for b in 0..batch as usize {
            let query_blob = &features[b * vector_size..(b + 1) * vector_size];
            let query = unpack_to_f32(query_blob, meta.data_type).ok_or(Error::MismatchedDataType)?;

            let mut hits: Vec<QueryResult> = Vec::new();
            for (pk, entry) in rows.entries.iter() {
                if rows.deleted.contains(pk) {
                    continue;
                }
                let stored = match unpack_to_f32(&entry.features[position], meta.data_type) {
                    Some(v) => v,
                    None => continue,
                };
                let score = squared_euclidean(&query, &stored);
                if params.radius > 0.0 && score > params.radius {
                    continue;
                }
                hits.push(QueryResult {
                    primary_key: *pk,
                    score,
                    revision: entry.revision,
                    lsn: entry.lsn,
                    forward_data: entry.forward_data.clone(),
                });
            }
            hits.sort_by(|a, b| a.cmp_rank(b));
            hits.truncate(params.topk as usize);
            results.push(hits);
        }
        Ok(results)
    }

    fn kv_search(&self, primary_key: u64) -> Result<Option<QueryResult>> {
        let rows = self.rows.read();
        if rows.deleted.contains(&primary_key) {
            return Ok(None);
        }
        Ok(rows.entries.get(&primary_key).map(|entry| QueryResult {
            primary_key,
            score: 0.0,
            revision: entry.revision,
            lsn: entry.lsn,
            forward_data: entry.forward_data.clone(),
        }))
    }
}
