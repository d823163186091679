//! Collection: ordered segments plus a schema revision.
//!
//! Writes are serialized by a single-writer mutex and land in the latest
//! segment; when it reaches the schema's capacity threshold a new segment is
//! rolled. Reads enumerate every segment; the query engine fans out.
//!
//! On-disk layout under `<index_dir>/<name>/`:
//! - `manifest`: JSON with a magic number, the schema, and the segment ids
//! - `segment_<id>.seg`: bincode snapshot per segment, written by `flush`

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use quiver_core::error::{Error, Result};
use quiver_core::meta::CollectionMeta;
use quiver_core::proto::{CollectionDataset, RowOperation};
use quiver_core::value::{Value, INVALID_PRIMARY_KEY};

use crate::mem_segment::{MemSegment, RowEntry, SegmentSnapshot};
use crate::segment::{Segment, SegmentRef};

const MANIFEST_MAGIC: u32 = 0x5156_4952;
/// Name of the manifest file; its presence marks an existing index.
pub const MANIFEST_FILE: &str = "manifest";

#[derive(Serialize, Deserialize)]
struct Manifest {
    magic: u32,
    name: String,
    meta: CollectionMeta,
    segment_ids: Vec<u64>,
}

/// Point-in-time statistics of a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Collection name
    pub collection_name: String,
    /// Documents addressed across all segments
    pub total_doc_count: u64,
    /// Number of segments
    pub segment_count: u64,
    /// Latest observed log sequence number
    pub latest_lsn: u64,
    /// Serialized LSN context of the latest write
    pub latest_lsn_context: String,
}

/// Options controlling how a collection is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Create fresh on-disk state instead of loading
    pub create_new: bool,
    /// Read snapshots through mmap (kernel hint)
    pub use_mmap: bool,
}

/// A named, revisioned set of segments.
pub struct Collection {
    name: String,
    directory: PathBuf,
    meta: RwLock<CollectionMeta>,
    segments: RwLock<Vec<Arc<MemSegment>>>,
    next_segment_id: AtomicU64,
    // Single-writer invariant: every mutation holds this lock
    write_lock: Mutex<()>,
    latest_lsn: Mutex<(u64, String)>,
}

impl Collection {
    /// Open or create a collection under `index_directory`.
    pub fn create_and_open(
        name: &str,
        index_directory: &str,
        meta: CollectionMeta,
        options: ReadOptions,
    ) -> Result<Arc<Collection>> {
        let directory = Path::new(index_directory).join(name);
        if options.create_new {
            std::fs::create_dir_all(&directory)?;
            let collection = Collection {
                name: name.to_string(),
                directory,
                segments: RwLock::new(vec![Arc::new(MemSegment::new(
                    0,
                    meta.index_columns.clone(),
                ))]),
                meta: RwLock::new(meta),
                next_segment_id: AtomicU64::new(1),
                write_lock: Mutex::new(()),
                latest_lsn: Mutex::new((0, String::new())),
            };
            collection.write_manifest()?;
            Ok(Arc::new(collection))
        } else {
            Self::open_existing(name, directory, meta)
        }
    }

    fn open_existing(
        name: &str,
        directory: PathBuf,
        meta: CollectionMeta,
    ) -> Result<Arc<Collection>> {
        let manifest_path = directory.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&text)
            .map_err(|e| Error::RuntimeError(format!("manifest parse failed: {e}")))?;
        if manifest.magic != MANIFEST_MAGIC {
            error!(collection = name, "manifest magic mismatch");
            return Err(Error::MismatchedMagicNumber);
        }
        if !manifest.meta.is_forward_compatible_with(&meta) {
            return Err(Error::MismatchedSchema);
        }
        // The stored schema wins; it carries the real revision chain tip
        let stored_meta = manifest.meta;

        let mut segments = Vec::with_capacity(manifest.segment_ids.len());
        let mut max_id = 0;
        for id in &manifest.segment_ids {
            let path = directory.join(format!("segment_{id}.seg"));
            if !path.exists() {
                // Listed but never flushed: the segment was empty
                segments.push(Arc::new(MemSegment::new(
                    *id,
                    stored_meta.index_columns.clone(),
                )));
                max_id = max_id.max(*id);
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let snapshot: SegmentSnapshot = bincode::deserialize(&bytes)
                .map_err(|e| Error::RuntimeError(format!("segment snapshot decode: {e}")))?;
            segments.push(Arc::new(MemSegment::from_snapshot(
                snapshot,
                stored_meta.index_columns.clone(),
            )));
            max_id = max_id.max(*id);
        }
        if segments.is_empty() {
            segments.push(Arc::new(MemSegment::new(0, stored_meta.index_columns.clone())));
        }

        info!(collection = name, segments = segments.len(), "collection opened");
        Ok(Arc::new(Collection {
            name: name.to_string(),
            directory,
            meta: RwLock::new(stored_meta),
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(max_id + 1),
            write_lock: Mutex::new(()),
            latest_lsn: Mutex::new((0, String::new())),
        }))
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current schema snapshot.
    pub fn meta(&self) -> CollectionMeta {
        self.meta.read().clone()
    }

    /// Read handles of all segments, in rollover order.
    pub fn segments(&self) -> Vec<SegmentRef> {
        self.segments
            .read()
            .iter()
            .map(|s| s.clone() as SegmentRef)
            .collect()
    }

    /// Apply a batch of rows.
    ///
    /// Rows carry values in schema order; forwards are serialized here and
    /// stamped with the dataset revision so readers can resolve names later.
    /// Direct-path inserts (rows without an LSN context) deduplicate by
    /// primary key; the replicated path trusts binlog ordering.
    pub fn write_records(&self, dataset: &CollectionDataset) -> Result<()> {
        let _guard = self.write_lock.lock();

        let meta = self.meta.read().clone();
        if !meta.writable {
            return Err(Error::SuspendedCollection(self.name.clone()));
        }

        for row in &dataset.rows {
            if row.primary_key == INVALID_PRIMARY_KEY {
                return Err(Error::InvalidArgument("reserved primary key".into()));
            }
            match row.operation {
                RowOperation::Insert => {
                    if row.lsn_context.is_empty() && self.find_segment_of(row.primary_key).is_some()
                    {
                        return Err(Error::DuplicateKey(row.primary_key));
                    }
                    self.insert_row(&meta, dataset.revision, row)?;
                }
                RowOperation::Update => {
                    if let Some(segment) = self.find_segment_of(row.primary_key) {
                        segment.remove(row.primary_key);
                    }
                    self.insert_row(&meta, dataset.revision, row)?;
                }
                RowOperation::Delete => {
                    match self.find_segment_of(row.primary_key) {
                        Some(segment) => {
                            segment.remove(row.primary_key);
                        }
                        None => {
                            warn!(
                                collection = %self.name,
                                primary_key = row.primary_key,
                                "delete for unknown key ignored"
                            );
                        }
                    }
                }
            }
            if row.lsn > 0 || !row.lsn_context.is_empty() {
                let mut latest = self.latest_lsn.lock();
                if row.lsn >= latest.0 {
                    *latest = (row.lsn, row.lsn_context.clone());
                }
            }
        }
        Ok(())
    }

    fn insert_row(
        &self,
        meta: &CollectionMeta,
        revision: u64,
        row: &quiver_core::proto::RowData,
    ) -> Result<()> {
        if row.index_values.len() != meta.index_columns.len() {
            return Err(Error::MismatchedSchema);
        }
        let mut features = Vec::with_capacity(row.index_values.len());
        for (value, column) in row.index_values.iter().zip(meta.index_columns.iter()) {
            features.push(pack_feature(value, column)?);
        }
        let entry = RowEntry {
            features,
            forward_data: serialize_forward(&row.forward_values),
            revision,
            lsn: row.lsn,
        };
        let segment = self.writable_segment(meta);
        segment.insert(row.primary_key, entry)
    }

    // Latest segment, rolling a new one at the capacity threshold
    fn writable_segment(&self, meta: &CollectionMeta) -> Arc<MemSegment> {
        let mut segments = self.segments.write();
        let latest = segments.last().expect("segment list is never empty");
        if latest.doc_count() < meta.max_docs_per_segment {
            return latest.clone();
        }
        let id = self.next_segment_id.fetch_add(1, Ordering::AcqRel);
        info!(collection = %self.name, segment_id = id, "rolling new segment");
        let segment = Arc::new(MemSegment::new(id, meta.index_columns.clone()));
        segments.push(segment.clone());
        segment
    }

    fn find_segment_of(&self, primary_key: u64) -> Option<Arc<MemSegment>> {
        self.segments
            .read()
            .iter()
            .find(|s| s.contains(primary_key))
            .cloned()
    }

    /// Replace the schema with a new revision.
    ///
    /// Only forward columns may change; the new revision must be greater
    /// than the stored one.
    pub fn update_schema(&self, new_meta: CollectionMeta) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut meta = self.meta.write();
        if !meta.is_forward_compatible_with(&new_meta) {
            error!(collection = %self.name, "schema update changes index columns");
            return Err(Error::MismatchedSchema);
        }
        if new_meta.revision <= meta.revision {
            return Err(Error::InvalidRevision(new_meta.revision));
        }
        *meta = new_meta;
        drop(meta);
        self.write_manifest()
    }

    /// Persist the manifest and every segment snapshot.
    pub fn flush(&self) -> Result<()> {
        self.write_manifest()?;
        let segments = self.segments.read().clone();
        for segment in segments {
            let snapshot = segment.snapshot();
            let bytes = bincode::serialize(&snapshot)
                .map_err(|e| Error::RuntimeError(format!("segment snapshot encode: {e}")))?;
            let path = self
                .directory
                .join(format!("segment_{}.seg", segment.segment_id()));
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    /// Compact tombstones out of every segment.
    pub fn optimize(&self) -> Result<()> {
        let segments = self.segments.read().clone();
        for segment in segments {
            segment.optimize();
        }
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CollectionStats {
        let segments = self.segments.read();
        let latest = self.latest_lsn.lock();
        CollectionStats {
            collection_name: self.name.clone(),
            total_doc_count: segments.iter().map(|s| s.doc_count()).sum(),
            segment_count: segments.len() as u64,
            latest_lsn: latest.0,
            latest_lsn_context: latest.1.clone(),
        }
    }

    /// Latest observed `(lsn, lsn_context)`.
    pub fn latest_lsn(&self) -> (u64, String) {
        self.latest_lsn.lock().clone()
    }

    /// Flush and release.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Close and delete the on-disk state.
    pub fn close_and_cleanup(&self) -> Result<()> {
        if self.directory.exists() {
            std::fs::remove_dir_all(&self.directory)?;
        }
        Ok(())
    }

    fn write_manifest(&self) -> Result<()> {
        let manifest = Manifest {
            magic: MANIFEST_MAGIC,
            name: self.name.clone(),
            meta: self.meta.read().clone(),
            segment_ids: self.segments.read().iter().map(|s| s.segment_id()).collect(),
        };
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::RuntimeError(format!("manifest encode: {e}")))?;
        std::fs::write(self.directory.join(MANIFEST_FILE), text)?;
        Ok(())
    }
}

/// Serialize a forward tuple into its opaque blob.
pub fn serialize_forward(values: &[Value]) -> Vec<u8> {
    bincode::serialize(values).expect("forward values always serialize")
}

/// Convert one index-column value into its packed feature blob.
///
/// Pre-packed bytes must match the column's vector size; a string is parsed
/// as a JSON number array of the column's dimension.
pub fn pack_feature(value: &Value, column: &quiver_core::meta::ColumnMeta) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => {
            if bytes.len() != column.vector_size() {
                return Err(Error::InvalidVectorFormat(format!(
                    "column {} expects {} feature bytes, got {}",
                    column.name,
                    column.vector_size(),
                    bytes.len()
                )));
            }
            Ok(bytes.clone())
        }
        Value::String(text) => {
            // JSON array, or the bare comma-separated form tables hold
            let numbers: Vec<f64> = if text.trim_start().starts_with('[') {
                serde_json::from_str(text).map_err(|_| {
                    Error::InvalidVectorFormat(format!(
                        "column {} is not a JSON vector",
                        column.name
                    ))
                })?
            } else {
                text.split(',')
                    .map(|part| part.trim().parse::<f64>())
                    .collect::<std::result::Result<Vec<f64>, _>>()
                    .map_err(|_| {
                        Error::InvalidVectorFormat(format!(
                            "column {} is not a numeric vector",
                            column.name
                        ))
                    })?
            };
            if numbers.len() != column.dimension as usize {
                return Err(Error::InvalidVectorFormat(format!(
                    "column {} expects dimension {}, got {}",
                    column.name,
                    column.dimension,
                    numbers.len()
                )));
            }
            quiver_core::vector::pack_f64_values(&numbers, column.data_type)
                .ok_or(Error::MismatchedDataType)
        }
        _ => Err(Error::MismatchedDataType),
    }
}
