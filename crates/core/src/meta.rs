//! Revisioned collection schemas and the MetaService seam.
//!
//! A collection schema is an ordered list of forward columns (opaque value
//! carriers) plus an ordered list of index columns (vector-valued,
//! searchable). Schemas carry a strictly increasing revision; every write is
//! stamped with the revision it was made under so readers can resolve the
//! forward-column name list later.
//!
//! The persistent meta store is out of scope; `MemoryMetaService` keeps the
//! full revision chain in process and is what the tests and default wiring
//! use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vector::DataType;

/// Schema of one index (vector) column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name, unique within the collection
    pub name: String,
    /// Element type of the stored vectors
    pub data_type: DataType,
    /// Number of elements per vector
    pub dimension: u32,
    /// Opaque kernel parameters (metric, ef, etc.)
    pub index_params: Vec<(String, String)>,
}

impl ColumnMeta {
    /// Convenience constructor for the common case.
    pub fn new(name: &str, data_type: DataType, dimension: u32) -> Self {
        ColumnMeta {
            name: name.to_string(),
            data_type,
            dimension,
            index_params: Vec::new(),
        }
    }

    /// Byte length of one packed vector of this column.
    pub fn vector_size(&self) -> usize {
        self.data_type.vector_size(self.dimension as usize)
    }
}

/// Schema of a collection at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Collection name
    pub name: String,
    /// Strictly increasing schema revision
    pub revision: u64,
    /// Ordered forward column names
    pub forward_columns: Vec<String>,
    /// Ordered index columns
    pub index_columns: Vec<ColumnMeta>,
    /// Reads allowed
    pub readable: bool,
    /// Writes allowed
    pub writable: bool,
    /// Segment rollover threshold
    pub max_docs_per_segment: u64,
}

impl CollectionMeta {
    /// New schema at revision 0.
    pub fn new(name: &str, forward_columns: Vec<String>, index_columns: Vec<ColumnMeta>) -> Self {
        CollectionMeta {
            name: name.to_string(),
            revision: 0,
            forward_columns,
            index_columns,
            readable: true,
            writable: true,
            max_docs_per_segment: 100_000,
        }
    }

    /// Look up an index column by name.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnMeta> {
        self.index_columns.iter().find(|c| c.name == name)
    }

    /// Schema evolution rule: only forward columns may change between
    /// revisions; index columns must match bit-for-bit.
    pub fn is_forward_compatible_with(&self, other: &CollectionMeta) -> bool {
        self.index_columns == other.index_columns
    }
}

/// Revisioned schema store.
///
/// External collaborator: only the interface is part of the core. All
/// methods are callable concurrently.
pub trait MetaService: Send + Sync {
    /// Register a new collection at revision 0. Fails on duplicates.
    fn create_collection(&self, meta: CollectionMeta) -> Result<CollectionMeta>;

    /// Store a new revision of an existing collection. Index columns must be
    /// unchanged; the stored revision is bumped by one.
    fn update_collection(&self, meta: CollectionMeta) -> Result<CollectionMeta>;

    /// Drop a collection and its whole revision chain.
    fn drop_collection(&self, name: &str) -> Result<()>;

    /// Latest revision of a collection.
    fn get_current_collection(&self, name: &str) -> Option<CollectionMeta>;

    /// Specific revision of a collection.
    fn get_collection(&self, name: &str, revision: u64) -> Option<CollectionMeta>;

    /// Existence check.
    fn exist_collection(&self, name: &str) -> bool;

    /// Suspend or resume reads.
    fn set_readable(&self, name: &str, readable: bool) -> Result<()>;

    /// Suspend or resume writes.
    fn set_writable(&self, name: &str, writable: bool) -> Result<()>;
}

/// Shared handle to a meta service.
pub type MetaServiceRef = Arc<dyn MetaService>;

/// In-process revision-chain implementation.
#[derive(Default)]
pub struct MemoryMetaService {
    collections: RwLock<HashMap<String, Vec<CollectionMeta>>>,
}

impl MemoryMetaService {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaService for MemoryMetaService {
    fn create_collection(&self, meta: CollectionMeta) -> Result<CollectionMeta> {
        let mut map = self.collections.write();
        if map.contains_key(&meta.name) {
            return Err(Error::DuplicateCollection(meta.name));
        }
        map.insert(meta.name.clone(), vec![meta.clone()]);
        Ok(meta)
    }

    fn update_collection(&self, meta: CollectionMeta) -> Result<CollectionMeta> {
        let mut map = self.collections.write();
        let chain = map
            .get_mut(&meta.name)
            .ok_or_else(|| Error::InexistentCollection(meta.name.clone()))?;
        let current = chain.last().expect("revision chain is never empty");
        if !current.is_forward_compatible_with(&meta) {
            return Err(Error::MismatchedSchema);
        }
        let mut next = meta;
        next.revision = current.revision + 1;
        chain.push(next.clone());
        Ok(next)
    }

    fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::InexistentCollection(name.to_string()))
    }

    fn get_current_collection(&self, name: &str) -> Option<CollectionMeta> {
        self.collections.read().get(name)?.last().cloned()
    }

    fn get_collection(&self, name: &str, revision: u64) -> Option<CollectionMeta> {
        self.collections
            .read()
            .get(name)?
            .iter()
            .find(|m| m.revision == revision)
            .cloned()
    }

    fn exist_collection(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    fn set_readable(&self, name: &str, readable: bool) -> Result<()> {
        let mut map = self.collections.write();
        let chain = map
            .get_mut(name)
            .ok_or_else(|| Error::InexistentCollection(name.to_string()))?;
        for meta in chain.iter_mut() {
            meta.readable = readable;
        }
        Ok(())
    }

    fn set_writable(&self, name: &str, writable: bool) -> Result<()> {
        let mut map = self.collections.write();
        let chain = map
            .get_mut(name)
            .ok_or_else(|| Error::InexistentCollection(name.to_string()))?;
        for meta in chain.iter_mut() {
            meta.writable = writable;
        }
        Ok(())
    }
}
