//! Read-only projection over the meta service, used for query validation.

use quiver_core::error::{Error, Result};
use quiver_core::meta::MetaServiceRef;
use quiver_core::vector::DataType;
use tracing::error;

/// Validation facade over the revisioned schema store.
pub struct MetaWrapper {
    meta_service: MetaServiceRef,
}

impl MetaWrapper {
    /// Wrap a meta service handle.
    pub fn new(meta_service: MetaServiceRef) -> Self {
        MetaWrapper { meta_service }
    }

    /// The collection must exist and be readable.
    pub fn validate_collection(&self, collection: &str) -> Result<()> {
        let meta = self
            .meta_service
            .get_current_collection(collection)
            .ok_or_else(|| Error::InexistentCollection(collection.to_string()))?;
        if !meta.readable {
            return Err(Error::UnreadableCollection(collection.to_string()));
        }
        Ok(())
    }

    /// The collection must be readable and `column` one of its index columns.
    pub fn validate_column(&self, collection: &str, column: &str) -> Result<()> {
        self.validate_collection(collection)?;
        let meta = self
            .meta_service
            .get_current_collection(collection)
            .ok_or_else(|| Error::InexistentCollection(collection.to_string()))?;
        if meta.column_by_name(column).is_none() {
            return Err(Error::InexistentColumn(column.to_string()));
        }
        Ok(())
    }

    /// Forward column names of the schema at `revision`.
    pub fn list_columns(&self, collection: &str, revision: u64) -> Result<Vec<String>> {
        match self.meta_service.get_collection(collection, revision) {
            Some(meta) => Ok(meta.forward_columns),
            None => {
                error!(collection, revision, "no schema stored under revision");
                Err(Error::InvalidRevision(revision))
            }
        }
    }

    /// Element type of an index column; `Undefined` when missing.
    pub fn get_data_type(&self, collection: &str, column: &str) -> DataType {
        self.meta_service
            .get_current_collection(collection)
            .and_then(|meta| meta.column_by_name(column).map(|c| c.data_type))
            .unwrap_or(DataType::Undefined)
    }
}
