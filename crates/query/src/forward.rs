//! Forward tuple serialization.
//!
//! The forward blob is an ordered `Vec<Value>` encoded with bincode; its
//! length must equal the forward-column list of the revision it was written
//! under.

use quiver_core::error::{Error, Result};
use quiver_core::proto::Document;
use quiver_core::value::Value;
use quiver_index::segment::QueryResult;
use tracing::debug;

/// Decode a forward blob into its value tuple.
pub fn deserialize(buf: &[u8]) -> Result<Vec<Value>> {
    bincode::deserialize(buf).map_err(|_| Error::MismatchedForward)
}

/// Fill a document's key/value pairs from a hit's forward blob.
///
/// `columns` is the forward-column name list of the hit's revision; a length
/// mismatch means the blob and schema drifted apart.
pub fn fill_forward(hit: &QueryResult, columns: &[String], doc: &mut Document) -> Result<()> {
    let values = deserialize(&hit.forward_data)?;
    if values.len() != columns.len() {
        debug!(
            buf_size = hit.forward_data.len(),
            values = values.len(),
            forwards = columns.len(),
            "mismatched forwards"
        );
        return Err(Error::MismatchedForward);
    }
    doc.forward_column_values = columns.iter().cloned().zip(values).collect();
    Ok(())
}
