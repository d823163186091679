//! Quiver: a vector search backend with streaming MySQL CDC ingestion.
//!
//! The workspace splits along the service boundaries:
//! - `quiver-core`: errors, values, vectors, schemas, profiler, config
//! - `quiver-executor`: tasks, the bounded scheduler, the stealing executor
//! - `quiver-index`: segments, collections, the index service
//! - `quiver-query`: the kNN/equality query engine
//! - `quiver-repl`: the MySQL binlog ingestion pipeline
//!
//! This crate re-exports the public surface and hosts the end-to-end
//! integration suites under `tests/`.

pub use quiver_core::{
    CollectionDataset, CollectionMeta, ColumnMeta, DataType, Error, GetDocumentRequest,
    GetDocumentResponse, IndexConfig, LsnContext, MemoryMetaService, MetaService, Profiler,
    QueryRequest, QueryResponse, RepositoryConfig, Result, RowData, RowDataStatus, RowOperation,
    Status, Value,
};
pub use quiver_executor::{Executor, Scheduler};
pub use quiver_index::{Collection, IndexService, Segment};
pub use quiver_query::QueryService;
pub use quiver_repl::{MysqlHandler, MysqlReader, ScanMode};
