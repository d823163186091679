//! Core types shared across the Quiver vector search backend.
//!
//! This crate defines the foundational pieces used by every other crate:
//! - Error: unified error type with stable numeric codes
//! - Value: tagged value carried by forward columns and scan rows
//! - DataType and packed feature-vector helpers
//! - CollectionMeta: revisioned collection schemas and the MetaService seam
//! - Request/response shapes for search and write paths
//! - Profiler: per-request hierarchical latency tree
//! - ServiceState: the init/start/stop/cleanup lifecycle machine

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod meta;
pub mod profiler;
pub mod proto;
pub mod service;
pub mod value;
pub mod vector;

pub use config::{IndexConfig, RepositoryConfig};
pub use error::{Error, Result};
pub use meta::{CollectionMeta, ColumnMeta, MemoryMetaService, MetaService};
pub use profiler::{Profiler, ScopedLatency};
pub use proto::{
    CollectionDataset, Document, FeatureInput, GetDocumentRequest, GetDocumentResponse,
    KnnQueryParam, LsnContext, QueryRequest, QueryResponse, QueryType, ResultSet, RowData,
    RowDataStatus, RowOperation, Status,
};
pub use service::{ServiceState, ServiceStatus};
pub use value::Value;
pub use vector::DataType;
