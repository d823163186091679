//! Query engine: fan-out/fan-in execution of kNN and equality queries.
//!
//! A request enters `QueryService::search` or `search_by_key`, becomes a
//! `Query` (a closed sum of Knn / Equal / NoOp), and runs the four-phase
//! protocol `validate → prepare → evaluate → finalize`. Evaluation fans one
//! task per segment through the executor and merges per-batch results with a
//! bounded heap.

#![warn(clippy::all)]

pub mod context;
pub mod equal;
pub mod forward;
pub mod knn;
pub mod merger;
pub mod meta_wrapper;
pub mod query;
pub mod service;
pub mod tasks;

pub use meta_wrapper::MetaWrapper;
pub use query::Query;
pub use service::QueryService;
