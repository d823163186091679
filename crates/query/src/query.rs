//! The query sum type and its four-phase protocol.
//!
//! The original design models queries as an interface hierarchy; a closed
//! sum with one dispatch function per phase is equivalent and keeps dispatch
//! static. `NoOp` stands in for unrecognized request kinds and fails every
//! phase.

use quiver_core::error::{Error, Result};
use quiver_core::proto::{QueryRequest, QueryResponse, QueryType};
use tracing::error;

use crate::context::QueryContext;
use crate::equal::EqualQuery;
use crate::knn::KnnQuery;

/// A request in execution form.
pub enum Query {
    /// Approximate nearest neighbor
    Knn(KnnQuery),
    /// Exact primary-key lookup
    Equal(EqualQuery),
    /// Unrecognized request kind; fails every phase
    NoOp,
}

impl Query {
    /// Build the handler matching the request kind.
    pub fn from_request(context: QueryContext, request: QueryRequest) -> Query {
        match request.query_type {
            QueryType::Knn => Query::Knn(KnnQuery::new(context, request)),
            _ => {
                error!("ignore unknown query");
                Query::NoOp
            }
        }
    }

    /// Trace id; 0 for `NoOp`.
    pub fn id(&self) -> u64 {
        match self {
            Query::Knn(q) => q.id(),
            Query::Equal(q) => q.id(),
            Query::NoOp => 0,
        }
    }

    /// Phase 1.
    pub fn validate(&self) -> Result<()> {
        match self {
            Query::Knn(q) => q.validate(),
            Query::Equal(q) => q.validate(),
            Query::NoOp => Err(Error::RuntimeError("undefined query".into())),
        }
    }

    /// Phase 2.
    pub fn prepare(&mut self) -> Result<()> {
        match self {
            Query::Knn(q) => q.prepare(),
            Query::Equal(q) => q.prepare(),
            Query::NoOp => Err(Error::RuntimeError("undefined query".into())),
        }
    }

    /// Phase 3.
    pub fn evaluate(&mut self) -> Result<()> {
        match self {
            Query::Knn(q) => q.evaluate(),
            Query::Equal(q) => q.evaluate(),
            Query::NoOp => Err(Error::RuntimeError("undefined query".into())),
        }
    }

    /// Phase 4; always invoked, side-effect free.
    pub fn finalize(&mut self) -> Result<()> {
        match self {
            Query::Knn(q) => q.finalize(),
            Query::Equal(q) => q.finalize(),
            Query::NoOp => Err(Error::RuntimeError("undefined query".into())),
        }
    }

    /// Take the assembled search response; empty for non-kNN queries.
    pub fn into_query_response(self) -> QueryResponse {
        match self {
            Query::Knn(q) => q.into_response(),
            _ => QueryResponse::default(),
        }
    }
}
