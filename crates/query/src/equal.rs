//! Equality query: exact primary-key lookup across segments.

use std::sync::Arc;

use tracing::warn;

use quiver_core::error::Result;
use quiver_core::proto::{Document, GetDocumentRequest, GetDocumentResponse};
use quiver_executor::task::TaskRef;

use crate::context::QueryContext;
use crate::tasks::EqualTask;

/// Handler of one primary-key lookup.
pub struct EqualQuery {
    context: QueryContext,
    request: GetDocumentRequest,
    response: GetDocumentResponse,
    tasks: Vec<Arc<EqualTask>>,
}

impl EqualQuery {
    /// Build the handler; phases run later.
    pub fn new(context: QueryContext, request: GetDocumentRequest) -> Self {
        EqualQuery {
            context,
            request,
            response: GetDocumentResponse::default(),
            tasks: Vec::new(),
        }
    }

    fn collection(&self) -> &str {
        &self.request.collection_name
    }

    /// Trace id.
    pub fn id(&self) -> u64 {
        self.context.id()
    }

    /// Requested key.
    pub fn primary_key(&self) -> u64 {
        self.request.primary_key
    }

    /// Phase 1: the collection must exist and be readable.
    pub fn validate(&self) -> Result<()> {
        self.context.meta().validate_collection(self.collection())
    }

    /// Phase 2: one lookup task per segment.
    pub fn prepare(&mut self) -> Result<()> {
        let segments = self.context.list_segments(self.collection())?;
        for segment in segments {
            self.tasks
                .push(EqualTask::new(segment, self.request.primary_key));
        }
        Ok(())
    }

    /// Phase 3: run the tasks; the first hit fills the document. A miss
    /// leaves the response empty without an error.
    pub fn evaluate(&mut self) -> Result<()> {
        let tasks: Vec<TaskRef> = self.tasks.iter().map(|t| t.clone() as TaskRef).collect();
        self.context.executor().execute_tasks(&tasks)?;

        // Pick the first hit; the key is unique across segments
        let hit = self.tasks.iter().find_map(|task| task.hit());
        if let Some(hit) = hit {
            let mut doc = Document {
                primary_key: self.request.primary_key,
                score: 0.0,
                forward_column_values: Vec::new(),
            };
            if let Err(err) = self.context.fill_forward(self.collection(), &hit, &mut doc) {
                warn!(code = err.code(), "fill forward failed");
                return Err(err);
            }
            self.response.document = Some(doc);
        }
        Ok(())
    }

    /// Phase 4: side-effect free.
    pub fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hand the assembled response to the service.
    pub fn into_response(self) -> GetDocumentResponse {
        self.response
    }
}
