//! Report seam.
//!
//! The pipeline hands its finished [`WorkflowResult`] to a sink; rendering
//! into on-disk formats is the sink implementor's concern, not this crate's.

use std::sync::Mutex;

use crate::WorkflowResult;

/// Consumer of finished workflow results.
#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, result: &WorkflowResult) -> Result<(), String>;
}

/// Sink that collects published results in memory; used by tests and demos.
#[derive(Default)]
pub struct InMemoryReportSink {
    published: Mutex<Vec<WorkflowResult>>,
}

impl InMemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<WorkflowResult> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ReportSink for InMemoryReportSink {
    async fn publish(&self, result: &WorkflowResult) -> Result<(), String> {
        self.published.lock().unwrap().push(result.clone());
        Ok(())
    }
}
