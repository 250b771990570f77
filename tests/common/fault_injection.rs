//! Fault-injecting gateway wrappers for testing error handling.

// These types are used by some test files importing common but not all.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetprep::config::InstanceFilters;
use fleetprep::gateways::{
    ComputeGateway, GatewayError, ImageHandle, ImageState, RawInstance, Session,
};
use fleetprep::InstanceState;

/// Compute gateway wrapper that fails a configurable number of
/// `start_instance` calls with a transient error before delegating.
pub struct FlakyComputeGateway {
    inner: Arc<dyn ComputeGateway>,
    start_transient_failures: AtomicU32,
    start_calls: AtomicU32,
}

impl FlakyComputeGateway {
    pub fn new(inner: Arc<dyn ComputeGateway>) -> Self {
        Self {
            inner,
            start_transient_failures: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_start_transient(&self, count: u32) {
        self.start_transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeGateway for FlakyComputeGateway {
    async fn list_instances(
        &self,
        session: &Session,
        filters: &InstanceFilters,
    ) -> Result<Vec<RawInstance>, GatewayError> {
        self.inner.list_instances(session, filters).await
    }

    async fn create_image(
        &self,
        session: &Session,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ImageHandle, GatewayError> {
        self.inner.create_image(session, instance_id, tags).await
    }

    async fn describe_image(
        &self,
        session: &Session,
        handle: &ImageHandle,
    ) -> Result<ImageState, GatewayError> {
        self.inner.describe_image(session, handle).await
    }

    async fn start_instance(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<(), GatewayError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.start_transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.start_transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::retryable("start_instance", "insufficient capacity, retry"));
        }
        self.inner.start_instance(session, instance_id).await
    }

    async fn describe_instance_state(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<InstanceState, GatewayError> {
        self.inner.describe_instance_state(session, instance_id).await
    }
}
