//! Decorators that add in-flight concurrency observation to any gateway
//! implementation.
//!
//! Wrapping a gateway in one of these changes nothing about its behavior;
//! it only records how many operations are simultaneously in flight, which
//! is what the concurrency-ceiling property tests assert against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::InstanceFilters;
use crate::{AgentStatus, InstanceState};

use super::{
    AgentGateway, ComputeGateway, GatewayError, ImageHandle, ImageState, RawInstance, Session,
};

/// Tracks current and peak simultaneous entries.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gauged section; the guard exits it on drop.
    pub fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous entries observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard<'a> {
    gauge: &'a ConcurrencyGauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Compute gateway decorator; the guard is held across the inner await so
/// the gauge counts operations actually in flight.
pub struct InstrumentedComputeGateway {
    inner: Arc<dyn ComputeGateway>,
    gauge: Arc<ConcurrencyGauge>,
}

impl InstrumentedComputeGateway {
    pub fn new(inner: Arc<dyn ComputeGateway>, gauge: Arc<ConcurrencyGauge>) -> Self {
        Self { inner, gauge }
    }
}

#[async_trait::async_trait]
impl ComputeGateway for InstrumentedComputeGateway {
    async fn list_instances(
        &self,
        session: &Session,
        filters: &InstanceFilters,
    ) -> Result<Vec<RawInstance>, GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.list_instances(session, filters).await
    }

    async fn create_image(
        &self,
        session: &Session,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ImageHandle, GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.create_image(session, instance_id, tags).await
    }

    async fn describe_image(
        &self,
        session: &Session,
        handle: &ImageHandle,
    ) -> Result<ImageState, GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.describe_image(session, handle).await
    }

    async fn start_instance(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<(), GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.start_instance(session, instance_id).await
    }

    async fn describe_instance_state(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<InstanceState, GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.describe_instance_state(session, instance_id).await
    }
}

/// Agent gateway decorator, same pattern.
pub struct InstrumentedAgentGateway {
    inner: Arc<dyn AgentGateway>,
    gauge: Arc<ConcurrencyGauge>,
}

impl InstrumentedAgentGateway {
    pub fn new(inner: Arc<dyn AgentGateway>, gauge: Arc<ConcurrencyGauge>) -> Self {
        Self { inner, gauge }
    }
}

#[async_trait::async_trait]
impl AgentGateway for InstrumentedAgentGateway {
    async fn ping(&self, session: &Session, instance_id: &str) -> Result<AgentStatus, GatewayError> {
        let _guard = self.gauge.enter();
        self.inner.ping(session, instance_id).await
    }
}
