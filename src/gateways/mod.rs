//! Control-plane seam: the traits the phase engines call instead of a real
//! cloud, plus the per-run session cache.
//!
//! Implementations are injected into the engines as `Arc<dyn …>`; the crate
//! ships an in-memory control plane for tests and demos and instrumented
//! decorators for concurrency observation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::InstanceFilters;
use crate::{now_ms, AgentStatus, InstanceState, LandingZone};

mod error;
pub mod in_memory;
pub mod instrumented;

pub use error::GatewayError;

/// Scoped credential/session handle for one landing zone.
///
/// Opaque to the engines; they only thread it back into gateway calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub landing_zone: String,
    pub account_id: String,
    pub region: String,
    pub acquired_at_ms: u64,
}

impl Session {
    pub fn for_zone(zone: &LandingZone) -> Self {
        Self {
            landing_zone: zone.id.clone(),
            account_id: zone.account_id.clone(),
            region: zone.region.clone(),
            acquired_at_ms: now_ms(),
        }
    }
}

/// Instance description as returned by the control plane, before
/// normalization into [`crate::Instance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstance {
    pub id: String,
    pub platform: String,
    pub state: String,
    pub tags: BTreeMap<String, String>,
}

/// Handle to an image accepted for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub image_id: String,
}

/// Observed image lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Available,
    Failed,
}

/// Yields scoped sessions for landing zones (credential acquisition and
/// cross-partition role assumption live behind this seam).
#[async_trait::async_trait]
pub trait AccessProvider: Send + Sync {
    async fn acquire(&self, zone: &LandingZone) -> Result<Session, GatewayError>;
}

/// Typed wrapper around the compute control plane.
#[async_trait::async_trait]
pub trait ComputeGateway: Send + Sync {
    /// Enumerate instances in the session's zone matching the filter.
    async fn list_instances(
        &self,
        session: &Session,
        filters: &InstanceFilters,
    ) -> Result<Vec<RawInstance>, GatewayError>;

    /// Request a point-in-time image of an instance, stamped with the given
    /// tags. Acceptance does not imply completion; poll `describe_image`.
    async fn create_image(
        &self,
        session: &Session,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ImageHandle, GatewayError>;

    async fn describe_image(
        &self,
        session: &Session,
        handle: &ImageHandle,
    ) -> Result<ImageState, GatewayError>;

    async fn start_instance(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<(), GatewayError>;

    async fn describe_instance_state(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<InstanceState, GatewayError>;
}

/// Typed wrapper around the management-agent control plane.
#[async_trait::async_trait]
pub trait AgentGateway: Send + Sync {
    async fn ping(&self, session: &Session, instance_id: &str) -> Result<AgentStatus, GatewayError>;
}

/// Per-run cache of zone sessions.
///
/// A zone's session is acquired once and reused by every phase of the run,
/// avoiding redundant role assumption. The cache is scoped to a single run
/// and never shared across concurrent runs.
pub struct SessionCache {
    provider: Arc<dyn AccessProvider>,
    zones: HashMap<String, LandingZone>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionCache {
    pub fn new(provider: Arc<dyn AccessProvider>, zones: Vec<LandingZone>) -> Self {
        Self {
            provider,
            zones: zones.into_iter().map(|z| (z.id.clone(), z)).collect(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn zone(&self, zone_id: &str) -> Option<&LandingZone> {
        self.zones.get(zone_id)
    }

    /// Session for a zone, acquiring and caching it on first use.
    pub async fn get(&self, zone_id: &str) -> Result<Arc<Session>, GatewayError> {
        let zone = self
            .zones
            .get(zone_id)
            .ok_or_else(|| GatewayError::permanent("acquire", format!("unknown landing zone: {zone_id}")))?;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(zone_id) {
            return Ok(session.clone());
        }
        let session = Arc::new(self.provider.acquire(zone).await?);
        sessions.insert(zone_id.to_string(), session.clone());
        Ok(session)
    }
}
