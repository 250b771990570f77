//! In-memory control plane for tests and demos.
//!
//! Simulates the asynchronous behavior the engines have to cope with:
//! images that become available only after a number of status polls,
//! instances that take time to start (or never do), throttled create calls,
//! denied zones, and flaky agents. All knobs are per instance and set up
//! front through [`SimInstance`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::InstanceFilters;
use crate::{AgentStatus, InstanceState, LandingZone};

use super::{
    AccessProvider, AgentGateway, ComputeGateway, GatewayError, ImageHandle, ImageState,
    RawInstance, Session,
};

/// Declarative description of one simulated instance.
pub struct SimInstance {
    id: String,
    state: String,
    platform: String,
    tags: BTreeMap<String, String>,
    agent: AgentStatus,
    agent_online_after_pings: Option<u32>,
    ping_error: Option<GatewayError>,
    start_polls: u32,
    never_starts: bool,
    create_transient_failures: u32,
    create_permanent: bool,
    image_ready_polls: u32,
    image_fails: bool,
    image_never_ready: bool,
}

impl SimInstance {
    /// A running linux instance with an online agent; everything succeeds
    /// on the first try unless a knob below says otherwise.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: "running".to_string(),
            platform: "linux".to_string(),
            tags: BTreeMap::new(),
            agent: AgentStatus::Online,
            agent_online_after_pings: None,
            ping_error: None,
            start_polls: 1,
            never_starts: false,
            create_transient_failures: 0,
            create_permanent: false,
            image_ready_polls: 1,
            image_fails: false,
            image_never_ready: false,
        }
    }

    pub fn stopped(mut self) -> Self {
        self.state = "stopped".to_string();
        self
    }

    /// Raw control-plane state string, e.g. "shutting-down".
    pub fn state(mut self, raw: &str) -> Self {
        self.state = raw.to_string();
        self
    }

    pub fn platform(mut self, raw: &str) -> Self {
        self.platform = raw.to_string();
        self
    }

    pub fn agent(mut self, status: AgentStatus) -> Self {
        self.agent = status;
        self
    }

    /// Agent reports offline until `pings` pings have been made.
    pub fn agent_online_after(mut self, pings: u32) -> Self {
        self.agent = AgentStatus::Offline;
        self.agent_online_after_pings = Some(pings);
        self
    }

    /// Every agent ping fails with a permanent gateway error.
    pub fn ping_fails(mut self) -> Self {
        self.ping_error = Some(GatewayError::permanent("ping", "agent endpoint rejected request"));
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// State polls needed after a start before the instance reports running.
    pub fn start_polls(mut self, polls: u32) -> Self {
        self.start_polls = polls;
        self
    }

    /// A started instance stays pending forever.
    pub fn never_starts(mut self) -> Self {
        self.never_starts = true;
        self
    }

    /// The first `count` create-image calls fail with a throttling error.
    pub fn create_fails_transient(mut self, count: u32) -> Self {
        self.create_transient_failures = count;
        self
    }

    /// Every create-image call fails permanently.
    pub fn create_fails_permanent(mut self) -> Self {
        self.create_permanent = true;
        self
    }

    /// Status polls needed before a created image reports available.
    pub fn image_ready_after(mut self, polls: u32) -> Self {
        self.image_ready_polls = polls;
        self
    }

    /// The created image ends in the failed state.
    pub fn image_fails(mut self) -> Self {
        self.image_fails = true;
        self
    }

    /// The created image never leaves pending.
    pub fn image_never_ready(mut self) -> Self {
        self.image_never_ready = true;
        self
    }
}

struct InstanceSim {
    state: String,
    platform: String,
    tags: BTreeMap<String, String>,
    agent: AgentStatus,
    agent_online_after_pings: Option<u32>,
    ping_error: Option<GatewayError>,
    pings: u32,
    start_polls: u32,
    start_polls_remaining: Option<u32>,
    never_starts: bool,
    create_transient_failures: u32,
    create_permanent: bool,
    image_ready_polls: u32,
    image_fails: bool,
    image_never_ready: bool,
    create_calls: u32,
    start_calls: u32,
}

impl From<SimInstance> for InstanceSim {
    fn from(spec: SimInstance) -> Self {
        Self {
            state: spec.state,
            platform: spec.platform,
            tags: spec.tags,
            agent: spec.agent,
            agent_online_after_pings: spec.agent_online_after_pings,
            ping_error: spec.ping_error,
            pings: 0,
            start_polls: spec.start_polls,
            start_polls_remaining: None,
            never_starts: spec.never_starts,
            create_transient_failures: spec.create_transient_failures,
            create_permanent: spec.create_permanent,
            image_ready_polls: spec.image_ready_polls,
            image_fails: spec.image_fails,
            image_never_ready: spec.image_never_ready,
            create_calls: 0,
            start_calls: 0,
        }
    }
}

struct ImageSim {
    source_instance: String,
    tags: BTreeMap<String, String>,
    remaining_polls: u32,
    fails: bool,
}

#[derive(Default)]
struct ZoneSim {
    denied: Option<String>,
    instances: HashMap<String, InstanceSim>,
    images: HashMap<String, ImageSim>,
    acquire_count: u64,
    list_transient_failures: u32,
    list_calls: u32,
}

/// Simulated multi-zone control plane implementing all three gateway traits.
#[derive(Default)]
pub struct InMemoryCloud {
    zones: Mutex<HashMap<String, ZoneSim>>,
    image_seq: AtomicU64,
    op_delay_ms: AtomicU64,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&self, zone_id: &str) {
        self.zones
            .lock()
            .unwrap()
            .entry(zone_id.to_string())
            .or_default();
    }

    /// Session acquisition for this zone fails permanently with `message`.
    pub fn deny_zone(&self, zone_id: &str, message: &str) {
        let mut zones = self.zones.lock().unwrap();
        zones.entry(zone_id.to_string()).or_default().denied = Some(message.to_string());
    }

    /// The first `count` list calls in this zone fail with a throttling error.
    pub fn fail_list_transient(&self, zone_id: &str, count: u32) {
        let mut zones = self.zones.lock().unwrap();
        zones
            .entry(zone_id.to_string())
            .or_default()
            .list_transient_failures = count;
    }

    pub fn list_calls(&self, zone_id: &str) -> u32 {
        let zones = self.zones.lock().unwrap();
        zones.get(zone_id).map(|z| z.list_calls).unwrap_or(0)
    }

    pub fn add_instance(&self, zone_id: &str, spec: SimInstance) {
        let mut zones = self.zones.lock().unwrap();
        let zone = zones.entry(zone_id.to_string()).or_default();
        zone.instances.insert(spec.id.clone(), spec.into());
    }

    /// Artificial latency applied to every gateway operation; lets tests
    /// observe in-flight concurrency.
    pub fn set_op_delay(&self, delay: Duration) {
        self.op_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// (image id, source instance id, tags) for every image created in the zone.
    pub fn images(&self, zone_id: &str) -> Vec<(String, String, BTreeMap<String, String>)> {
        let zones = self.zones.lock().unwrap();
        zones
            .get(zone_id)
            .map(|z| {
                let mut images: Vec<_> = z
                    .images
                    .iter()
                    .map(|(id, img)| (id.clone(), img.source_instance.clone(), img.tags.clone()))
                    .collect();
                images.sort();
                images
            })
            .unwrap_or_default()
    }

    pub fn create_calls(&self, zone_id: &str, instance_id: &str) -> u32 {
        let zones = self.zones.lock().unwrap();
        zones
            .get(zone_id)
            .and_then(|z| z.instances.get(instance_id))
            .map(|i| i.create_calls)
            .unwrap_or(0)
    }

    pub fn start_calls(&self, zone_id: &str, instance_id: &str) -> u32 {
        let zones = self.zones.lock().unwrap();
        zones
            .get(zone_id)
            .and_then(|z| z.instances.get(instance_id))
            .map(|i| i.start_calls)
            .unwrap_or(0)
    }

    pub fn acquire_count(&self, zone_id: &str) -> u64 {
        let zones = self.zones.lock().unwrap();
        zones.get(zone_id).map(|z| z.acquire_count).unwrap_or(0)
    }

    pub fn raw_state(&self, zone_id: &str, instance_id: &str) -> Option<String> {
        let zones = self.zones.lock().unwrap();
        zones
            .get(zone_id)
            .and_then(|z| z.instances.get(instance_id))
            .map(|i| i.state.clone())
    }

    async fn delay(&self) {
        let ms = self.op_delay_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn with_zone<T>(
        &self,
        operation: &str,
        zone_id: &str,
        f: impl FnOnce(&mut ZoneSim) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut zones = self.zones.lock().unwrap();
        match zones.get_mut(zone_id) {
            Some(zone) => f(zone),
            None => Err(GatewayError::permanent(
                operation,
                format!("unknown landing zone: {zone_id}"),
            )),
        }
    }
}

fn matches_filters(sim: &InstanceSim, filters: &InstanceFilters) -> bool {
    if !filters.include_stopped && matches!(sim.state.as_str(), "stopped" | "stopping") {
        return false;
    }
    filters
        .tag_filters
        .iter()
        .all(|(k, v)| sim.tags.get(k) == Some(v))
}

#[async_trait::async_trait]
impl AccessProvider for InMemoryCloud {
    async fn acquire(&self, zone: &LandingZone) -> Result<Session, GatewayError> {
        self.delay().await;
        self.with_zone("acquire", &zone.id, |sim| {
            sim.acquire_count += 1;
            if let Some(message) = &sim.denied {
                return Err(GatewayError::permanent("acquire", message.clone()));
            }
            Ok(Session::for_zone(zone))
        })
    }
}

#[async_trait::async_trait]
impl ComputeGateway for InMemoryCloud {
    async fn list_instances(
        &self,
        session: &Session,
        filters: &InstanceFilters,
    ) -> Result<Vec<RawInstance>, GatewayError> {
        self.delay().await;
        self.with_zone("list_instances", &session.landing_zone, |zone| {
            zone.list_calls += 1;
            if zone.list_transient_failures > 0 {
                zone.list_transient_failures -= 1;
                return Err(GatewayError::retryable("list_instances", "request rate exceeded"));
            }
            let mut raws: Vec<RawInstance> = zone
                .instances
                .iter()
                .filter(|(_, sim)| matches_filters(sim, filters))
                .map(|(id, sim)| RawInstance {
                    id: id.clone(),
                    platform: sim.platform.clone(),
                    state: sim.state.clone(),
                    tags: sim.tags.clone(),
                })
                .collect();
            raws.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(raws)
        })
    }

    async fn create_image(
        &self,
        session: &Session,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ImageHandle, GatewayError> {
        self.delay().await;
        let image_id = format!("img-{:05}", self.image_seq.fetch_add(1, Ordering::Relaxed));
        self.with_zone("create_image", &session.landing_zone, |zone| {
            let sim = zone.instances.get_mut(instance_id).ok_or_else(|| {
                GatewayError::permanent("create_image", format!("unknown instance: {instance_id}"))
            })?;
            sim.create_calls += 1;
            if sim.create_permanent {
                return Err(GatewayError::permanent(
                    "create_image",
                    format!("image creation rejected for {instance_id}"),
                ));
            }
            if sim.create_transient_failures > 0 {
                sim.create_transient_failures -= 1;
                return Err(GatewayError::retryable("create_image", "request rate exceeded"));
            }
            let remaining_polls = if sim.image_never_ready {
                u32::MAX
            } else {
                sim.image_ready_polls
            };
            let fails = sim.image_fails;
            zone.images.insert(
                image_id.clone(),
                ImageSim {
                    source_instance: instance_id.to_string(),
                    tags: tags.clone(),
                    remaining_polls,
                    fails,
                },
            );
            Ok(ImageHandle { image_id })
        })
    }

    async fn describe_image(
        &self,
        session: &Session,
        handle: &ImageHandle,
    ) -> Result<ImageState, GatewayError> {
        self.delay().await;
        self.with_zone("describe_image", &session.landing_zone, |zone| {
            let image = zone.images.get_mut(&handle.image_id).ok_or_else(|| {
                GatewayError::permanent(
                    "describe_image",
                    format!("unknown image: {}", handle.image_id),
                )
            })?;
            if image.remaining_polls == 0 {
                if image.fails {
                    Ok(ImageState::Failed)
                } else {
                    Ok(ImageState::Available)
                }
            } else {
                if image.remaining_polls != u32::MAX {
                    image.remaining_polls -= 1;
                }
                Ok(ImageState::Pending)
            }
        })
    }

    async fn start_instance(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<(), GatewayError> {
        self.delay().await;
        self.with_zone("start_instance", &session.landing_zone, |zone| {
            let sim = zone.instances.get_mut(instance_id).ok_or_else(|| {
                GatewayError::permanent("start_instance", format!("unknown instance: {instance_id}"))
            })?;
            sim.start_calls += 1;
            if sim.state == "stopped" || sim.state == "stopping" {
                sim.state = "pending".to_string();
                sim.start_polls_remaining = if sim.never_starts {
                    None
                } else {
                    Some(sim.start_polls)
                };
            }
            Ok(())
        })
    }

    async fn describe_instance_state(
        &self,
        session: &Session,
        instance_id: &str,
    ) -> Result<InstanceState, GatewayError> {
        self.delay().await;
        self.with_zone("describe_instance_state", &session.landing_zone, |zone| {
            let sim = zone.instances.get_mut(instance_id).ok_or_else(|| {
                GatewayError::permanent(
                    "describe_instance_state",
                    format!("unknown instance: {instance_id}"),
                )
            })?;
            if let Some(remaining) = sim.start_polls_remaining {
                if remaining == 0 {
                    sim.state = "running".to_string();
                    sim.start_polls_remaining = None;
                } else {
                    sim.start_polls_remaining = Some(remaining - 1);
                }
            }
            Ok(InstanceState::from_raw(&sim.state))
        })
    }
}

#[async_trait::async_trait]
impl AgentGateway for InMemoryCloud {
    async fn ping(&self, session: &Session, instance_id: &str) -> Result<AgentStatus, GatewayError> {
        self.delay().await;
        self.with_zone("ping", &session.landing_zone, |zone| {
            let sim = zone.instances.get_mut(instance_id).ok_or_else(|| {
                GatewayError::permanent("ping", format!("unknown instance: {instance_id}"))
            })?;
            if let Some(err) = &sim.ping_error {
                return Err(err.clone());
            }
            sim.pings += 1;
            match sim.agent_online_after_pings {
                Some(threshold) if sim.pings > threshold => Ok(AgentStatus::Online),
                Some(_) => Ok(AgentStatus::Offline),
                None => Ok(sim.agent),
            }
        })
    }
}
