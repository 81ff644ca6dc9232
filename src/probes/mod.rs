//! Flow probes
//!
//! A probe consumes packets or samples from a single topology node and
//! writes flow records into one bound flow table. Backends share a uniform
//! contract so the on-demand dispatcher can start and stop them without
//! knowing how the bytes arrive.

pub mod pcap;
pub mod sflow;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::capture::Capture;
use crate::flow::{flow_uuid, PacketRecord};
use crate::graph::Node;
use crate::table::{FlowTable, TablePipeline};

pub use pcap::PcapProbe;
pub use sflow::OvsSflowProbe;

/// Node types that can act as packet sources
const CAPTURE_TYPES: &[&str] = &["device", "internal", "veth", "tun", "bridge", "ovsbridge"];

/// Whether a topology node is a valid packet source
pub fn is_capture_allowed(node: &Node) -> bool {
    node.node_type()
        .map_or(false, |t| CAPTURE_TYPES.contains(&t))
}

/// Probe backend errors
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No feed is registered for the node
    #[error("no probe registered for node {0}")]
    UnknownNode(String),
    /// The node cannot be captured by this backend
    #[error("node {0} is not a valid packet source for this backend")]
    NotCapturable(String),
    /// A probe is already installed on the node
    #[error("a probe already exists for node {0}")]
    AlreadyRegistered(String),
    /// The bridge has no known port structure yet
    #[error("bridge {0} has no ports yet")]
    BridgeNotReady(String),
}

/// Uniform contract over packet-source backends
pub trait FlowProbe: Send + Sync {
    /// Backend name used for bundle lookup
    fn name(&self) -> &'static str;

    /// Install a probe on `node`, writing flows into `table`
    fn register_probe(
        &self,
        node: &Node,
        capture: &Capture,
        table: Arc<FlowTable>,
    ) -> Result<(), ProbeError>;

    /// Tear down the probe installed on `node`
    fn unregister_probe(&self, node: &Node) -> Result<(), ProbeError>;

    /// Pump draining this backend's buffers into their bound tables;
    /// installed as the idle task of every table allocated for the backend
    fn async_flow_pipeline(&self) -> TablePipeline;
}

/// The set of available probe backends, keyed by name
pub struct ProbeBundle {
    probes: RwLock<HashMap<&'static str, Arc<dyn FlowProbe>>>,
}

impl ProbeBundle {
    pub fn new() -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// Add a backend to the bundle
    pub fn register(&self, probe: Arc<dyn FlowProbe>) {
        self.probes.write().insert(probe.name(), probe);
    }

    /// Backend lookup by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowProbe>> {
        self.probes.read().get(name).cloned()
    }

    /// Backend selection rule: ovsbridge nodes go to sFlow, everything else
    /// to the per-interface packet probe
    pub fn probe_for_node(&self, node: &Node) -> Option<Arc<dyn FlowProbe>> {
        let name = match node.node_type() {
            Some("ovsbridge") => "ovssflow",
            _ => "pcap",
        };
        self.get(name)
    }
}

impl Default for ProbeBundle {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge one packet observation into the table, creating the flow on first
/// sight of its key
pub fn ingest_packet(table: &FlowTable, probe_node_uuid: &str, record: &PacketRecord) {
    if record.is_degenerate() {
        tracing::debug!(?record, "dropping observation without two distinct endpoints");
        return;
    }
    let uuid = flow_uuid(probe_node_uuid, record);
    let (flow, created) = table.get_or_create_flow(&uuid);
    let mut flow = flow.write();
    if created {
        flow.init_from(probe_node_uuid, record);
    } else {
        flow.update_from(record);
    }
}
