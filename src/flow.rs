//! Flow records and statistics
//!
//! A flow is a bidirectional aggregation of packet observations, keyed by a
//! content-derived UUID so that both directions of the same conversation map
//! to a single record.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol layer of an endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    /// L2 (MAC addresses)
    Link,
    /// L3 (IP addresses)
    Network,
    /// L4 (ports)
    Transport,
}

/// One direction of an endpoint pair, with its cumulative counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEndpoint {
    /// Endpoint value (MAC, IP or port, depending on the layer)
    pub value: String,
    /// Packets seen in this direction
    pub packets: u64,
    /// Bytes seen in this direction
    pub bytes: u64,
}

/// Symmetric endpoint pair at one protocol layer
///
/// `ab` is the direction of the first observation; `ba` the reverse. The two
/// values are always distinct (observations between identical endpoints are
/// dropped at ingest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLayer {
    /// Protocol layer
    pub layer: LayerType,
    /// First-seen direction
    pub ab: FlowEndpoint,
    /// Reverse direction
    pub ba: FlowEndpoint,
}

/// Statistics block of a flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatistics {
    /// Seconds since epoch of the first observation
    pub start: i64,
    /// Seconds since epoch of the most recent observation
    pub last: i64,
    /// Per-layer endpoint pairs and counters
    pub layers: Vec<FlowLayer>,
}

/// A bidirectional flow record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Content-derived identifier, stable across observations of the same flow
    pub uuid: String,
    /// Topology node the owning probe is attached to
    pub probe_node_uuid: String,
    /// Ingress interface node, when the backend knows it
    pub if_src_node_uuid: Option<String>,
    /// Egress interface node, when the backend knows it
    pub if_dst_node_uuid: Option<String>,
    /// Statistics block
    pub statistics: FlowStatistics,
}

impl Flow {
    /// Create an empty flow record for the given UUID
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            probe_node_uuid: String::new(),
            if_src_node_uuid: None,
            if_dst_node_uuid: None,
            statistics: FlowStatistics::default(),
        }
    }

    /// Fill identity and first-observation statistics from a packet record
    pub fn init_from(&mut self, probe_node_uuid: &str, record: &PacketRecord) {
        self.probe_node_uuid = probe_node_uuid.to_string();
        self.if_src_node_uuid = record.if_src_node_uuid.clone();
        self.if_dst_node_uuid = record.if_dst_node_uuid.clone();
        self.statistics.start = record.timestamp;
        self.statistics.last = record.timestamp;
        self.statistics.layers = record
            .layer_values()
            .map(|(layer, (a, b))| FlowLayer {
                layer,
                ab: FlowEndpoint {
                    value: a.clone(),
                    packets: 1,
                    bytes: record.length,
                },
                ba: FlowEndpoint {
                    value: b.clone(),
                    packets: 0,
                    bytes: 0,
                },
            })
            .collect();
    }

    /// Merge a subsequent observation into the statistics block
    pub fn update_from(&mut self, record: &PacketRecord) {
        if record.timestamp > self.statistics.last {
            self.statistics.last = record.timestamp;
        }
        for (layer, (src, _)) in record.layer_values() {
            if let Some(fl) = self.statistics.layers.iter_mut().find(|l| l.layer == layer) {
                let ep = if fl.ab.value == *src { &mut fl.ab } else { &mut fl.ba };
                ep.packets += 1;
                ep.bytes += record.length;
            }
        }
    }

    /// Endpoint pair at the given layer, if the flow carries one
    pub fn layer(&self, layer: LayerType) -> Option<&FlowLayer> {
        self.statistics.layers.iter().find(|l| l.layer == layer)
    }

    /// Whether the flow was observed on the given topology node
    pub fn matches_node(&self, uuid: &str) -> bool {
        self.probe_node_uuid == uuid
            || self.if_src_node_uuid.as_deref() == Some(uuid)
            || self.if_dst_node_uuid.as_deref() == Some(uuid)
    }
}

/// A single parsed packet or sample, as delivered by a probe backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Seconds since epoch of the observation
    pub timestamp: i64,
    /// Wire length in bytes
    pub length: u64,
    /// L2 (source, destination) MAC addresses
    pub link: Option<(String, String)>,
    /// L3 (source, destination) IP addresses
    pub network: Option<(String, String)>,
    /// L4 (source, destination) ports
    pub transport: Option<(String, String)>,
    /// Ingress interface node, when the backend maps ports to topology
    pub if_src_node_uuid: Option<String>,
    /// Egress interface node
    pub if_dst_node_uuid: Option<String>,
}

impl PacketRecord {
    pub(crate) fn layer_values(&self) -> impl Iterator<Item = (LayerType, &(String, String))> {
        [
            (LayerType::Link, self.link.as_ref()),
            (LayerType::Network, self.network.as_ref()),
            (LayerType::Transport, self.transport.as_ref()),
        ]
        .into_iter()
        .filter_map(|(layer, pair)| pair.map(|p| (layer, p)))
    }

    /// A record whose endpoints coincide at some layer cannot form a flow
    pub fn is_degenerate(&self) -> bool {
        self.layer_values().any(|(_, (a, b))| a == b) || self.layer_values().next().is_none()
    }
}

/// Derive the flow UUID for a packet observed on a probe node
///
/// Endpoints are ordered before hashing so that both directions of a
/// conversation produce the same UUID.
pub fn flow_uuid(probe_node_uuid: &str, record: &PacketRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(probe_node_uuid.as_bytes());
    for (layer, (a, b)) in record.layer_values() {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        hasher.update(match layer {
            LayerType::Link => &b"link"[..],
            LayerType::Network => &b"network"[..],
            LayerType::Transport => &b"transport"[..],
        });
        hasher.update(lo.as_bytes());
        hasher.update(hi.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str, dst: &str, ts: i64, len: u64) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            length: len,
            link: Some((src.to_string(), dst.to_string())),
            network: Some(("10.0.0.1".into(), "10.0.0.2".into())),
            ..Default::default()
        }
    }

    #[test]
    fn test_uuid_direction_invariant() {
        let fwd = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 100, 64);
        let rev = record("aa:bb:cc:00:00:02", "aa:bb:cc:00:00:01", 101, 64);
        assert_eq!(flow_uuid("probe-1", &fwd), flow_uuid("probe-1", &rev));
    }

    #[test]
    fn test_uuid_depends_on_probe_node() {
        let pkt = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 100, 64);
        assert_ne!(flow_uuid("probe-1", &pkt), flow_uuid("probe-2", &pkt));
    }

    #[test]
    fn test_directional_counters() {
        let fwd = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 100, 64);
        let rev = record("aa:bb:cc:00:00:02", "aa:bb:cc:00:00:01", 105, 128);

        let mut flow = Flow::new(flow_uuid("probe-1", &fwd));
        flow.init_from("probe-1", &fwd);
        flow.update_from(&rev);

        let link = flow.layer(LayerType::Link).unwrap();
        assert_eq!(link.ab.value, "aa:bb:cc:00:00:01");
        assert_eq!(link.ab.packets, 1);
        assert_eq!(link.ab.bytes, 64);
        assert_eq!(link.ba.packets, 1);
        assert_eq!(link.ba.bytes, 128);
        assert_eq!(flow.statistics.start, 100);
        assert_eq!(flow.statistics.last, 105);
    }

    #[test]
    fn test_last_is_monotone() {
        let first = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 100, 64);
        let stale = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 90, 64);

        let mut flow = Flow::new("f");
        flow.init_from("probe-1", &first);
        flow.update_from(&stale);

        assert_eq!(flow.statistics.last, 100);
        assert!(flow.statistics.start <= flow.statistics.last);
    }

    #[test]
    fn test_degenerate_record() {
        let same = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:01", 100, 64);
        assert!(same.is_degenerate());
        assert!(PacketRecord::default().is_degenerate());
        let ok = record("aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", 100, 64);
        assert!(!ok.is_degenerate());
    }

    #[test]
    fn test_matches_node() {
        let mut flow = Flow::new("f");
        flow.probe_node_uuid = "n1".into();
        flow.if_src_node_uuid = Some("n2".into());
        assert!(flow.matches_node("n1"));
        assert!(flow.matches_node("n2"));
        assert!(!flow.matches_node("n3"));
    }
}
