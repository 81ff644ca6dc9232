//! Per-interface packet probe
//!
//! One feed per captured interface. The capture source (a libpcap reader or
//! any other packet tap) attaches through the feed's sender; the pipeline
//! pump drains pending records into the table bound at registration time.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use crate::capture::Capture;
use crate::flow::PacketRecord;
use crate::graph::{Node, NodeId};
use crate::table::{FlowTable, TablePipeline};

use super::{ingest_packet, FlowProbe, ProbeError};

/// Backoff applied by the pump when every feed is empty, so an idle table
/// worker does not spin
const DRAIN_BACKOFF: Duration = Duration::from_millis(5);

struct Feed {
    probe_node_uuid: String,
    bpf_filter: Option<String>,
    table: Arc<FlowTable>,
    tx: Sender<PacketRecord>,
    rx: Receiver<PacketRecord>,
}

/// libpcap-style per-interface probe backend
pub struct PcapProbe {
    feeds: Arc<RwLock<HashMap<NodeId, Feed>>>,
}

impl PcapProbe {
    pub fn new() -> Self {
        Self {
            feeds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sender the external capture source pushes packet records into
    pub fn packet_sender(&self, node_id: &str) -> Option<Sender<PacketRecord>> {
        self.feeds.read().get(node_id).map(|f| f.tx.clone())
    }

    /// Packet filter expression the capture source must apply, if any
    pub fn feed_filter(&self, node_id: &str) -> Option<String> {
        self.feeds.read().get(node_id).and_then(|f| f.bpf_filter.clone())
    }
}

impl Default for PcapProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowProbe for PcapProbe {
    fn name(&self) -> &'static str {
        "pcap"
    }

    fn register_probe(
        &self,
        node: &Node,
        capture: &Capture,
        table: Arc<FlowTable>,
    ) -> Result<(), ProbeError> {
        let mut feeds = self.feeds.write();
        if feeds.contains_key(&node.id) {
            return Err(ProbeError::AlreadyRegistered(node.id.clone()));
        }

        let (tx, rx) = unbounded();
        feeds.insert(
            node.id.clone(),
            Feed {
                probe_node_uuid: node.id.clone(),
                bpf_filter: capture.bpf_filter.clone(),
                table,
                tx,
                rx,
            },
        );
        tracing::info!(node = %node.id, filter = ?capture.bpf_filter, "pcap probe registered");
        Ok(())
    }

    fn unregister_probe(&self, node: &Node) -> Result<(), ProbeError> {
        match self.feeds.write().remove(&node.id) {
            Some(_) => {
                tracing::info!(node = %node.id, "pcap probe unregistered");
                Ok(())
            }
            None => Err(ProbeError::UnknownNode(node.id.clone())),
        }
    }

    fn async_flow_pipeline(&self) -> TablePipeline {
        let feeds = self.feeds.clone();
        Arc::new(move || {
            let mut drained = false;
            {
                let feeds = feeds.read();
                for feed in feeds.values() {
                    while let Ok(record) = feed.rx.try_recv() {
                        ingest_packet(&feed.table, &feed.probe_node_uuid, &record);
                        drained = true;
                    }
                }
            }
            if !drained {
                thread::sleep(DRAIN_BACKOFF);
            }
        })
    }
}
