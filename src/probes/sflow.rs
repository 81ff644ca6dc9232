//! OVS sFlow bridge probe
//!
//! Captures on Open vSwitch bridges by consuming sFlow samples. A bridge
//! only becomes capturable once its port structure is known, which the
//! topology signals through edge creation; registration is refused until
//! then and the dispatcher retries on the next matching event.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::capture::Capture;
use crate::flow::PacketRecord;
use crate::graph::{Graph, Node, NodeId};
use crate::table::{FlowTable, TablePipeline};

use super::{ingest_packet, FlowProbe, ProbeError};

const DRAIN_BACKOFF: Duration = Duration::from_millis(5);

/// One sFlow datagram worth of flow samples
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SflowSample {
    pub records: Vec<PacketRecord>,
}

struct Feed {
    probe_node_uuid: String,
    table: Arc<FlowTable>,
    tx: Sender<SflowSample>,
    rx: Receiver<SflowSample>,
}

/// sFlow probe backend for `ovsbridge` nodes
pub struct OvsSflowProbe {
    graph: Arc<Graph>,
    feeds: Arc<RwLock<HashMap<NodeId, Feed>>>,
}

impl OvsSflowProbe {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            feeds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sender the sFlow collector pushes samples into
    pub fn sample_sender(&self, node_id: &str) -> Option<Sender<SflowSample>> {
        self.feeds.read().get(node_id).map(|f| f.tx.clone())
    }
}

impl FlowProbe for OvsSflowProbe {
    fn name(&self) -> &'static str {
        "ovssflow"
    }

    fn register_probe(
        &self,
        node: &Node,
        _capture: &Capture,
        table: Arc<FlowTable>,
    ) -> Result<(), ProbeError> {
        if node.node_type() != Some("ovsbridge") {
            return Err(ProbeError::NotCapturable(node.id.clone()));
        }
        if !self.graph.has_edges(&node.id) {
            return Err(ProbeError::BridgeNotReady(node.id.clone()));
        }

        let mut feeds = self.feeds.write();
        if feeds.contains_key(&node.id) {
            return Err(ProbeError::AlreadyRegistered(node.id.clone()));
        }

        let (tx, rx) = unbounded();
        feeds.insert(
            node.id.clone(),
            Feed {
                probe_node_uuid: node.id.clone(),
                table,
                tx,
                rx,
            },
        );
        tracing::info!(bridge = %node.id, "sflow probe registered");
        Ok(())
    }

    fn unregister_probe(&self, node: &Node) -> Result<(), ProbeError> {
        match self.feeds.write().remove(&node.id) {
            Some(_) => {
                tracing::info!(bridge = %node.id, "sflow probe unregistered");
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
                    while let Ok(sample) = feed.rx.try_recv() {
                        for record in &sample.records {
                            ingest_packet(&feed.table, &feed.probe_node_uuid, record);
                        }
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
