//! On-demand probe dispatcher
//!
//! Converges the set of running probes toward what the capture registry and
//! the topology graph imply: a probe runs on a node exactly when some
//! capture's traversal matches it and the node is a valid packet source.
//! Every reconcile pass holds the graph-level lock across traversal
//! evaluation and probe registration, so structural graph changes cannot
//! race the match loop and registrations never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::TableAllocator;
use crate::capture::{Capture, CaptureHandler, WatchAction, WatcherCallback, WatcherHandle};
use crate::flow::Flow;
use crate::graph::{Edge, Graph, GraphEventListener, Node, NodeId};
use crate::metrics::FlowMetrics;
use crate::probes::{is_capture_allowed, ProbeBundle};
use crate::table::{FlowSearchQuery, FlowSearchReply, FlowTable, TableQuery};
use crate::traversal::TraversalParser;
use crate::AgentError;

/// Reconciles (topology x capture registry) into running probes
pub struct OnDemandProbeListener {
    graph: Arc<Graph>,
    probes: Arc<ProbeBundle>,
    capture_handler: Arc<dyn CaptureHandler>,
    allocator: Arc<TableAllocator>,
    parser: Arc<dyn TraversalParser>,
    metrics: Arc<FlowMetrics>,
    host: String,
    active_probes: Mutex<HashMap<NodeId, Arc<FlowTable>>>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl OnDemandProbeListener {
    /// Build a dispatcher; fails only when no host identity is available
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<Graph>,
        probes: Arc<ProbeBundle>,
        capture_handler: Arc<dyn CaptureHandler>,
        allocator: Arc<TableAllocator>,
        parser: Arc<dyn TraversalParser>,
        metrics: Arc<FlowMetrics>,
        host: Option<String>,
    ) -> Result<Self, AgentError> {
        let host = host
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .ok_or(AgentError::HostIdentity)?;

        Ok(Self {
            graph,
            probes,
            capture_handler,
            allocator,
            parser,
            metrics,
            host,
            active_probes: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Subscribe to the capture registry (existing captures are replayed)
    /// and to graph events
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let callback: WatcherCallback = Arc::new(move |action, id, capture| {
            if let Some(listener) = weak.upgrade() {
                listener.on_watcher_event(action, id, capture);
            }
        });
        *self.watcher.lock() = Some(self.capture_handler.async_watch(callback));
        self.graph.add_event_listener(self.clone());
        tracing::info!(host = %self.host, "on-demand probe dispatcher started");
    }

    /// Detach from the capture registry; running probes stay up
    pub fn stop(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }

    /// Tear down every running probe; used on agent shutdown
    pub fn detach_all(&self) {
        let _graph = self.graph.lock();
        let ids: Vec<NodeId> = self.active_probes.lock().keys().cloned().collect();
        for id in ids {
            match self.graph.get_node(&id) {
                Some(node) => self.unregister_probe(&node),
                // node already gone from the topology, just drop the table
                None => {
                    if let Some(table) = self.active_probes.lock().remove(&id) {
                        self.allocator.release(&table);
                        self.metrics.probe_stopped();
                    }
                }
            }
        }
    }

    /// Host this dispatcher runs on
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Number of probes currently running
    pub fn active_probe_count(&self) -> usize {
        self.active_probes.lock().len()
    }

    /// Whether a probe is running on the given node
    pub fn has_active_probe(&self, node_id: &str) -> bool {
        self.active_probes.lock().contains_key(node_id)
    }

    /// Fan a flow search across every active table, merging results sorted
    /// by `last` descending
    pub fn search_flows(&self, node_uuids: &[String]) -> Vec<Flow> {
        let tables: Vec<Arc<FlowTable>> = self.active_probes.lock().values().cloned().collect();
        let query = FlowSearchQuery {
            node_uuids: node_uuids.to_vec(),
        };

        let mut flows = Vec::new();
        for table in tables {
            let reply = match table.query(TableQuery::flow_search(&query)) {
                Some(reply) if reply.status == 200 => reply,
                _ => continue,
            };
            if let Ok(found) = serde_json::from_value::<FlowSearchReply>(reply.obj) {
                flows.extend(found.flows);
            }
        }
        flows.sort_by(|a, b| b.statistics.last.cmp(&a.statistics.last));
        self.metrics.query_served();
        flows
    }

    fn on_watcher_event(&self, action: WatchAction, id: &str, capture: &Capture) {
        tracing::debug!(?action, id, "capture registry event");
        if action.is_added() {
            self.on_capture_added(capture);
        } else if action.is_removed() {
            self.on_capture_deleted(capture);
        }
    }

    fn on_capture_added(&self, capture: &Capture) {
        // locked across evaluation + registration so graph mutations
        // cannot race the match loop
        let _graph = self.graph.lock();
        let nodes = match self.parser.eval(&self.graph, &capture.gremlin_query) {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::error!(%err, capture = %capture.uuid, "invalid capture traversal");
                return;
            }
        };
        for node in &nodes {
            self.register_probe(node, capture);
        }
    }

    fn on_capture_deleted(&self, capture: &Capture) {
        let _graph = self.graph.lock();
        let nodes = match self.parser.eval(&self.graph, &capture.gremlin_query) {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::error!(%err, capture = %capture.uuid, "invalid capture traversal");
                return;
            }
        };
        for node in &nodes {
            self.unregister_probe(node);
        }
    }

    fn matches_traversal(&self, node: &Node, capture: &Capture) -> bool {
        match self.parser.eval(&self.graph, &capture.gremlin_query) {
            Ok(nodes) => nodes.iter().any(|n| n.id == node.id),
            Err(err) => {
                tracing::error!(%err, capture = %capture.uuid, "invalid capture traversal");
                false
            }
        }
    }

    fn reconcile_node(&self, node: &Node) {
        let _graph = self.graph.lock();
        for capture in self.capture_handler.index() {
            if self.matches_traversal(node, &capture) {
                self.register_probe(node, &capture);
            }
        }
    }

    /// Idempotent: a node with a running probe keeps it (first-writer-wins)
    fn register_probe(&self, node: &Node, capture: &Capture) {
        if !is_capture_allowed(node) {
            tracing::info!(
                node = %node.id,
                node_type = ?node.node_type(),
                "flow probe not registered, type not supported"
            );
            return;
        }

        let probe = match self.probes.probe_for_node(node) {
            Some(probe) => probe,
            None => {
                tracing::error!(node = %node.id, "no probe backend for node type");
                return;
            }
        };

        if self.active_probes.lock().contains_key(&node.id) {
            tracing::debug!(node = %node.id, "a probe already exists");
            return;
        }

        let table = self.allocator.alloc(probe.async_flow_pipeline());
        if let Err(err) = probe.register_probe(node, capture, table.clone()) {
            tracing::debug!(%err, node = %node.id, "failed to register flow probe");
            self.allocator.release(&table);
            return;
        }

        self.active_probes.lock().insert(node.id.clone(), table);
        self.graph
            .add_metadata_silent(&node.id, "State.FlowCapture", "ON");
        self.metrics.probe_started();
    }

    /// No-op when the node has no running probe
    fn unregister_probe(&self, node: &Node) {
        let probe = match self.probes.probe_for_node(node) {
            Some(probe) => probe,
            None => return,
        };

        if let Err(err) = probe.unregister_probe(node) {
            tracing::debug!(%err, node = %node.id, "failed to unregister flow probe");
        }

        if let Some(table) = self.active_probes.lock().remove(&node.id) {
            self.allocator.release(&table);
            self.metrics.probe_stopped();
        }
        self.graph
            .add_metadata_silent(&node.id, "State.FlowCapture", "OFF");
    }
}

impl GraphEventListener for OnDemandProbeListener {
    fn on_node_added(&self, node: &Node) {
        self.reconcile_node(node);
    }

    fn on_node_updated(&self, node: &Node) {
        self.reconcile_node(node);
    }

    fn on_node_deleted(&self, node: &Node) {
        let _graph = self.graph.lock();
        self.unregister_probe(node);
    }

    fn on_edge_added(&self, edge: &Edge) {
        let (parent, child) = self.graph.edge_nodes(edge);
        // sFlow bridges become capturable once their port structure is
        // known, which edge creation signals
        if let Some(parent) = parent {
            if parent.node_type() == Some("ovsbridge") {
                self.reconcile_node(&parent);
                return;
            }
        }
        if let Some(child) = child {
            if child.node_type() == Some("ovsbridge") {
                self.reconcile_node(&child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LogEventSink;
    use crate::capture::CaptureApiHandler;
    use crate::graph::Metadata;
    use crate::probes::{OvsSflowProbe, PcapProbe};
    use crate::traversal::GremlinParser;
    use std::time::{Duration, Instant};

    struct Fixture {
        graph: Arc<Graph>,
        captures: Arc<CaptureApiHandler>,
        pcap: Arc<PcapProbe>,
        sflow: Arc<OvsSflowProbe>,
        allocator: Arc<TableAllocator>,
        listener: Arc<OnDemandProbeListener>,
    }

    fn fixture() -> Fixture {
        let graph = Arc::new(Graph::new());
        let captures = Arc::new(CaptureApiHandler::new());
        let pcap = Arc::new(PcapProbe::new());
        let sflow = Arc::new(OvsSflowProbe::new(graph.clone()));

        let bundle = Arc::new(ProbeBundle::new());
        bundle.register(pcap.clone());
        bundle.register(sflow.clone());

        let allocator = Arc::new(TableAllocator::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Arc::new(LogEventSink),
        ));

        let listener = Arc::new(
            OnDemandProbeListener::new(
                graph.clone(),
                bundle,
                captures.clone(),
                allocator.clone(),
                Arc::new(GremlinParser),
                Arc::new(FlowMetrics::new()),
                Some("host-1".into()),
            )
            .unwrap(),
        );
        listener.start();

        Fixture {
            graph,
            captures,
            pcap,
            sflow,
            allocator,
            listener,
        }
    }

    fn device(id: &str) -> Node {
        Node::new(id, "host-1", [("Type", "device"), ("Name", id)])
    }

    fn bridge(id: &str) -> Node {
        Node::new(id, "host-1", [("Type", "ovsbridge"), ("Name", id)])
    }

    fn capture_state(graph: &Graph, id: &str) -> Option<String> {
        graph
            .get_node(id)?
            .metadata
            .get("State.FlowCapture")
            .cloned()
    }

    #[test]
    fn test_capture_added_starts_pcap_probe() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));

        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));

        assert!(fx.listener.has_active_probe("eth0"));
        assert_eq!(fx.listener.active_probe_count(), 1);
        assert_eq!(capture_state(&fx.graph, "eth0").as_deref(), Some("ON"));
        assert!(fx.pcap.packet_sender("eth0").is_some());
        assert_eq!(fx.allocator.active(), 1);
    }

    #[test]
    fn test_capture_deleted_stops_probe() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        let capture = fx
            .captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));

        fx.captures.delete(&capture.uuid);

        assert!(!fx.listener.has_active_probe("eth0"));
        assert_eq!(capture_state(&fx.graph, "eth0").as_deref(), Some("OFF"));
        assert!(fx.pcap.packet_sender("eth0").is_none());
        assert_eq!(fx.allocator.active(), 0);
    }

    #[test]
    fn test_bridge_waits_for_edge() {
        let fx = fixture();
        fx.graph.add_node(bridge("br0"));

        fx.captures
            .create(Capture::new("G.V().Has('Type', 'ovsbridge')", None));

        // no port structure yet: backend refuses, table released
        assert!(!fx.listener.has_active_probe("br0"));
        assert_eq!(fx.allocator.active(), 0);
        assert_ne!(capture_state(&fx.graph, "br0").as_deref(), Some("ON"));

        fx.graph.add_node(device("eth0"));
        fx.graph.add_edge(Edge {
            id: "e1".into(),
            parent: "br0".into(),
            child: "eth0".into(),
            metadata: Metadata::new(),
        });

        assert!(fx.listener.has_active_probe("br0"));
        assert_eq!(capture_state(&fx.graph, "br0").as_deref(), Some("ON"));
        assert!(fx.sflow.sample_sender("br0").is_some());
    }

    #[test]
    fn test_node_added_after_capture() {
        let fx = fixture();
        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth1')", None));
        assert_eq!(fx.listener.active_probe_count(), 0);

        fx.graph.add_node(device("eth1"));
        assert!(fx.listener.has_active_probe("eth1"));
    }

    #[test]
    fn test_node_deleted_stops_probe() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));
        assert!(fx.listener.has_active_probe("eth0"));

        fx.graph.del_node("eth0");
        assert!(!fx.listener.has_active_probe("eth0"));
        assert_eq!(fx.allocator.active(), 0);
    }

    #[test]
    fn test_first_writer_wins() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));
        fx.captures
            .create(Capture::new("G.V().Has('Type', 'device')", Some("tcp".into())));

        assert_eq!(fx.listener.active_probe_count(), 1);
        // the first capture's (absent) filter is the one installed
        assert!(fx.pcap.feed_filter("eth0").is_none());
    }

    #[test]
    fn test_invalid_traversal_is_dropped() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.captures.create(Capture::new("G.V().Out()", None));

        assert_eq!(fx.listener.active_probe_count(), 0);
        // registry still holds the capture, it just starts nothing
        assert_eq!(fx.captures.index().len(), 1);
    }

    #[test]
    fn test_unsupported_node_type_skipped() {
        let fx = fixture();
        fx.graph
            .add_node(Node::new("ns1", "host-1", [("Type", "netns"), ("Name", "ns1")]));
        fx.captures.create(Capture::new("G.V()", None));

        assert_eq!(fx.listener.active_probe_count(), 0);
    }

    #[test]
    fn test_watch_replay_registers_existing_captures() {
        let graph = Arc::new(Graph::new());
        graph.add_node(device("eth0"));
        let captures = Arc::new(CaptureApiHandler::new());
        captures.create(Capture::new("G.V().Has('Name', 'eth0')", None));

        let bundle = Arc::new(ProbeBundle::new());
        bundle.register(Arc::new(PcapProbe::new()));
        let allocator = Arc::new(TableAllocator::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Arc::new(LogEventSink),
        ));
        let listener = Arc::new(
            OnDemandProbeListener::new(
                graph.clone(),
                bundle,
                captures,
                allocator,
                Arc::new(GremlinParser),
                Arc::new(FlowMetrics::new()),
                Some("host-1".into()),
            )
            .unwrap(),
        );

        assert_eq!(listener.active_probe_count(), 0);
        listener.start();
        assert!(listener.has_active_probe("eth0"));
    }

    #[test]
    fn test_missing_host_identity() {
        let graph = Arc::new(Graph::new());
        let bundle = Arc::new(ProbeBundle::new());
        let allocator = Arc::new(TableAllocator::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Arc::new(LogEventSink),
        ));
        let result = OnDemandProbeListener::new(
            graph,
            bundle,
            Arc::new(CaptureApiHandler::new()),
            allocator,
            Arc::new(GremlinParser),
            Arc::new(FlowMetrics::new()),
            Some(String::new()),
        );
        assert!(matches!(result, Err(AgentError::HostIdentity)));
    }

    #[test]
    fn test_detach_all() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.graph.add_node(device("eth1"));
        fx.captures
            .create(Capture::new("G.V().Has('Type', 'device')", None));
        assert_eq!(fx.listener.active_probe_count(), 2);

        fx.listener.stop();
        fx.listener.detach_all();

        assert_eq!(fx.listener.active_probe_count(), 0);
        assert_eq!(fx.allocator.active(), 0);
        assert_eq!(capture_state(&fx.graph, "eth0").as_deref(), Some("OFF"));
    }

    #[test]
    fn test_stopped_listener_ignores_registry() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.listener.stop();

        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));
        assert_eq!(fx.listener.active_probe_count(), 0);
    }

    #[test]
    fn test_ingest_and_search_end_to_end() {
        let fx = fixture();
        fx.graph.add_node(device("eth0"));
        fx.captures
            .create(Capture::new("G.V().Has('Name', 'eth0')", None));

        let sender = fx.pcap.packet_sender("eth0").unwrap();
        sender
            .send(crate::flow::PacketRecord {
                timestamp: 100,
                length: 64,
                link: Some(("aa:00:00:00:00:01".into(), "aa:00:00:00:00:02".into())),
                ..Default::default()
            })
            .unwrap();

        // the table worker's pipeline pump picks the record up
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let flows = fx.listener.search_flows(&["eth0".to_string()]);
            if !flows.is_empty() {
                assert_eq!(flows[0].probe_node_uuid, "eth0");
                break;
            }
            assert!(Instant::now() < deadline, "flow never ingested");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
