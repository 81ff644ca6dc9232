//! FlowScope Agent - Topology-Driven Flow Capture
//!
//! Per-host agent that discovers the local network topology, attaches
//! flow-capture probes to whichever nodes match the declared capture
//! resources, and aggregates per-flow statistics in in-memory tables.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        FLOWSCOPE AGENT                           │
//! │                                                                  │
//! │  ┌───────────────┐     events      ┌───────────────────────────┐ │
//! │  │ CAPTURE       ├────────────────►│ ON-DEMAND DISPATCHER      │ │
//! │  │ REGISTRY      │                 │ reconcile registry ×      │ │
//! │  └───────────────┘                 │ topology into probes      │ │
//! │  ┌───────────────┐     events      └──────────┬────────────────┘ │
//! │  │ TOPOLOGY      ├────────────────────────────┘                  │
//! │  │ GRAPH         │                 register / unregister         │
//! │  └───────────────┘                            │                  │
//! │                      ┌────────────────────────▼───────────────┐  │
//! │                      │ PROBE BACKENDS (pcap | ovs sflow)      │  │
//! │                      └────────────────────────┬───────────────┘  │
//! │                                 observations  │                  │
//! │                      ┌────────────────────────▼───────────────┐  │
//! │                      │ FLOW TABLES (update / expire / query)  │  │
//! │                      └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod api;
pub mod capture;
pub mod config;
pub mod flow;
pub mod graph;
pub mod metrics;
pub mod ondemand;
pub mod probes;
pub mod table;
pub mod traversal;

use std::sync::Arc;

use thiserror::Error;

use allocator::{FlowEventSink, TableAllocator};
use probes::{OvsSflowProbe, PcapProbe, ProbeBundle};
use traversal::GremlinParser;

pub use capture::{Capture, CaptureApiHandler, CaptureHandler};
pub use config::AgentConfig;
pub use flow::{Flow, PacketRecord};
pub use graph::{Graph, Node};
pub use metrics::FlowMetrics;
pub use ondemand::OnDemandProbeListener;
pub use table::{FlowTable, TableQuery, TableReply};

/// Agent error types
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("host identity unavailable")]
    HostIdentity,
    #[error("network error: {0}")]
    Network(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("probe error: {0}")]
    Probe(#[from] probes::ProbeError),
    #[error("traversal error: {0}")]
    Traversal(#[from] traversal::TraversalError),
}

/// Forwards flow batches downstream and keeps the counters current
struct AgentEventSink {
    metrics: Arc<FlowMetrics>,
}

impl FlowEventSink for AgentEventSink {
    fn on_flows_updated(&self, flows: &[Flow]) {
        if !flows.is_empty() {
            self.metrics.flows_updated(flows.len() as u64);
            tracing::debug!(count = flows.len(), "flows updated");
        }
    }

    fn on_flows_expired(&self, flows: &[Flow]) {
        if !flows.is_empty() {
            self.metrics.flows_expired(flows.len() as u64);
            tracing::debug!(count = flows.len(), "flows expired");
        }
    }
}

/// The assembled agent
pub struct FlowScopeAgent {
    /// Configuration
    pub config: AgentConfig,
    /// Topology graph
    pub graph: Arc<Graph>,
    /// Capture registry
    pub captures: Arc<CaptureApiHandler>,
    /// Probe backends
    pub probes: Arc<ProbeBundle>,
    /// Flow table owner
    pub allocator: Arc<TableAllocator>,
    /// Capture dispatcher
    pub listener: Arc<OnDemandProbeListener>,
    /// Counters
    pub metrics: Arc<FlowMetrics>,
}

impl FlowScopeAgent {
    /// Wire all subsystems; fails only when no host identity is available
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let graph = Arc::new(Graph::new());
        let metrics = Arc::new(FlowMetrics::new());
        let captures = Arc::new(CaptureApiHandler::new());

        let probes = Arc::new(ProbeBundle::new());
        probes.register(Arc::new(PcapProbe::new()));
        probes.register(Arc::new(OvsSflowProbe::new(graph.clone())));

        let allocator = Arc::new(TableAllocator::new(
            config.flow.update_every(),
            config.flow.update_window(),
            config.flow.expire_every(),
            config.flow.expire_window(),
            Arc::new(AgentEventSink {
                metrics: metrics.clone(),
            }),
        ));

        let listener = Arc::new(OnDemandProbeListener::new(
            graph.clone(),
            probes.clone(),
            captures.clone(),
            allocator.clone(),
            Arc::new(GremlinParser),
            metrics.clone(),
            config.host_id.clone(),
        )?);

        Ok(Self {
            config,
            graph,
            captures,
            probes,
            allocator,
            listener,
            metrics,
        })
    }

    /// Subscribe the dispatcher to the registry and the graph
    pub fn start(&self) {
        self.listener.start();
    }

    /// Start the dispatcher and serve the local API
    pub async fn run(&self) -> Result<(), AgentError> {
        self.start();
        let state = Arc::new(api::ApiState {
            captures: self.captures.clone(),
            listener: self.listener.clone(),
            metrics: self.metrics.clone(),
        });
        api::start_server(&self.config.listen_addr, state).await
    }

    /// Detach the dispatcher and tear down every running probe
    pub fn stop(&self) {
        self.listener.stop();
        self.listener.detach_all();
        tracing::info!("agent stopped");
    }
}
