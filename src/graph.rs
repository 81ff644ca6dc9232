//! Topology Graph
//!
//! In-memory view of the host topology (interfaces, bridges and the links
//! between them). The graph is the source of truth the capture dispatcher
//! reconciles against. A graph-level lock serializes structural changes:
//! every mutator acquires it (and holds it while fanning events out to
//! listeners), and compound operations such as traversal evaluation plus
//! probe registration hold it via [`Graph::lock`] so no mutation can race
//! them. The lock is reentrant, so listeners and lock holders may call
//! back into the graph from the same thread.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::{Deserialize, Serialize};

/// Stable topology node identifier
pub type NodeId = String;

/// Flat key/value node or edge annotations; nested keys use dots
/// (e.g. `State.FlowCapture`)
pub type Metadata = HashMap<String, String>;

/// A topology node (interface, bridge, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier
    pub id: NodeId,
    /// Host the node was discovered on
    pub host: String,
    /// Node annotations; `Type` is always present for packet sources
    pub metadata: Metadata,
}

impl Node {
    /// Build a node from an id, host and `(key, value)` metadata pairs
    pub fn new<I, K, V>(id: impl Into<NodeId>, host: impl Into<String>, metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id: id.into(),
            host: host.into(),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The node `Type` annotation, when present
    pub fn node_type(&self) -> Option<&str> {
        self.metadata.get("Type").map(String::as_str)
    }
}

/// A directed parent/child link between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier
    pub id: String,
    /// Parent node
    pub parent: NodeId,
    /// Child node
    pub child: NodeId,
    /// Edge annotations
    pub metadata: Metadata,
}

/// Receives graph mutations; all methods default to no-ops so implementers
/// subscribe only to what they need
pub trait GraphEventListener: Send + Sync {
    fn on_node_added(&self, _node: &Node) {}
    fn on_node_updated(&self, _node: &Node) {}
    fn on_node_deleted(&self, _node: &Node) {}
    fn on_edge_added(&self, _edge: &Edge) {}
    fn on_edge_updated(&self, _edge: &Edge) {}
    fn on_edge_deleted(&self, _edge: &Edge) {}
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<String, Edge>,
}

/// Guard returned by [`Graph::lock`]; structural mutations from other
/// threads block until it is dropped
pub struct GraphGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

/// The topology graph
pub struct Graph {
    mutex: ReentrantMutex<()>,
    state: RwLock<GraphState>,
    listeners: Mutex<Vec<Weak<dyn GraphEventListener>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            mutex: ReentrantMutex::new(()),
            state: RwLock::new(GraphState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Take the graph-level lock for a compound operation (traversal
    /// evaluation plus probe registration, typically)
    ///
    /// Mutators re-acquire the lock reentrantly, so the holder may keep
    /// calling into the graph from the same thread.
    pub fn lock(&self) -> GraphGuard<'_> {
        GraphGuard {
            _guard: self.mutex.lock(),
        }
    }

    /// Register a mutation listener; the graph keeps a weak reference only
    pub fn add_event_listener(&self, listener: Arc<dyn GraphEventListener>) {
        self.listeners.lock().push(Arc::downgrade(&listener));
    }

    /// Insert or replace a node
    pub fn add_node(&self, node: Node) {
        let _lock = self.mutex.lock();
        self.state.write().nodes.insert(node.id.clone(), node.clone());
        self.notify(|l| l.on_node_added(&node));
    }

    /// Set one metadata key and fan the update out to listeners
    pub fn add_metadata(&self, id: &str, key: &str, value: &str) -> bool {
        let _lock = self.mutex.lock();
        let updated = self.set_metadata(id, key, value);
        if let Some(node) = updated {
            self.notify(|l| l.on_node_updated(&node));
            return true;
        }
        false
    }

    /// Set one metadata key without notifying listeners
    ///
    /// Capture-state bookkeeping (`State.FlowCapture`) goes through this path
    /// so that probe registration never re-triggers reconciliation.
    pub fn add_metadata_silent(&self, id: &str, key: &str, value: &str) -> bool {
        let _lock = self.mutex.lock();
        self.set_metadata(id, key, value).is_some()
    }

    fn set_metadata(&self, id: &str, key: &str, value: &str) -> Option<Node> {
        let mut state = self.state.write();
        let node = state.nodes.get_mut(id)?;
        node.metadata.insert(key.to_string(), value.to_string());
        Some(node.clone())
    }

    /// Remove a node and every edge touching it
    pub fn del_node(&self, id: &str) -> Option<Node> {
        let _lock = self.mutex.lock();
        let (node, dropped) = {
            let mut state = self.state.write();
            let node = state.nodes.remove(id)?;
            let (dropped, kept) = std::mem::take(&mut state.edges)
                .into_values()
                .partition::<Vec<_>, _>(|e| e.parent == id || e.child == id);
            state.edges = kept.into_iter().map(|e| (e.id.clone(), e)).collect();
            (node, dropped)
        };
        for edge in &dropped {
            self.notify(|l| l.on_edge_deleted(edge));
        }
        self.notify(|l| l.on_node_deleted(&node));
        Some(node)
    }

    /// Insert an edge between two known nodes
    pub fn add_edge(&self, edge: Edge) {
        let _lock = self.mutex.lock();
        self.state.write().edges.insert(edge.id.clone(), edge.clone());
        self.notify(|l| l.on_edge_added(&edge));
    }

    /// Snapshot of one node
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.state.read().nodes.get(id).cloned()
    }

    /// Snapshot of all nodes
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Resolve an edge to its (parent, child) node snapshots
    pub fn edge_nodes(&self, edge: &Edge) -> (Option<Node>, Option<Node>) {
        let state = self.state.read();
        (
            state.nodes.get(&edge.parent).cloned(),
            state.nodes.get(&edge.child).cloned(),
        )
    }

    /// Whether any edge touches the given node
    pub fn has_edges(&self, id: &str) -> bool {
        self.state
            .read()
            .edges
            .values()
            .any(|e| e.parent == id || e.child == id)
    }

    fn notify<F: Fn(&Arc<dyn GraphEventListener>)>(&self, f: F) {
        let listeners: Vec<_> = {
            let mut guard = self.listeners.lock();
            guard.retain(|l| l.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &listeners {
            f(listener);
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl GraphEventListener for Recorder {
        fn on_node_added(&self, node: &Node) {
            self.events.lock().push(format!("add:{}", node.id));
        }
        fn on_node_updated(&self, node: &Node) {
            self.events.lock().push(format!("update:{}", node.id));
        }
        fn on_node_deleted(&self, node: &Node) {
            self.events.lock().push(format!("del:{}", node.id));
        }
        fn on_edge_added(&self, edge: &Edge) {
            self.events.lock().push(format!("edge:{}", edge.id));
        }
    }

    fn node(id: &str, typ: &str) -> Node {
        Node::new(id, "host-1", [("Type", typ), ("Name", id)])
    }

    #[test]
    fn test_listener_dispatch() {
        let graph = Graph::new();
        let rec = Arc::new(Recorder::default());
        graph.add_event_listener(rec.clone());

        graph.add_node(node("n1", "device"));
        graph.add_metadata("n1", "Driver", "veth");
        graph.add_edge(Edge {
            id: "e1".into(),
            parent: "n1".into(),
            child: "n1".into(),
            metadata: Metadata::new(),
        });
        graph.del_node("n1");

        assert_eq!(
            rec.events.lock().clone(),
            vec!["add:n1", "update:n1", "edge:e1", "del:n1"]
        );
    }

    #[test]
    fn test_silent_metadata_skips_listeners() {
        let graph = Graph::new();
        let rec = Arc::new(Recorder::default());
        graph.add_event_listener(rec.clone());

        graph.add_node(node("n1", "device"));
        assert!(graph.add_metadata_silent("n1", "State.FlowCapture", "ON"));

        assert_eq!(rec.events.lock().clone(), vec!["add:n1"]);
        assert_eq!(
            graph.get_node("n1").unwrap().metadata.get("State.FlowCapture"),
            Some(&"ON".to_string())
        );
    }

    #[test]
    fn test_metadata_on_missing_node() {
        let graph = Graph::new();
        assert!(!graph.add_metadata("ghost", "k", "v"));
        assert!(!graph.add_metadata_silent("ghost", "k", "v"));
    }

    #[test]
    fn test_del_node_drops_edges() {
        let graph = Graph::new();
        graph.add_node(node("br0", "ovsbridge"));
        graph.add_node(node("eth0", "device"));
        graph.add_edge(Edge {
            id: "e1".into(),
            parent: "br0".into(),
            child: "eth0".into(),
            metadata: Metadata::new(),
        });
        assert!(graph.has_edges("br0"));

        graph.del_node("eth0");
        assert!(!graph.has_edges("br0"));
    }

    #[test]
    fn test_lock_blocks_concurrent_mutators() {
        let graph = Arc::new(Graph::new());
        let guard = graph.lock();

        let writer = graph.clone();
        let handle = std::thread::spawn(move || {
            writer.add_node(node("n1", "device"));
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(graph.get_node("n1").is_none());

        drop(guard);
        handle.join().unwrap();
        assert!(graph.get_node("n1").is_some());
    }

    #[test]
    fn test_lock_is_reentrant_on_same_thread() {
        let graph = Graph::new();
        graph.add_node(node("n1", "device"));

        let _guard = graph.lock();
        assert!(graph.add_metadata_silent("n1", "State.FlowCapture", "ON"));
        graph.del_node("n1");
        assert!(graph.get_node("n1").is_none());
    }

    #[test]
    fn test_edge_nodes() {
        let graph = Graph::new();
        graph.add_node(node("br0", "ovsbridge"));
        graph.add_node(node("eth0", "device"));
        let edge = Edge {
            id: "e1".into(),
            parent: "br0".into(),
            child: "eth0".into(),
            metadata: Metadata::new(),
        };
        graph.add_edge(edge.clone());

        let (parent, child) = graph.edge_nodes(&edge);
        assert_eq!(parent.unwrap().id, "br0");
        assert_eq!(child.unwrap().id, "eth0");
    }
}
