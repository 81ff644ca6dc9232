//! Flow Table
//!
//! Keyed in-memory store of flow records, one per active probe. A dedicated
//! worker thread owns all bookkeeping: periodic update callbacks, expiration
//! passes, flush requests and synchronous search queries are serialized on
//! it, while the ingest path and readers coordinate through the table's
//! reader-writer lock.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{Flow, LayerType};

/// Broadcast L2 address, never a flow endpoint worth selecting
const BROADCAST_MAC: &str = "ff:ff:ff:ff:ff:ff";

/// How long the worker yields when idle and no pipeline pump is registered
const IDLE_YIELD: Duration = Duration::from_millis(20);

/// A flow entry shared between the table and the ingest path
pub type SharedFlow = Arc<RwLock<Flow>>;

/// Batch callback invoked by the update and expire ticks
///
/// Runs inline on the table worker; it must not re-enter the table.
pub type FlowCallback = Arc<dyn Fn(&[Flow]) + Send + Sync>;

/// Pump installed as the worker's idle task, draining probe buffers
pub type TablePipeline = Arc<dyn Fn() + Send + Sync>;

/// Tick configuration: a callback fired every `every`, scanning flows
/// against a `now - window` horizon
pub struct FlowHandler {
    callback: FlowCallback,
    every: Duration,
    window: Duration,
}

impl FlowHandler {
    pub fn new(callback: FlowCallback, every: Duration, window: Duration) -> Self {
        Self {
            callback,
            every,
            window,
        }
    }
}

/// Table lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TableState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

/// A synchronous request to the table worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableQuery {
    /// Query discriminator; `flow-search` is the only kind served today
    pub kind: String,
    /// Kind-specific payload
    pub obj: Value,
}

impl TableQuery {
    /// Build a flow-search query
    pub fn flow_search(query: &FlowSearchQuery) -> Self {
        Self {
            kind: "flow-search".into(),
            obj: serde_json::to_value(query).unwrap_or(Value::Null),
        }
    }
}

/// Worker reply to a [`TableQuery`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReply {
    /// HTTP-style status: 200 hit, 404 no match, 500 malformed payload
    pub status: u16,
    /// Kind-specific payload
    pub obj: Value,
}

/// Flow-search payload: match flows observed on any of these nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSearchQuery {
    pub node_uuids: Vec<String>,
}

/// Flow-search result, sorted by `last` descending
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSearchReply {
    pub flows: Vec<Flow>,
}

/// Snapshot filter: keep flows whose probe or interface nodes intersect
/// the given set
#[derive(Debug, Clone, Default)]
pub struct FlowQueryFilter {
    pub node_uuids: Vec<String>,
}

impl FlowQueryFilter {
    fn matches(&self, flow: &Flow) -> bool {
        self.node_uuids.iter().any(|u| flow.matches_node(u))
    }
}

/// The flow table
pub struct FlowTable {
    flows: RwLock<HashMap<String, SharedFlow>>,
    default_func: RwLock<Option<TablePipeline>>,
    update_handler: FlowHandler,
    expire_handler: FlowHandler,

    state: AtomicI64,
    state_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,

    flush_tx: Sender<()>,
    flush_rx: Receiver<()>,
    flush_done_tx: Sender<()>,
    flush_done_rx: Receiver<()>,
    query_tx: Sender<TableQuery>,
    query_rx: Receiver<TableQuery>,
    reply_tx: Sender<TableReply>,
    reply_rx: Receiver<TableReply>,
}

impl FlowTable {
    pub fn new(update_handler: FlowHandler, expire_handler: FlowHandler) -> Self {
        let (flush_tx, flush_rx) = bounded(0);
        let (flush_done_tx, flush_done_rx) = bounded(0);
        let (query_tx, query_rx) = bounded(0);
        let (reply_tx, reply_rx) = bounded(0);
        Self {
            flows: RwLock::new(HashMap::new()),
            default_func: RwLock::new(None),
            update_handler,
            expire_handler,
            state: AtomicI64::new(TableState::Stopped as i64),
            state_lock: Mutex::new(()),
            worker: Mutex::new(None),
            flush_tx,
            flush_rx,
            flush_done_tx,
            flush_done_rx,
            query_tx,
            query_rx,
            reply_tx,
            reply_rx,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TableState {
        match self.state.load(Ordering::SeqCst) {
            1 => TableState::Running,
            2 => TableState::Stopping,
            _ => TableState::Stopped,
        }
    }

    /// Number of flows currently held
    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a batch: insert unknown UUIDs, replace the statistics block of
    /// known ones. Atomic with respect to readers.
    pub fn update(&self, flows: Vec<Flow>) {
        let mut table = self.flows.write();
        for flow in flows {
            match table.entry(flow.uuid.clone()) {
                Entry::Occupied(entry) => {
                    entry.get().write().statistics = flow.statistics;
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(RwLock::new(flow)));
                }
            }
        }
    }

    /// Point lookup
    pub fn get_flow(&self, uuid: &str) -> Option<SharedFlow> {
        self.flows.read().get(uuid).cloned()
    }

    /// Upsert: returns the entry and whether it was just created
    pub fn get_or_create_flow(&self, uuid: &str) -> (SharedFlow, bool) {
        let mut table = self.flows.write();
        match table.entry(uuid.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flow = Arc::new(RwLock::new(Flow::new(uuid)));
                entry.insert(flow.clone());
                (flow, true)
            }
        }
    }

    /// Snapshot copy, optionally restricted by a node filter
    pub fn get_flows(&self, filter: Option<&FlowQueryFilter>) -> Vec<Flow> {
        let table = self.flows.read();
        table
            .values()
            .map(|f| f.read().clone())
            .filter(|f| filter.map_or(true, |q| q.matches(f)))
            .collect()
    }

    /// Flows whose `last` falls within `now - window`
    pub fn filter_last(&self, window: Duration) -> Vec<Flow> {
        self.filter_last_at(Utc::now().timestamp(), window)
    }

    /// As [`filter_last`](Self::filter_last) against an explicit wall time
    pub fn filter_last_at(&self, now: i64, window: Duration) -> Vec<Flow> {
        let horizon = now - window.as_secs() as i64;
        let table = self.flows.read();
        table
            .values()
            .map(|f| f.read().clone())
            .filter(|f| f.statistics.last >= horizon)
            .collect()
    }

    /// Flows whose endpoint value at `layer` appears in `addresses`
    ///
    /// Flows touching the broadcast address are excluded; results are
    /// deduplicated, preserving first-seen order over `addresses`.
    pub fn select_layer(&self, layer: LayerType, addresses: &[String]) -> Vec<Flow> {
        let mut by_value: HashMap<String, Vec<Flow>> = HashMap::new();
        {
            let table = self.flows.read();
            for shared in table.values() {
                let flow = shared.read();
                let pair = match flow.layer(layer) {
                    Some(p) => p,
                    None => continue,
                };
                if pair.ab.value == BROADCAST_MAC || pair.ba.value == BROADCAST_MAC {
                    continue;
                }
                by_value
                    .entry(pair.ab.value.clone())
                    .or_default()
                    .push(flow.clone());
                by_value
                    .entry(pair.ba.value.clone())
                    .or_default()
                    .push(flow.clone());
            }
        }

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for address in addresses {
            if let Some(flows) = by_value.get(address) {
                for flow in flows {
                    if seen.insert(flow.uuid.clone()) {
                        selected.push(flow.clone());
                    }
                }
            }
        }
        selected
    }

    /// Install the worker's idle task (the probe pipeline pump)
    pub fn register_default(&self, pipeline: TablePipeline) {
        *self.default_func.write() = Some(pipeline);
    }

    /// Update tick: report flows seen since `now - update window`
    pub fn updated(&self, now: i64) {
        let horizon = now - self.update_handler.window.as_secs() as i64;
        let table = self.flows.read();
        let updated: Vec<Flow> = table
            .values()
            .map(|f| f.read().clone())
            .filter(|f| f.statistics.last > horizon)
            .collect();
        (self.update_handler.callback)(&updated);
        tracing::debug!(count = updated.len(), "reported updated flows");
    }

    /// Expire tick: report and delete flows idle since `now - expire window`
    pub fn expire(&self, now: i64) {
        let horizon = now - self.expire_handler.window.as_secs() as i64;
        self.expired_pass(horizon);
    }

    fn expire_now(&self) {
        self.expired_pass(i64::MAX);
    }

    fn expired_pass(&self, horizon: i64) {
        let mut table = self.flows.write();
        let expired: Vec<Flow> = table
            .values()
            .map(|f| f.read().clone())
            .filter(|f| f.statistics.last < horizon)
            .collect();
        (self.expire_handler.callback)(&expired);
        for flow in &expired {
            table.remove(&flow.uuid);
        }
        tracing::debug!(
            expired = expired.len(),
            remaining = table.len(),
            "expired flows"
        );
    }

    /// Force a full expiration pass and block until it completes
    pub fn flush(&self) {
        if self.flush_tx.send(()).is_ok() {
            let _ = self.flush_done_rx.recv();
        }
    }

    /// Submit a synchronous query; `None` unless the table is running
    pub fn query(&self, query: TableQuery) -> Option<TableReply> {
        let _guard = self.state_lock.lock();
        if self.state() != TableState::Running {
            return None;
        }
        self.query_tx.send(query).ok()?;
        self.reply_rx.recv().ok()
    }

    fn on_query(&self, query: TableQuery) -> TableReply {
        match query.kind.as_str() {
            "flow-search" => self.on_flow_search(query.obj),
            _ => TableReply {
                status: 500,
                obj: Value::Null,
            },
        }
    }

    fn on_flow_search(&self, obj: Value) -> TableReply {
        let search: FlowSearchQuery = match serde_json::from_value(obj) {
            Ok(q) => q,
            Err(err) => {
                tracing::warn!(%err, "unable to decode flow search payload");
                return TableReply {
                    status: 500,
                    obj: Value::Null,
                };
            }
        };

        let mut flows = self.get_flows(Some(&FlowQueryFilter {
            node_uuids: search.node_uuids,
        }));
        let status = if flows.is_empty() { 404 } else { 200 };
        flows.sort_by(|a, b| b.statistics.last.cmp(&a.statistics.last));

        TableReply {
            status,
            obj: serde_json::to_value(FlowSearchReply { flows }).unwrap_or(Value::Null),
        }
    }

    /// Spawn the worker thread; no-op unless the table is stopped
    pub fn start(self: &Arc<Self>) {
        let _guard = self.state_lock.lock();
        if self.state() != TableState::Stopped {
            return;
        }
        self.state
            .store(TableState::Running as i64, Ordering::SeqCst);
        let table = Arc::clone(self);
        *self.worker.lock() = Some(thread::spawn(move || table.run()));
    }

    fn run(&self) {
        let update_tick = tick(self.update_handler.every);
        let expire_tick = tick(self.expire_handler.every);

        while self.state() == TableState::Running {
            select! {
                recv(expire_tick) -> _ => self.expire(Utc::now().timestamp()),
                recv(update_tick) -> _ => self.updated(Utc::now().timestamp()),
                recv(self.flush_rx) -> msg => {
                    if msg.is_ok() {
                        self.expire_now();
                        let _ = self.flush_done_tx.send(());
                    }
                }
                recv(self.query_rx) -> query => {
                    if let Ok(query) = query {
                        let _ = self.reply_tx.send(self.on_query(query));
                    }
                }
                default => {
                    let pump = self.default_func.read().clone();
                    match pump {
                        Some(pump) => pump(),
                        None => thread::sleep(IDLE_YIELD),
                    }
                }
            }
        }
    }

    /// Stop the worker, then run a final full expiration
    pub fn stop(&self) {
        {
            let _guard = self.state_lock.lock();
            let swapped = self
                .state
                .compare_exchange(
                    TableState::Running as i64,
                    TableState::Stopping as i64,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            if swapped {
                if let Some(handle) = self.worker.lock().take() {
                    let _ = handle.join();
                }
            }
            self.state
                .store(TableState::Stopped as i64, Ordering::SeqCst);
        }
        self.expire_now();
    }
}
