//! Flow table allocator
//!
//! Single owner of flow-table lifetimes. Every probe registration gets a
//! freshly started table wired to the agent-wide update/expire cadence and
//! to the downstream event sink; releasing a table stops its worker and
//! drops it from the set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::flow::Flow;
use crate::table::{FlowHandler, FlowTable, TablePipeline};

/// Downstream consumer of flow update and expiration batches
pub trait FlowEventSink: Send + Sync {
    fn on_flows_updated(&self, flows: &[Flow]);
    fn on_flows_expired(&self, flows: &[Flow]);
}

/// Sink that only traces batches; the default when no forwarder is wired
pub struct LogEventSink;

impl FlowEventSink for LogEventSink {
    fn on_flows_updated(&self, flows: &[Flow]) {
        if !flows.is_empty() {
            tracing::debug!(count = flows.len(), "flows updated");
        }
    }

    fn on_flows_expired(&self, flows: &[Flow]) {
        if !flows.is_empty() {
            tracing::debug!(count = flows.len(), "flows expired");
        }
    }
}

/// Allocates and releases flow tables
pub struct TableAllocator {
    update_every: Duration,
    update_window: Duration,
    expire_every: Duration,
    expire_window: Duration,
    sink: Arc<dyn FlowEventSink>,
    tables: Mutex<Vec<Arc<FlowTable>>>,
}

impl TableAllocator {
    pub fn new(
        update_every: Duration,
        update_window: Duration,
        expire_every: Duration,
        expire_window: Duration,
        sink: Arc<dyn FlowEventSink>,
    ) -> Self {
        Self {
            update_every,
            update_window,
            expire_every,
            expire_window,
            sink,
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Build and start a table whose idle task is `pipeline`
    pub fn alloc(&self, pipeline: TablePipeline) -> Arc<FlowTable> {
        let update_sink = self.sink.clone();
        let expire_sink = self.sink.clone();
        let table = Arc::new(FlowTable::new(
            FlowHandler::new(
                Arc::new(move |flows: &[Flow]| update_sink.on_flows_updated(flows)),
                self.update_every,
                self.update_window,
            ),
            FlowHandler::new(
                Arc::new(move |flows: &[Flow]| expire_sink.on_flows_expired(flows)),
                self.expire_every,
                self.expire_window,
            ),
        ));
        table.register_default(pipeline);
        table.start();
        self.tables.lock().push(table.clone());
        table
    }

    /// Stop a table and forget it
    pub fn release(&self, table: &Arc<FlowTable>) {
        self.tables.lock().retain(|t| !Arc::ptr_eq(t, table));
        table.stop();
    }

    /// Stop every table still allocated
    pub fn release_all(&self) {
        let tables: Vec<_> = std::mem::take(&mut *self.tables.lock());
        for table in tables {
            table.stop();
        }
    }

    /// Number of tables currently allocated
    pub fn active(&self) -> usize {
        self.tables.lock().len()
    }
}

impl Drop for TableAllocator {
    fn drop(&mut self) {
        self.release_all();
    }
}
