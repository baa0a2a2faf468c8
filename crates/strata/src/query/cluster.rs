//! Query clustering.
//!
//! Requests against the same `(series, start, end, step)` that arrive within
//! a short coalescing delay share one underlying read. The first request for
//! a key opens a cluster and schedules it; later requests attach as extra
//! receivers. When the delay elapses the cluster is removed from the map,
//! the union of all requested columns is read once on the blocking pool and
//! each receiver gets its own columns back.
//!
//! A receiver is cancelled by dropping (or [`QueryTicket::cancel`]ling) its
//! ticket. The other receivers of the cluster are unaffected; a cluster whose
//! receivers are all gone skips the read entirely.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, StrataError};
use crate::query::{ColumnRequest, QueryBuffer};

/// Default coalescing delay: 20 ms.
pub const DEFAULT_COALESCE_DELAY: Duration = Duration::from_millis(20);

/// Configuration for the query clusterer.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Time a new cluster waits for more receivers before executing.
    pub delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_COALESCE_DELAY,
        }
    }
}

impl ClusterConfig {
    /// Creates a new configuration with a custom coalescing delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Identity of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    /// Series name.
    pub series: String,
    /// Range start (inclusive).
    pub start: i64,
    /// Range end (inclusive).
    pub end: i64,
    /// Window length in seconds.
    pub step: i64,
}

impl ClusterKey {
    /// Creates a key.
    pub fn new(series: impl Into<String>, start: i64, end: i64, step: i64) -> Self {
        Self {
            series: series.into(),
            start,
            end,
            step,
        }
    }
}

/// Runs the underlying read of a cluster. Called on the blocking pool.
pub trait QueryExecutor: Send + Sync + 'static {
    /// Reads `columns` of the series named by `key`.
    fn execute(&self, key: &ClusterKey, columns: &[ColumnRequest]) -> Result<QueryBuffer>;
}

struct Receiver {
    columns: Vec<ColumnRequest>,
    tx: oneshot::Sender<Result<QueryBuffer>>,
}

struct Shared<E> {
    executor: Arc<E>,
    config: ClusterConfig,
    pending: Mutex<HashMap<ClusterKey, Vec<Receiver>>>,
    executions: AtomicU64,
}

impl<E> Shared<E> {
    fn pending(&self) -> MutexGuard<'_, HashMap<ClusterKey, Vec<Receiver>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coalesces concurrent identical queries.
pub struct QueryClusterer<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for QueryClusterer<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: QueryExecutor> QueryClusterer<E> {
    /// Creates a clusterer around `executor`.
    pub fn new(executor: E, config: ClusterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor: Arc::new(executor),
                config,
                pending: Mutex::new(HashMap::new()),
                executions: AtomicU64::new(0),
            }),
        }
    }

    /// Submits a request. Must be called from within a tokio runtime.
    pub fn submit(&self, key: ClusterKey, columns: Vec<ColumnRequest>) -> QueryTicket {
        let (tx, rx) = oneshot::channel();
        let receiver = Receiver { columns, tx };
        let mut pending = self.shared.pending();
        match pending.get_mut(&key) {
            Some(receivers) => receivers.push(receiver),
            None => {
                debug!(
                    series = %key.series,
                    start = key.start,
                    end = key.end,
                    step = key.step,
                    "new query cluster"
                );
                pending.insert(key.clone(), vec![receiver]);
                tokio::spawn(run_cluster(Arc::clone(&self.shared), key));
            }
        }
        QueryTicket { rx }
    }

    /// Number of underlying reads performed so far.
    pub fn executions(&self) -> u64 {
        self.shared.executions.load(Ordering::Relaxed)
    }

    /// Number of clusters waiting for their delay to elapse.
    pub fn pending_clusters(&self) -> usize {
        self.shared.pending().len()
    }
}

async fn run_cluster<E: QueryExecutor>(shared: Arc<Shared<E>>, key: ClusterKey) {
    tokio::time::sleep(shared.config.delay).await;

    let receivers: Vec<Receiver> = shared
        .pending()
        .remove(&key)
        .unwrap_or_default()
        .into_iter()
        .filter(|r| !r.tx.is_closed())
        .collect();
    if receivers.is_empty() {
        debug!(series = %key.series, "query cluster cancelled by all receivers");
        return;
    }

    let mut union: Vec<ColumnRequest> = Vec::new();
    for request in receivers.iter().flat_map(|r| r.columns.iter()) {
        if !union.contains(request) {
            union.push(*request);
        }
    }
    shared.executions.fetch_add(1, Ordering::Relaxed);
    debug!(
        series = %key.series,
        receivers = receivers.len(),
        columns = union.len(),
        "executing query cluster"
    );

    let executor = Arc::clone(&shared.executor);
    let task_key = key.clone();
    let task_columns = union.clone();
    let result = tokio::task::spawn_blocking(move || executor.execute(&task_key, &task_columns))
        .await
        .unwrap_or_else(|e| Err(StrataError::ClusterFailed(e.to_string())));

    for receiver in receivers {
        let reply = match &result {
            Ok(buffer) => {
                let indices: Vec<usize> = receiver
                    .columns
                    .iter()
                    .filter_map(|c| union.iter().position(|u| u == c))
                    .collect();
                Ok(buffer.select(&indices))
            }
            Err(e) => Err(e.duplicate()),
        };
        // A closed channel means the receiver cancelled meanwhile.
        let _ = receiver.tx.send(reply);
    }
}

/// Pending result of a submitted query.
///
/// Resolves to the receiver's own columns. Dropping the ticket cancels only
/// this receiver.
#[derive(Debug)]
pub struct QueryTicket {
    rx: oneshot::Receiver<Result<QueryBuffer>>,
}

impl QueryTicket {
    /// Detaches this receiver from its cluster.
    pub fn cancel(mut self) {
        self.rx.close();
    }
}

impl Future for QueryTicket {
    type Output = Result<QueryBuffer>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StrataError::QueryCancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
