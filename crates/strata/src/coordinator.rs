//! Coordinator: the single task that owns the database.
//!
//! Inserts, flushes and query planning arrive as commands on a bounded
//! queue and run one at a time against the [`Database`]. A periodic tick
//! downsamples and flushes. Planned queries hold snapshots, so the actual
//! reads run on the blocking pool through [`QueryService`] without holding
//! up the loop.

use std::io::Write;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::database::{Database, QueryRequest, ResolvedQuery};
use crate::error::{Result, StrataError};
use crate::query::{
    ClusterConfig, ClusterKey, ColumnRequest, Query, QueryBuffer, QueryClusterer, QueryExecutor,
};
use crate::response::{self, Manifest};
use crate::series::IncomingPoint;

/// Default insert queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default interval between maintenance ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime configuration of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of the command queue.
    pub queue_capacity: usize,
    /// Interval between downsample and flush ticks.
    pub tick_interval: Duration,
    /// Query clustering settings.
    pub cluster: ClusterConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick_interval: DEFAULT_TICK_INTERVAL,
            cluster: ClusterConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the query clustering settings.
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }
}

enum Command {
    Insert {
        point: IncomingPoint,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Resolve {
        request: QueryRequest,
        reply: oneshot::Sender<Result<ResolvedQuery>>,
    },
    Plan {
        key: ClusterKey,
        columns: Vec<ColumnRequest>,
        reply: oneshot::Sender<Result<Query>>,
    },
    Flush {
        force: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Entry point for running a database behind a command queue.
pub struct Coordinator;

impl Coordinator {
    /// Spawns the coordinator loop on the current tokio runtime.
    ///
    /// The loop first replays any downsampling backlog, then serves
    /// commands until [`CoordinatorHandle::shutdown`] is called or every
    /// handle is dropped. Either way the database is flushed and returned
    /// through the join handle.
    pub fn spawn(
        db: Database,
        config: CoordinatorConfig,
    ) -> (CoordinatorHandle, JoinHandle<Result<Database>>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let task = tokio::spawn(run(db, rx, config.tick_interval));
        (CoordinatorHandle { tx }, task)
    }
}

async fn run(
    mut db: Database,
    mut rx: mpsc::Receiver<Command>,
    tick_interval: Duration,
) -> Result<Database> {
    let rows = db.startup()?;
    info!(root = %db.root().display(), rows, "coordinator started");

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    let result = db.close();
                    let _ = reply.send(result.as_ref().copied().map_err(StrataError::duplicate));
                    info!("coordinator shut down");
                    return result.map(|_| db);
                }
                Some(command) => handle(&mut db, command),
                None => break,
            },
            _ = ticker.tick() => db.tick(),
        }
    }
    info!("all coordinator handles dropped, closing database");
    db.close()?;
    Ok(db)
}

fn handle(db: &mut Database, command: Command) {
    match command {
        Command::Insert { point, reply } => {
            let result = db.insert(&point);
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(time = point.time, error = %e, "dropped insert");
                    }
                }
            }
        }
        Command::Resolve { request, reply } => {
            let _ = reply.send(db.resolve(&request));
        }
        Command::Plan {
            key,
            columns,
            reply,
        } => {
            let _ = reply.send(db.query(&key, &columns));
        }
        Command::Flush { force, reply } => {
            let result = db.flush(force);
            if let Ok(points) = &result {
                debug!(force, points, "flush command");
            }
            let _ = reply.send(result);
        }
        Command::Shutdown { .. } => {}
    }
}

/// Cloneable sender side of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Insert { .. } => "Insert",
            Self::Resolve { .. } => "Resolve",
            Self::Plan { .. } => "Plan",
            Self::Flush { .. } => "Flush",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

async fn reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.map_err(|_| StrataError::CoordinatorClosed)?
}

impl CoordinatorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StrataError::CoordinatorClosed)
    }

    /// Queues a point without waiting for it to be stored, waiting for room
    /// when the queue is full. Rejections are logged by the coordinator.
    pub async fn submit(&self, point: IncomingPoint) -> Result<()> {
        self.send(Command::Insert { point, reply: None }).await
    }

    /// Queues a point unless the queue is full. Returns false when the point
    /// was dropped.
    pub fn try_submit(&self, point: IncomingPoint) -> Result<bool> {
        match self.tx.try_send(Command::Insert { point, reply: None }) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("insert queue full, dropping point");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StrataError::CoordinatorClosed),
        }
    }

    /// Stores a point and waits for the outcome.
    pub async fn insert(&self, point: IncomingPoint) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Insert {
            point,
            reply: Some(tx),
        })
        .await?;
        reply(rx).await
    }

    /// Resolves a query request against the current series.
    pub async fn resolve(&self, request: QueryRequest) -> Result<ResolvedQuery> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Resolve {
            request,
            reply: tx,
        })
        .await?;
        reply(rx).await
    }

    /// Plans a query; the returned [`Query`] reads from snapshots.
    pub async fn plan(&self, key: ClusterKey, columns: Vec<ColumnRequest>) -> Result<Query> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Plan {
            key,
            columns,
            reply: tx,
        })
        .await?;
        reply(rx).await
    }

    /// Blocking variant of [`plan`](Self::plan) for use outside the runtime,
    /// e.g. on the blocking pool.
    pub fn plan_blocking(&self, key: ClusterKey, columns: Vec<ColumnRequest>) -> Result<Query> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .blocking_send(Command::Plan {
                key,
                columns,
                reply: tx,
            })
            .map_err(|_| StrataError::CoordinatorClosed)?;
        rx.blocking_recv()
            .map_err(|_| StrataError::CoordinatorClosed)?
    }

    /// Flushes every series, returning the number of points written.
    pub async fn flush(&self, force: bool) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { force, reply: tx }).await?;
        reply(rx).await
    }

    /// Stops the coordinator after flushing.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply: tx }).await?;
        reply(rx).await
    }
}

impl QueryExecutor for CoordinatorHandle {
    fn execute(&self, key: &ClusterKey, columns: &[ColumnRequest]) -> Result<QueryBuffer> {
        self.plan_blocking(key.clone(), columns.to_vec())?
            .collect_all()
    }
}

/// Serves query requests through the clusterer.
#[derive(Clone)]
pub struct QueryService {
    handle: CoordinatorHandle,
    clusterer: QueryClusterer<CoordinatorHandle>,
}

impl QueryService {
    /// Creates a service reading through `handle`.
    pub fn new(handle: CoordinatorHandle, config: ClusterConfig) -> Self {
        Self {
            clusterer: QueryClusterer::new(handle.clone(), config),
            handle,
        }
    }

    /// The underlying clusterer.
    pub fn clusterer(&self) -> &QueryClusterer<CoordinatorHandle> {
        &self.clusterer
    }

    /// Resolves `request` and reads every matched series.
    ///
    /// All series are submitted before any is awaited so concurrent
    /// identical requests land in the same clusters.
    pub async fn run(&self, request: QueryRequest) -> Result<(Manifest, Vec<(usize, QueryBuffer)>)> {
        let resolved = self.handle.resolve(request).await?;
        let tickets: Vec<_> = resolved
            .plans
            .into_iter()
            .map(|plan| {
                (
                    plan.manifest_index,
                    self.clusterer.submit(plan.key, plan.columns),
                )
            })
            .collect();
        let mut chunks = Vec::with_capacity(tickets.len());
        for (index, ticket) in tickets {
            chunks.push((index, ticket.await?));
        }
        Ok((resolved.manifest, chunks))
    }

    /// Runs `request` and writes the encoded response to `writer`.
    pub async fn respond<W: Write>(&self, request: QueryRequest, writer: &mut W) -> Result<()> {
        let (manifest, chunks) = self.run(request).await?;
        response::write_response(writer, &manifest, chunks.into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SeriesSchema, Tags};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn database(dir: &TempDir) -> Database {
        let mut db = Database::open(dir.path()).unwrap();
        let schema = SeriesSchema::new(
            tags(&[("host", "web1")]),
            vec![1, 10],
            vec![ColumnSchema::new(tags(&[("name", "cpu")]))],
        )
        .with_points_per_file(100)
        .with_flush_points(16);
        db.create_series("web1", schema).unwrap();
        db
    }

    fn point(time: i64, value: f64) -> IncomingPoint {
        IncomingPoint::new(time, tags(&[("host", "web1")]))
            .with_field(tags(&[("name", "cpu")]), value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_insert_and_query() {
        let dir = TempDir::new().unwrap();
        let (handle, task) = Coordinator::spawn(database(&dir), CoordinatorConfig::default());
        for t in 0..100 {
            handle.insert(point(t, t as f64)).await.unwrap();
        }
        let rejected = handle
            .insert(IncomingPoint::new(5, tags(&[("host", "db")])))
            .await;
        assert!(matches!(rejected, Err(StrataError::NoMatchingSeries)));
        handle.flush(true).await.unwrap();

        let service = QueryService::new(handle.clone(), ClusterConfig::default());
        let request = QueryRequest::new(0, 99)
            .with_column(Tags::new(), "max")
            .with_step(10);
        let (manifest, chunks) = service.run(request.clone()).await.unwrap();
        assert_eq!(manifest.series.len(), 1);
        assert_eq!(chunks.len(), 1);
        let buffer = &chunks[0].1;
        assert_eq!(buffer.times, (0..10).map(|i| i * 10).collect::<Vec<_>>());
        assert_eq!(buffer.values[0][3], 39.0);

        let mut out = Vec::new();
        service.respond(request, &mut out).await.unwrap();
        let mut reader = Cursor::new(out);
        assert_eq!(response::read_manifest(&mut reader).unwrap(), manifest);
        let (_, read) = response::read_chunk(&mut reader).unwrap().unwrap();
        assert_eq!(&read, buffer);

        handle.shutdown().await.unwrap();
        let db = task.await.unwrap().unwrap();
        assert_eq!(db.series()[0].buckets()[0].last_time_on_disk(), Some(99));
        assert!(matches!(
            handle.flush(false).await,
            Err(StrataError::CoordinatorClosed)
        ));
    }

    #[tokio::test]
    async fn test_try_submit_drops_when_full() {
        let dir = TempDir::new().unwrap();
        let config = CoordinatorConfig::default().with_queue_capacity(1);
        let (handle, task) = Coordinator::spawn(database(&dir), config);
        // The loop has not been polled yet on this single-threaded runtime.
        assert!(handle.try_submit(point(0, 1.0)).unwrap());
        assert!(!handle.try_submit(point(1, 1.0)).unwrap());
        handle.shutdown().await.unwrap();
        let db = task.await.unwrap().unwrap();
        assert_eq!(db.series()[0].buckets()[0].last_time_on_disk(), Some(0));
    }

    #[tokio::test]
    async fn test_dropping_handles_closes_database() {
        let dir = TempDir::new().unwrap();
        let (handle, task) = Coordinator::spawn(database(&dir), CoordinatorConfig::default());
        handle.submit(point(3, 2.0)).await.unwrap();
        drop(handle);
        let db = task.await.unwrap().unwrap();
        assert_eq!(db.series()[0].buckets()[0].last_time_on_disk(), Some(3));
    }
}
