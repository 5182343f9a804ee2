use crate::config::ConsumerConfig;
use crate::connection::{backoff_delay, is_connection_error, ConnectionInfo, ConnectionState};
use chrono::{DateTime, Utc};
use meshtrace_types::{EventProcessor, TraceEvent};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const READ_ERROR_COOLDOWN: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by the consumer lifecycle.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("trace consumer is already running")]
    AlreadyRunning,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Introspection snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub enabled: bool,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub stream_name: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub stream_length: Option<u64>,
    pub group_pending: Option<u64>,
    pub last_delivered_id: Option<String>,
}

struct Inner {
    config: ConsumerConfig,
    processor: Arc<dyn EventProcessor>,
    running: AtomicBool,
    consuming: AtomicBool,
    connection: RwLock<ConnectionInfo>,
    client: RwLock<Option<MultiplexedConnection>>,
    consume_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Consumer-group reader for the trace stream.
///
/// Construction never touches the network; a background connection manager
/// owns the link to the bus and keeps retrying while the registry runs.
pub struct StreamConsumer {
    inner: Arc<Inner>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    manager_handle: Option<JoinHandle<()>>,
}

impl StreamConsumer {
    /// Build a consumer. Never blocks and never fails on bus unavailability;
    /// a disabled config yields an inert instance.
    pub fn new(config: ConsumerConfig, processor: Arc<dyn EventProcessor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                processor,
                running: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                connection: RwLock::new(ConnectionInfo::new()),
                client: RwLock::new(None),
                consume_handle: Mutex::new(None),
            }),
            shutdown_tx: None,
            manager_handle: None,
        }
    }

    /// Spawn the background connection manager. A second call while running
    /// is an error and alters no state.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        if !self.inner.config.enabled {
            debug!("trace consumer disabled, not starting");
            return Ok(());
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }

        info!(
            stream = %self.inner.config.stream_name,
            group = %self.inner.config.consumer_group,
            consumer = %self.inner.config.consumer_name,
            "starting trace consumer"
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        self.manager_handle = Some(tokio::spawn(async move {
            run_connection_manager(inner, shutdown_rx).await;
        }));

        Ok(())
    }

    /// Cancel background loops, await them, close the client, transition to
    /// `disconnected`. Idempotent.
    pub async fn stop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("stopping trace consumer");
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
        if let Some(handle) = self.manager_handle.take() {
            if timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("connection manager did not stop in time");
            }
        }

        self.inner.consuming.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.consume_handle.lock().await.take() {
            if timeout(self.inner.config.block_timeout + Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("consume loop did not stop in time");
            }
        }

        *self.inner.client.write().await = None;
        self.inner.connection.write().await.state = ConnectionState::Disconnected;
        info!("trace consumer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Introspection snapshot; stream-level counters are best-effort and
    /// absent while disconnected.
    pub async fn info(&self) -> ConsumerInfo {
        let connection = self.inner.connection.read().await.clone();
        let config = &self.inner.config;

        let mut stream_length = None;
        let mut group_pending = None;
        let mut last_delivered_id = None;

        if let Some(mut conn) = self.inner.client.read().await.clone() {
            let len: redis::RedisResult<u64> = conn.xlen(&config.stream_name).await;
            if let Ok(len) = len {
                stream_length = Some(len);
            }
            let groups: redis::RedisResult<redis::streams::StreamInfoGroupsReply> =
                conn.xinfo_groups(&config.stream_name).await;
            if let Ok(reply) = groups {
                if let Some(group) = reply
                    .groups
                    .into_iter()
                    .find(|g| g.name == config.consumer_group)
                {
                    group_pending = Some(group.pending as u64);
                    last_delivered_id = Some(group.last_delivered_id);
                }
            }
        }

        ConsumerInfo {
            enabled: config.enabled,
            state: connection.state,
            retry_count: connection.retry_count,
            last_error: connection.last_error,
            last_error_time: connection.last_error_time,
            stream_name: config.stream_name.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            stream_length,
            group_pending,
            last_delivered_id,
        }
    }
}

async fn run_connection_manager(inner: Arc<Inner>, mut shutdown_rx: mpsc::Receiver<()>) {
    info!("connection manager started");

    while inner.running.load(Ordering::SeqCst) {
        let state = inner.connection.read().await.state;
        match state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                inner.connection.write().await.state = ConnectionState::Connecting;
                match attempt_connect(&inner).await {
                    Ok(conn) => {
                        *inner.client.write().await = Some(conn);
                        inner.connection.write().await.record_connected();
                        info!(url = %inner.config.event_bus_url, "connected to event bus");
                    }
                    Err(error) => {
                        let retry_count = {
                            let mut connection = inner.connection.write().await;
                            connection.record_failure(&error);
                            connection.retry_count
                        };
                        let delay = backoff_delay(retry_count);
                        warn!(
                            retry_count,
                            delay_secs = delay.as_secs(),
                            error = %error,
                            "event bus connection failed, backing off"
                        );
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                }
            }
            ConnectionState::Connected => {
                if !inner.consuming.swap(true, Ordering::SeqCst) {
                    let consume_inner = Arc::clone(&inner);
                    let handle = tokio::spawn(async move {
                        run_consume_loop(consume_inner).await;
                    });
                    *inner.consume_handle.lock().await = Some(handle);
                }

                tokio::select! {
                    _ = sleep(HEALTH_CHECK_INTERVAL) => {}
                    _ = shutdown_rx.recv() => break,
                }

                if inner.running.load(Ordering::SeqCst) && !health_check(&inner).await {
                    warn!("event bus health check failed, reconnecting");
                    teardown(&inner).await;
                }
            }
            ConnectionState::Connecting => {
                // Transient; the connect attempt above owns this state.
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    info!("connection manager stopped");
}

/// Open a connection, PING it, and make sure the consumer group exists.
async fn attempt_connect(inner: &Inner) -> Result<MultiplexedConnection, ConsumerError> {
    let client = redis::Client::open(inner.config.event_bus_url.as_str())?;
    let mut conn = timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| {
            redis::RedisError::from((redis::ErrorKind::IoError, "connection attempt timed out"))
        })??;

    let ping: Result<redis::RedisResult<String>, _> =
        timeout(CONNECT_TIMEOUT, redis::cmd("PING").query_async(&mut conn)).await;
    ping.map_err(|_| redis::RedisError::from((redis::ErrorKind::IoError, "ping timed out")))??;

    ensure_group(inner, &mut conn).await?;
    Ok(conn)
}

/// Create the consumer group with MKSTREAM from id 0; the well-known
/// "group exists" reply is swallowed.
async fn ensure_group(inner: &Inner, conn: &mut MultiplexedConnection) -> Result<(), ConsumerError> {
    let result: redis::RedisResult<String> = conn
        .xgroup_create_mkstream(&inner.config.stream_name, &inner.config.consumer_group, "0")
        .await;
    match result {
        Ok(_) => {
            info!(
                stream = %inner.config.stream_name,
                group = %inner.config.consumer_group,
                "created consumer group"
            );
            Ok(())
        }
        Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
        Err(error) => Err(error.into()),
    }
}

async fn health_check(inner: &Inner) -> bool {
    let Some(mut conn) = inner.client.read().await.clone() else {
        return false;
    };
    let ping: Result<redis::RedisResult<String>, _> =
        timeout(HEALTH_CHECK_TIMEOUT, redis::cmd("PING").query_async(&mut conn)).await;
    matches!(ping, Ok(Ok(_)))
}

/// Drop the client and return to `disconnected`; the consume loop observes
/// the cleared flag and exits on its own.
async fn teardown(inner: &Inner) {
    inner.consuming.store(false, Ordering::SeqCst);
    *inner.client.write().await = None;
    inner.connection.write().await.state = ConnectionState::Disconnected;
}

async fn run_consume_loop(inner: Arc<Inner>) {
    info!(consumer = %inner.config.consumer_name, "consumption loop started");

    // First pass after (re)connect drains this consumer's pending entries
    // before switching to blocking reads for new ones.
    let mut drained_pending = false;

    while inner.running.load(Ordering::SeqCst) && inner.consuming.load(Ordering::SeqCst) {
        let Some(mut conn) = inner.client.read().await.clone() else {
            break;
        };

        let mut options = StreamReadOptions::default()
            .group(&inner.config.consumer_group, &inner.config.consumer_name)
            .count(inner.config.batch_size);
        let read_id = if drained_pending {
            options = options.block(inner.config.block_timeout.as_millis() as usize);
            ">"
        } else {
            "0"
        };

        let result: redis::RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[&inner.config.stream_name], &[read_id], &options)
            .await;

        match result {
            Ok(reply) => {
                let entries: Vec<StreamId> = reply
                    .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
                    .unwrap_or_default();
                if entries.is_empty() {
                    drained_pending = true;
                    continue;
                }
                for entry in entries {
                    handle_entry(&inner, &mut conn, entry).await;
                }
            }
            Err(error) if is_connection_error(&error) => {
                warn!(error = %error, "read failed with connection-class error");
                teardown(&inner).await;
                break;
            }
            Err(error) => {
                error!(error = %error, "read failed, cooling down");
                sleep(READ_ERROR_COOLDOWN).await;
            }
        }
    }

    inner.consuming.store(false, Ordering::SeqCst);
    info!("consumption loop stopped");
}

/// Decode, process, acknowledge.
///
/// Decode failures leave the entry unacked so the bus redelivers it;
/// processor failures are acked so a single poison event cannot wedge the
/// stream. Ack failures are logged only, since re-reads dedup by entry id.
async fn handle_entry(inner: &Inner, conn: &mut MultiplexedConnection, entry: StreamId) {
    let fields = stringify_fields(&entry);
    match TraceEvent::decode_field_map(&fields) {
        Ok(event) => {
            debug!(
                entry_id = %entry.id,
                trace_id = %event.trace_id,
                event_type = ?event.event_type,
                "processing trace event"
            );
            if let Err(error) = inner.processor.process(event).await {
                error!(entry_id = %entry.id, error = %error, "processor failed, acknowledging anyway");
            }
            let ack: redis::RedisResult<i64> = conn
                .xack(
                    &inner.config.stream_name,
                    &inner.config.consumer_group,
                    &[&entry.id],
                )
                .await;
            if let Err(error) = ack {
                warn!(entry_id = %entry.id, error = %error, "failed to acknowledge entry");
            }
        }
        Err(error) => {
            warn!(entry_id = %entry.id, error = %error, "undecodable stream entry, leaving for redelivery");
        }
    }
}

/// Stream entries arrive with untyped values; only strings survive.
fn stringify_fields(entry: &StreamId) -> HashMap<String, String> {
    entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect()
}
