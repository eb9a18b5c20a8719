// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating Fast servers.
//!
//! A [`FastServer`] dispatches inbound RPC requests to registered
//! handlers. Each connection gets its own decoder, encoder, and table of
//! in-flight requests; handlers receive a [`FastRpcContext`] exposing the
//! request identity and the `write`/`end`/`fail` operations. Outbound
//! values pass through a bounded per-connection queue, so transport
//! back-pressure suspends handlers that keep writing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::crc::CrcMode;
use crate::error::{FastError, FastProtocolError, RemoteServerError};
use crate::events::{
    emit, CompletedSnapshot, ConnectionSnapshot, EngineCounters, EventSink,
    InflightSnapshot, RequestOutcome, ServerEvent, ServerSnapshot,
};
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageStatus, FastRpcCodec,
    FP_DEFAULT_MAX_DATA_LEN,
};

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// How many queued values the writer will coalesce into one DATA message.
const WRITE_BATCH_MAX: usize = 32;

/// A handler for one registered RPC method. Implemented for any closure
/// taking the request context and returning a future; the handler owns
/// the request until it calls `end` or `fail` on the context.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(
        &self,
        rpc: FastRpcContext,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(FastRpcContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(
        &self,
        rpc: FastRpcContext,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin((self)(rpc))
    }
}

/// Error returned when a method name is registered twice.
#[derive(Debug, Clone, thiserror::Error)]
#[error("RPC method {0} is already registered")]
pub struct DuplicateMethodError(pub String);

/// Configuration for a Fast server engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// CRC mode used when encoding and validating messages.
    pub crc_mode: CrcMode,
    /// Cap on the data payload size of a single message.
    pub max_data_len: usize,
    /// How long `close` waits for a connection's in-flight requests to
    /// finish before the connection is destroyed anyway.
    pub drain_timeout: Duration,
    /// Depth of the per-connection outbound queue. When the transport
    /// stalls, writes past this depth suspend the handler.
    pub outbound_queue_depth: usize,
    /// How many completed requests to retain for debugging.
    pub n_recent_requests: usize,
    /// Optional sink for structured engine events.
    pub events: Option<EventSink<ServerEvent>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            crc_mode: CrcMode::default(),
            max_data_len: FP_DEFAULT_MAX_DATA_LEN,
            drain_timeout: Duration::from_secs(30),
            outbound_queue_depth: 64,
            n_recent_requests: 10,
            events: None,
        }
    }
}

enum ConnOut {
    Data {
        msgid: u32,
        method: String,
        value: Value,
    },
    End {
        msgid: u32,
        method: String,
        value: Option<Value>,
    },
    Error {
        msgid: u32,
        method: String,
        error: RemoteServerError,
    },
}

/// The per-request context handed to an RPC handler. `end` and `fail`
/// consume the context, so a request cannot be terminated twice; writes
/// that race connection teardown are no-ops with a diagnostic log.
pub struct FastRpcContext {
    conn_id: u64,
    msgid: u32,
    method: String,
    argv: Vec<Value>,
    out: mpsc::Sender<ConnOut>,
    terminated: Arc<AtomicBool>,
    log: Logger,
}

impl FastRpcContext {
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }

    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    /// The argument values from the client's DATA message.
    pub fn argv(&self) -> &[Value] {
        &self.argv
    }

    /// Emit one value to the client. Values queued back-to-back are
    /// coalesced into a single DATA message. Suspends while the transport
    /// is back-pressured.
    pub async fn write(&self, value: Value) {
        let item = ConnOut::Data {
            msgid: self.msgid,
            method: self.method.clone(),
            value,
        };
        if self.out.send(item).await.is_err() {
            debug!(self.log, "write after connection teardown ignored");
        }
    }

    /// Complete the request successfully with an empty final payload.
    pub async fn end(self) {
        self.finish(None).await
    }

    /// Complete the request successfully, carrying `value` as the final
    /// emitted item.
    pub async fn end_with(self, value: Value) {
        self.finish(Some(value)).await
    }

    async fn finish(self, value: Option<Value>) {
        self.terminated.store(true, Ordering::Release);
        let item = ConnOut::End {
            msgid: self.msgid,
            method: self.method.clone(),
            value,
        };
        if self.out.send(item).await.is_err() {
            debug!(self.log, "end after connection teardown ignored");
        }
    }

    /// Fail the request with the given error description. The error's
    /// name, message, and optional info and context are serialized into
    /// the ERROR message.
    pub async fn fail(self, error: RemoteServerError) {
        self.terminated.store(true, Ordering::Release);
        let item = ConnOut::Error {
            msgid: self.msgid,
            method: self.method.clone(),
            error,
        };
        if self.out.send(item).await.is_err() {
            debug!(self.log, "fail after connection teardown ignored");
        }
    }
}

struct InflightEntry {
    method: String,
    ndata: u64,
    started: Instant,
}

struct ConnState {
    conn_id: u64,
    label: String,
    log: Logger,
    inflight: Mutex<HashMap<u32, InflightEntry>>,
    drained: Notify,
}

impl ConnState {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<u32, InflightEntry>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.lock_inflight().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

struct ServerInner {
    log: Logger,
    server_id: u64,
    config: ServerConfig,
    registry: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    counters: EngineCounters,
    conn_ids: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ConnState>>>,
    recent: Mutex<VecDeque<CompletedSnapshot>>,
    shutdown: CancellationToken,
    conns_done: Notify,
}

/// A Fast protocol server engine.
#[derive(Clone)]
pub struct FastServer {
    inner: Arc<ServerInner>,
}

impl FastServer {
    /// Create a server engine. If no logger is provided the slog
    /// `StdLog` drain is used.
    pub fn new(log: Option<Logger>, config: ServerConfig) -> FastServer {
        let server_id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed);
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("fast_server_id" => server_id));

        FastServer {
            inner: Arc::new(ServerInner {
                log,
                server_id,
                config,
                registry: RwLock::new(HashMap::new()),
                counters: EngineCounters::default(),
                conn_ids: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
                recent: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
                conns_done: Notify::new(),
            }),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.inner.server_id
    }

    /// Register an RPC method handler. Registration is expected to
    /// happen during server configuration, before connections are
    /// served. Duplicate names are an error.
    pub fn register_rpc_method<H>(
        &self,
        method: &str,
        handler: H,
    ) -> Result<(), DuplicateMethodError>
    where
        H: RpcHandler,
    {
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if registry.contains_key(method) {
            return Err(DuplicateMethodError(String::from(method)));
        }
        registry.insert(String::from(method), Arc::new(handler));
        debug!(self.inner.log, "registered rpc method"; "method" => method);
        Ok(())
    }

    /// Accept connections from `listener` until the server is closed.
    pub async fn serve(&self, listener: TcpListener) {
        info!(self.inner.log, "listening for fast requests");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    debug!(self.inner.log, "accept loop stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            inner.serve_connection(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => {
                        error!(self.inner.log, "failed to accept connection";
                            "err" => %e);
                    }
                }
            }
        }
    }

    /// Drive one connection over an established bidirectional byte
    /// stream until the peer disconnects or the server is closed. The
    /// accept loop calls this for every socket; it is public so custom
    /// transports can be served too.
    pub async fn serve_connection<T>(&self, stream: T, label: String)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Arc::clone(&self.inner).serve_connection(stream, label).await
    }

    /// Gracefully shut down: stop reading new requests on every
    /// connection, let in-flight requests finish (up to the drain
    /// deadline), and destroy each connection as it drains.
    pub async fn close(&self) {
        info!(self.inner.log, "server shutting down");
        self.inner.shutdown.cancel();
        loop {
            let notified = self.inner.conns_done.notified();
            if self.inner.lock_connections().is_empty() {
                break;
            }
            notified.await;
        }
        info!(self.inner.log, "server shutdown complete");
    }

    /// Point-in-time view of the engine's counters, connections with
    /// their in-flight requests, and recently-completed requests.
    pub fn snapshot(&self) -> ServerSnapshot {
        let inner = &self.inner;
        let connections = inner
            .lock_connections()
            .values()
            .map(|conn| ConnectionSnapshot {
                conn_id: conn.conn_id,
                label: conn.label.clone(),
                inflight: conn
                    .lock_inflight()
                    .iter()
                    .map(|(msgid, entry)| InflightSnapshot {
                        msgid: *msgid,
                        method: entry.method.clone(),
                        ndata: entry.ndata,
                        age: entry.started.elapsed(),
                        last_message: None,
                    })
                    .collect(),
            })
            .collect();
        ServerSnapshot {
            server_id: inner.server_id,
            counters: inner.counters.snapshot(),
            connections,
            recent: inner
                .recent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }
}

impl ServerInner {
    fn lock_connections(
        &self,
    ) -> MutexGuard<'_, HashMap<u64, Arc<ConnState>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn serve_connection<T>(self: Arc<Self>, stream: T, label: String)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.conn_ids.fetch_add(1, Ordering::Relaxed);
        let log = self
            .log
            .new(o!("conn_id" => conn_id, "label" => label.clone()));
        let conn = Arc::new(ConnState {
            conn_id,
            label: label.clone(),
            log: log.clone(),
            inflight: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        });
        self.lock_connections().insert(conn_id, conn.clone());
        emit(
            &self.config.events,
            ServerEvent::ConnCreate {
                server_id: self.server_id,
                conn_id,
                label,
            },
        );
        info!(log, "connection established");

        let (rd, wr) = io::split(stream);
        let mut frames = FramedRead::new(
            rd,
            FastRpcCodec::new(self.config.crc_mode, self.config.max_data_len),
        );
        let sink = FramedWrite::new(
            wr,
            FastRpcCodec::new(self.config.crc_mode, self.config.max_data_len),
        );
        let (out_tx, out_rx) =
            mpsc::channel::<ConnOut>(self.config.outbound_queue_depth);
        let conn_dead = CancellationToken::new();

        let writer = tokio::spawn(write_loop(
            self.clone(),
            conn.clone(),
            sink,
            out_rx,
            conn_dead.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(log, "shutdown: connection stopped reading");
                    break;
                }
                _ = conn_dead.cancelled() => break,
                item = frames.next() => match item {
                    Some(Ok(msg)) => {
                        if let Err(e) =
                            self.dispatch(&conn, &out_tx, msg).await
                        {
                            error!(log, "protocol error on connection";
                                "err" => %e);
                            conn_dead.cancel();
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(log, "failed to decode fast message";
                            "err" => %e);
                        conn_dead.cancel();
                        break;
                    }
                    None => {
                        debug!(log, "client closed connection");
                        break;
                    }
                }
            }
        }

        // No new requests will start. Handlers still hold clones of
        // out_tx; the writer exits once they finish and drop them. A
        // connection torn down by a protocol or write error cannot flush
        // terminals anymore, so there is nothing to drain.
        drop(out_tx);
        if !conn_dead.is_cancelled() {
            let drained = tokio::time::timeout(
                self.config.drain_timeout,
                conn.wait_drained(),
            )
            .await;
            if drained.is_err() {
                let abandoned = conn.lock_inflight().len();
                warn!(log, "drain deadline elapsed; abandoning in-flight requests";
                    "abandoned" => abandoned);
                conn_dead.cancel();
            }
        }
        let _ = writer.await;

        self.lock_connections().remove(&conn_id);
        self.conns_done.notify_waiters();
        emit(
            &self.config.events,
            ServerEvent::ConnDestroy {
                server_id: self.server_id,
                conn_id,
            },
        );
        info!(log, "connection destroyed");
    }

    /// Handle one decoded client message: validate it, then either reply
    /// with an unsupported-method error or start a handler for it. A
    /// returned error is fatal to the connection.
    async fn dispatch(
        &self,
        conn: &Arc<ConnState>,
        out: &mpsc::Sender<ConnOut>,
        msg: FastMessage,
    ) -> Result<(), FastProtocolError> {
        if msg.status != FastMessageStatus::Data {
            return Err(FastProtocolError::NotData);
        }
        let msgid = msg.id;
        let method = msg.data.m.name.clone();
        let argv = match msg.data.d {
            Value::Array(args) => args,
            _ => {
                return Err(FastProtocolError::BadDataShape(
                    "client DATA messages must carry an array of arguments",
                ))
            }
        };

        let handler = {
            let registry =
                self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.get(&method).cloned()
        };
        let handler = match handler {
            Some(h) => h,
            None => {
                warn!(conn.log, "unsupported rpc method requested";
                    "method" => &method, "msgid" => msgid);
                let error = RemoteServerError::new(
                    "FastError",
                    &format!("unsupported RPC method: {}", method),
                );
                // This request never starts, so the reply bypasses the
                // in-flight table.
                let _ = out
                    .send(ConnOut::Error {
                        msgid,
                        method,
                        error,
                    })
                    .await;
                return Ok(());
            }
        };

        {
            let mut inflight = conn.lock_inflight();
            if inflight.contains_key(&msgid) {
                return Err(FastProtocolError::DuplicateMsgid(msgid));
            }
            inflight.insert(
                msgid,
                InflightEntry {
                    method: method.clone(),
                    ndata: 0,
                    started: Instant::now(),
                },
            );
        }
        self.counters.record_started();
        emit(
            &self.config.events,
            ServerEvent::RpcStart {
                server_id: self.server_id,
                conn_id: conn.conn_id,
                req_id: msgid,
                method: method.clone(),
            },
        );
        debug!(conn.log, "dispatching rpc request";
            "method" => &method, "msgid" => msgid);

        let terminated = Arc::new(AtomicBool::new(false));
        let ctx = FastRpcContext {
            conn_id: conn.conn_id,
            msgid,
            method: method.clone(),
            argv,
            out: out.clone(),
            terminated: terminated.clone(),
            log: conn.log.new(o!("msgid" => msgid)),
        };
        let fallback_out = out.clone();
        let hlog = conn.log.clone();
        tokio::spawn(async move {
            handler.handle(ctx).await;
            if !terminated.load(Ordering::Acquire) {
                // The handler leaked the request; terminate it so the
                // client is not left waiting and the drain cannot wedge.
                warn!(hlog, "rpc handler returned without ending the request";
                    "method" => &method, "msgid" => msgid);
                let error = RemoteServerError::new(
                    "FastError",
                    "RPC handler returned without completing the request",
                );
                let _ = fallback_out
                    .send(ConnOut::Error {
                        msgid,
                        method,
                        error,
                    })
                    .await;
            }
        });

        Ok(())
    }

    /// Retire an in-flight request after its terminal message has been
    /// written to the transport.
    fn complete_request(
        &self,
        conn: &ConnState,
        msgid: u32,
        error: Option<String>,
    ) {
        let entry = {
            let mut inflight = conn.lock_inflight();
            let entry = inflight.remove(&msgid);
            if inflight.is_empty() {
                conn.drained.notify_waiters();
            }
            entry
        };
        let entry = match entry {
            Some(entry) => entry,
            // Unsupported-method replies never had an entry.
            None => return,
        };

        let outcome = match &error {
            None => {
                self.counters.record_completed();
                RequestOutcome::Ok
            }
            Some(_) => {
                self.counters.record_failed();
                RequestOutcome::Failed
            }
        };
        emit(
            &self.config.events,
            ServerEvent::RpcDone {
                server_id: self.server_id,
                conn_id: conn.conn_id,
                req_id: msgid,
                error: error.clone(),
            },
        );
        debug!(conn.log, "rpc request done"; "msgid" => msgid,
            "ok" => error.is_none());

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if self.config.n_recent_requests == 0 {
            return;
        }
        if recent.len() == self.config.n_recent_requests {
            recent.pop_front();
        }
        recent.push_back(CompletedSnapshot {
            msgid,
            method: entry.method,
            ndata: entry.ndata,
            outcome,
            error,
            duration: entry.started.elapsed(),
        });
    }
}

/// Per-connection writer: drains the outbound queue, coalescing
/// consecutive values for the same request into single DATA messages,
/// and retires requests once their terminal has been flushed.
async fn write_loop<W>(
    inner: Arc<ServerInner>,
    conn: Arc<ConnState>,
    mut sink: FramedWrite<W, FastRpcCodec>,
    mut out_rx: mpsc::Receiver<ConnOut>,
    conn_dead: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut carry: Option<ConnOut> = None;
    loop {
        let item = match carry.take() {
            Some(item) => item,
            None => {
                tokio::select! {
                    _ = conn_dead.cancelled() => return,
                    item = out_rx.recv() => match item {
                        Some(item) => item,
                        None => return,
                    }
                }
            }
        };

        let result = match item {
            ConnOut::Data {
                msgid,
                method,
                value,
            } => {
                let mut values = vec![value];
                while values.len() < WRITE_BATCH_MAX {
                    match out_rx.try_recv() {
                        Ok(ConnOut::Data {
                            msgid: next_id,
                            value: next_value,
                            ..
                        }) if next_id == msgid => values.push(next_value),
                        Ok(other) => {
                            carry = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if let Some(entry) = conn.lock_inflight().get_mut(&msgid) {
                    entry.ndata += values.len() as u64;
                }
                let msg = FastMessage::data(
                    msgid,
                    FastMessageData::new(method, Value::Array(values)),
                );
                sink.send(msg).await
            }
            ConnOut::End {
                msgid,
                method,
                value,
            } => {
                let msg = FastMessage::end_with(msgid, method, value);
                let result = sink.send(msg).await;
                if result.is_ok() {
                    inner.complete_request(&conn, msgid, None);
                }
                result
            }
            ConnOut::Error {
                msgid,
                method,
                error,
            } => {
                let message = error.message.clone();
                let d = match serde_json::to_value(&error) {
                    Ok(d) => d,
                    Err(e) => {
                        // Serialization of an error description should
                        // never fail; fall back to its name and message.
                        error!(conn.log, "failed to serialize error payload";
                            "err" => %e);
                        serde_json::json!({
                            "name": error.name,
                            "message": error.message,
                        })
                    }
                };
                let msg = FastMessage::error(
                    msgid,
                    FastMessageData::new(method, d),
                );
                let result = sink.send(msg).await;
                if result.is_ok() {
                    inner.complete_request(&conn, msgid, Some(message));
                }
                result
            }
        };

        if let Err(e) = result {
            log_write_failure(&conn.log, &e);
            conn_dead.cancel();
            return;
        }
    }
}

fn log_write_failure(log: &Logger, err: &FastError) {
    error!(log, "failed to write message to transport"; "err" => %err);
}
