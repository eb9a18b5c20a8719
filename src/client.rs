// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating Fast clients.
//!
//! A [`FastClient`] owns one side of an already-established transport and
//! multiplexes concurrent RPC requests over it. Each call to
//! [`FastClient::rpc`] allocates a message id, records the request in the
//! pending table, writes a DATA message, and returns a [`FastRpcRequest`]
//! stream that yields the values emitted by the server followed by exactly
//! one terminal: a clean end or a [`FastRequestError`].
//!
//! There is no in-band cancellation in the protocol. Aborting a request
//! only transitions it locally; the msgid moves to an aborted table so the
//! server's subsequent messages can be recognized and discarded until its
//! END finally retires the id. Sending any kind of cancellation message
//! would be misread by deployed servers as a new RPC.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::crc::CrcMode;
use crate::error::{
    FastError, FastProtocolError, FastRequestError, FastServerError,
    RemoteServerError, RequestAbortedError, TimeoutError, TransportError,
};
use crate::events::{
    emit, AbortedSnapshot, ClientEvent, ClientSnapshot, CompletedSnapshot,
    EngineCounters, EventSink, InflightSnapshot, RequestOutcome,
};
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageId, FastMessageStatus,
    FastRpcCodec, FP_DEFAULT_MAX_DATA_LEN,
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

const DATA_NOT_ARRAY: &str =
    "data.d for DATA and END messages must be an array";

/// Configuration for a Fast client engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// CRC mode used when encoding and validating messages.
    pub crc_mode: CrcMode,
    /// Cap on the data payload size of a single message.
    pub max_data_len: usize,
    /// How many completed requests to retain for debugging.
    pub n_recent_requests: usize,
    /// Optional sink for structured engine events.
    pub events: Option<EventSink<ClientEvent>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            crc_mode: CrcMode::default(),
            max_data_len: FP_DEFAULT_MAX_DATA_LEN,
            n_recent_requests: 10,
            events: None,
        }
    }
}

/// Per-request options accepted by [`FastClient::rpc_opts`].
#[derive(Default)]
pub struct RpcOptions {
    /// Abort the request with a timeout cause if no terminal has arrived
    /// after this long.
    pub timeout: Option<Duration>,
    /// Request-scoped logger; defaults to a child of the client logger.
    pub log: Option<Logger>,
}

enum RequestEvent {
    Data(Value),
    End,
    Error(FastRequestError),
}

/// The consumer half of one RPC request. Data items arrive in the order
/// the server emitted them, strictly before the single terminal event.
pub struct FastRpcRequest {
    msgid: u32,
    method: String,
    rx: mpsc::UnboundedReceiver<RequestEvent>,
    inner: Arc<ClientInner>,
    done: bool,
}

impl FastRpcRequest {
    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Receive the next value emitted by the server. Resolves to
    /// `Ok(Some(value))` for each data item, `Ok(None)` when the request
    /// ends cleanly, and `Err` if the request terminates with an error.
    /// After a terminal has been returned, further calls return `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Value>, FastRequestError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(RequestEvent::Data(v)) => Ok(Some(v)),
            Some(RequestEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(RequestEvent::Error(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Receive every value emitted by the request, returning them in
    /// order once the request ends cleanly.
    pub async fn collect(mut self) -> Result<Vec<Value>, FastRequestError> {
        let mut values = Vec::new();
        while let Some(v) = self.recv().await? {
            values.push(v);
        }
        Ok(values)
    }

    /// Abort the request locally. The server is never notified and will
    /// keep executing; its remaining messages for this msgid are counted
    /// and discarded until its END retires the id. The request stream
    /// receives a `RequestAbortedError` terminal asynchronously.
    pub fn abort(&self) {
        self.inner.abort_request(self.msgid, None);
    }
}

/// A Fast protocol client engine.
#[derive(Clone)]
pub struct FastClient {
    inner: Arc<ClientInner>,
}

impl FastClient {
    /// Create a client engine over an established bidirectional byte
    /// stream. If no logger is provided the slog `StdLog` drain is used.
    pub fn new<T>(
        log: Option<Logger>,
        transport: T,
        config: ClientConfig,
    ) -> FastClient
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("fast_client_id" => client_id));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            log,
            client_id,
            msg_id: FastMessageId::new(),
            n_recent: config.n_recent_requests,
            events: config.events,
            counters: EngineCounters::default(),
            state: Mutex::new(ClientState::default()),
            outbound,
            cancel: CancellationToken::new(),
        });

        let (rd, wr) = io::split(transport);
        let read_frames = FramedRead::new(
            rd,
            FastRpcCodec::new(config.crc_mode, config.max_data_len),
        );
        let write_frames = FramedWrite::new(
            wr,
            FastRpcCodec::new(config.crc_mode, config.max_data_len),
        );
        tokio::spawn(read_task(inner.clone(), read_frames));
        tokio::spawn(write_task(inner.clone(), write_frames, outbound_rx));

        debug!(inner.log, "fast client attached to transport");
        FastClient { inner }
    }

    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    /// Issue an RPC call and return the request stream. This never fails
    /// synchronously: if the engine is detached, the transport has ended,
    /// or a fatal error has occurred, the returned stream yields the
    /// failure on its first receive.
    pub fn rpc(&self, method: &str, args: Vec<Value>) -> FastRpcRequest {
        self.rpc_opts(method, args, RpcOptions::default())
    }

    /// Issue an RPC call with per-request options.
    pub fn rpc_opts(
        &self,
        method: &str,
        args: Vec<Value>,
        opts: RpcOptions,
    ) -> FastRpcRequest {
        Arc::clone(&self.inner).start_request(method, args, opts)
    }

    /// Detach the engine from its transport. Idempotent: the first call
    /// stops the read and write tasks and fails every pending request
    /// with a `TransportError`; later calls do nothing.
    pub fn detach(&self) {
        self.inner.detach();
    }

    /// Point-in-time view of the engine's counters, in-flight requests,
    /// and recently-completed requests.
    pub fn snapshot(&self) -> ClientSnapshot {
        self.inner.snapshot()
    }
}

struct PendingRequest {
    method: String,
    tx: mpsc::UnboundedSender<RequestEvent>,
    ndata: u64,
    started: Instant,
    /// The most recent inbound message for this request, kept for
    /// debugging.
    last_message: Option<FastMessage>,
}

struct AbortedRequest {
    method: String,
    nignored: u64,
    since: Instant,
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<u32, PendingRequest>,
    aborted: HashMap<u32, AbortedRequest>,
    recent: VecDeque<CompletedSnapshot>,
    fatal: Option<FastError>,
    nfatal: u64,
    detached: bool,
    transport_ended: bool,
}

struct ClientInner {
    log: Logger,
    client_id: u64,
    msg_id: FastMessageId,
    n_recent: usize,
    events: Option<EventSink<ClientEvent>>,
    counters: EngineCounters,
    state: Mutex<ClientState>,
    outbound: mpsc::UnboundedSender<FastMessage>,
    cancel: CancellationToken,
}

fn push_recent(
    recent: &mut VecDeque<CompletedSnapshot>,
    cap: usize,
    entry: CompletedSnapshot,
) {
    if cap == 0 {
        return;
    }
    if recent.len() == cap {
        recent.pop_front();
    }
    recent.push_back(entry);
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_request(
        self: Arc<Self>,
        method: &str,
        args: Vec<Value>,
        opts: RpcOptions,
    ) -> FastRpcRequest {
        let (tx, rx) = mpsc::unbounded_channel();
        let msgid = self.msg_id.next_id();
        let rlog = opts.log.unwrap_or_else(|| {
            self.log
                .new(o!("msgid" => msgid, "method" => String::from(method)))
        });

        let request = FastRpcRequest {
            msgid,
            method: String::from(method),
            rx,
            inner: self.clone(),
            done: false,
        };

        // An engine that can no longer talk to the server fails the
        // request asynchronously rather than synchronously.
        let dead = {
            let state = self.lock_state();
            if state.detached {
                Some(FastError::Transport(TransportError::detached()))
            } else if let Some(fatal) = &state.fatal {
                Some(fatal.clone())
            } else if state.transport_ended {
                Some(FastError::Transport(TransportError::new(
                    "transport stream ended",
                )))
            } else {
                None
            }
        };
        if let Some(cause) = dead {
            warn!(rlog, "rpc issued on dead client"; "cause" => %cause);
            let err = FastRequestError::new(msgid, method, cause);
            let _ = tx.send(RequestEvent::Error(err));
            return request;
        }

        let args = Value::Array(args);
        {
            let mut state = self.lock_state();
            state.pending.insert(
                msgid,
                PendingRequest {
                    method: String::from(method),
                    tx: tx.clone(),
                    ndata: 0,
                    started: Instant::now(),
                    last_message: None,
                },
            );
        }
        self.counters.record_started();
        emit(
            &self.events,
            ClientEvent::RpcStart {
                client_id: self.client_id,
                msgid,
                method: String::from(method),
                args: args.clone(),
            },
        );
        debug!(rlog, "sending rpc request");

        let msg = FastMessage::data(
            msgid,
            FastMessageData::new(String::from(method), args),
        );
        if self.outbound.send(msg).is_err() {
            // The write task is gone; the request can never reach the
            // server.
            let mut state = self.lock_state();
            if let Some(p) = state.pending.remove(&msgid) {
                let err = FastRequestError::new(
                    msgid,
                    &p.method,
                    FastError::Transport(TransportError::new(
                        "transport write channel closed",
                    )),
                );
                self.counters.record_failed();
                emit(
                    &self.events,
                    ClientEvent::RpcDone {
                        client_id: self.client_id,
                        msgid,
                        error: Some(err.to_string()),
                    },
                );
                push_recent(
                    &mut state.recent,
                    self.n_recent,
                    CompletedSnapshot {
                        msgid,
                        method: p.method.clone(),
                        ndata: p.ndata,
                        outcome: RequestOutcome::Failed,
                        error: Some(err.to_string()),
                        duration: p.started.elapsed(),
                    },
                );
                let _ = p.tx.send(RequestEvent::Error(err));
            }
            return request;
        }

        if let Some(timeout) = opts.timeout {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.abort_request(
                    msgid,
                    Some(FastError::Timeout(TimeoutError {
                        timeout_ms: timeout.as_millis() as u64,
                    })),
                );
            });
        }

        request
    }

    /// Move a pending request to the aborted table and synthesize its
    /// terminal. No-op if the request has already completed or aborted.
    fn abort_request(&self, msgid: u32, cause: Option<FastError>) {
        let mut state = self.lock_state();
        let p = match state.pending.remove(&msgid) {
            Some(p) => p,
            None => return,
        };
        state.aborted.insert(
            msgid,
            AbortedRequest {
                method: p.method.clone(),
                nignored: 0,
                since: Instant::now(),
            },
        );
        let aborted = RequestAbortedError {
            cause: cause.map(Box::new),
        };
        let err = FastRequestError::new(
            msgid,
            &p.method,
            FastError::Aborted(aborted),
        );
        self.counters.record_failed();
        emit(
            &self.events,
            ClientEvent::RpcDone {
                client_id: self.client_id,
                msgid,
                error: Some(err.to_string()),
            },
        );
        push_recent(
            &mut state.recent,
            self.n_recent,
            CompletedSnapshot {
                msgid,
                method: p.method.clone(),
                ndata: p.ndata,
                outcome: RequestOutcome::Aborted,
                error: Some(err.to_string()),
                duration: p.started.elapsed(),
            },
        );
        let _ = p.tx.send(RequestEvent::Error(err));
        drop(state);
        debug!(self.log, "rpc request aborted"; "msgid" => msgid);
    }

    fn route_message(&self, msg: FastMessage) {
        if let Some(err) = self.route_message_inner(msg) {
            self.fatal(err);
        }
    }

    fn route_message_inner(&self, msg: FastMessage) -> Option<FastError> {
        let msgid = msg.id;
        let mut state = self.lock_state();

        if state.aborted.contains_key(&msgid) {
            if msg.status == FastMessageStatus::End {
                state.aborted.remove(&msgid);
                debug!(self.log, "late end retired aborted request";
                    "msgid" => msgid);
            } else if let Some(aborted) = state.aborted.get_mut(&msgid) {
                aborted.nignored += 1;
            }
            return None;
        }

        if !state.pending.contains_key(&msgid) {
            return Some(FastError::Protocol(FastProtocolError::UnknownMsgid(
                msgid,
            )));
        }

        match msg.status {
            FastMessageStatus::Data => {
                let items = match &msg.data.d {
                    Value::Array(items) => items.clone(),
                    _ => {
                        return Some(FastError::Protocol(
                            FastProtocolError::BadDataShape(DATA_NOT_ARRAY),
                        ))
                    }
                };
                if let Some(p) = state.pending.get_mut(&msgid) {
                    p.last_message = Some(msg.clone());
                    for item in items {
                        p.ndata += 1;
                        emit(
                            &self.events,
                            ClientEvent::RpcData {
                                client_id: self.client_id,
                                msgid,
                                datum: item.clone(),
                            },
                        );
                        let _ = p.tx.send(RequestEvent::Data(item));
                    }
                }
                None
            }
            FastMessageStatus::End => {
                let items = match &msg.data.d {
                    Value::Array(items) => items.clone(),
                    _ => {
                        return Some(FastError::Protocol(
                            FastProtocolError::BadDataShape(DATA_NOT_ARRAY),
                        ))
                    }
                };
                if let Some(mut p) = state.pending.remove(&msgid) {
                    for item in items {
                        p.ndata += 1;
                        emit(
                            &self.events,
                            ClientEvent::RpcData {
                                client_id: self.client_id,
                                msgid,
                                datum: item.clone(),
                            },
                        );
                        let _ = p.tx.send(RequestEvent::Data(item));
                    }
                    let _ = p.tx.send(RequestEvent::End);
                    self.counters.record_completed();
                    emit(
                        &self.events,
                        ClientEvent::RpcDone {
                            client_id: self.client_id,
                            msgid,
                            error: None,
                        },
                    );
                    push_recent(
                        &mut state.recent,
                        self.n_recent,
                        CompletedSnapshot {
                            msgid,
                            method: p.method,
                            ndata: p.ndata,
                            outcome: RequestOutcome::Ok,
                            error: None,
                            duration: p.started.elapsed(),
                        },
                    );
                }
                None
            }
            FastMessageStatus::Error => {
                if let Some(p) = state.pending.remove(&msgid) {
                    // The decoder already enforced the error shape, but a
                    // peer may still have sent non-string fields.
                    let remote = serde_json::from_value::<RemoteServerError>(
                        msg.data.d.clone(),
                    )
                    .unwrap_or_else(|_| RemoteServerError::unspecified());
                    let cause =
                        FastError::Server(FastServerError::new(remote));
                    let err = FastRequestError::new(msgid, &p.method, cause);
                    self.counters.record_failed();
                    emit(
                        &self.events,
                        ClientEvent::RpcDone {
                            client_id: self.client_id,
                            msgid,
                            error: Some(err.to_string()),
                        },
                    );
                    push_recent(
                        &mut state.recent,
                        self.n_recent,
                        CompletedSnapshot {
                            msgid,
                            method: p.method.clone(),
                            ndata: p.ndata,
                            outcome: RequestOutcome::Failed,
                            error: Some(err.to_string()),
                            duration: p.started.elapsed(),
                        },
                    );
                    let _ = p.tx.send(RequestEvent::Error(err));
                }
                None
            }
        }
    }

    /// Record the first fatal engine error and fail every pending
    /// request with it. Later fatal errors are only counted and logged.
    fn fatal(&self, err: FastError) {
        let mut state = self.lock_state();
        if state.fatal.is_some() {
            state.nfatal += 1;
            drop(state);
            warn!(self.log, "client error after fatal error"; "err" => %err);
            return;
        }
        state.fatal = Some(err.clone());
        let pending: Vec<(u32, PendingRequest)> =
            state.pending.drain().collect();
        for (msgid, p) in pending {
            let rerr = FastRequestError::new(msgid, &p.method, err.clone());
            self.counters.record_failed();
            emit(
                &self.events,
                ClientEvent::RpcDone {
                    client_id: self.client_id,
                    msgid,
                    error: Some(rerr.to_string()),
                },
            );
            push_recent(
                &mut state.recent,
                self.n_recent,
                CompletedSnapshot {
                    msgid,
                    method: p.method.clone(),
                    ndata: p.ndata,
                    outcome: RequestOutcome::Failed,
                    error: Some(rerr.to_string()),
                    duration: p.started.elapsed(),
                },
            );
            let _ = p.tx.send(RequestEvent::Error(rerr));
        }
        drop(state);
        error!(self.log, "fatal client engine error"; "err" => %err);
        emit(
            &self.events,
            ClientEvent::Error {
                client_id: self.client_id,
                error: err.to_string(),
            },
        );
        self.cancel.cancel();
    }

    /// The transport signaled end-of-stream. Benign when nothing is
    /// pending; fatal otherwise.
    fn transport_ended(&self) {
        let pending_empty = {
            let mut state = self.lock_state();
            state.transport_ended = true;
            state.pending.is_empty()
        };
        if pending_empty {
            debug!(self.log, "transport ended with no requests pending");
            self.cancel.cancel();
        } else {
            self.fatal(FastError::Protocol(FastProtocolError::UnexpectedEnd));
        }
    }

    fn detach(&self) {
        let mut state = self.lock_state();
        if state.detached {
            return;
        }
        state.detached = true;
        let pending: Vec<(u32, PendingRequest)> =
            state.pending.drain().collect();
        for (msgid, p) in pending {
            let err = FastRequestError::new(
                msgid,
                &p.method,
                FastError::Transport(TransportError::detached()),
            );
            self.counters.record_failed();
            emit(
                &self.events,
                ClientEvent::RpcDone {
                    client_id: self.client_id,
                    msgid,
                    error: Some(err.to_string()),
                },
            );
            push_recent(
                &mut state.recent,
                self.n_recent,
                CompletedSnapshot {
                    msgid,
                    method: p.method.clone(),
                    ndata: p.ndata,
                    outcome: RequestOutcome::Failed,
                    error: Some(err.to_string()),
                    duration: p.started.elapsed(),
                },
            );
            let _ = p.tx.send(RequestEvent::Error(err));
        }
        drop(state);
        info!(self.log, "client detached from transport");
        self.cancel.cancel();
    }

    fn snapshot(&self) -> ClientSnapshot {
        let state = self.lock_state();
        ClientSnapshot {
            client_id: self.client_id,
            counters: self.counters.snapshot(),
            detached: state.detached,
            fatal_error: state.fatal.as_ref().map(|e| e.to_string()),
            nfatal_suppressed: state.nfatal,
            pending: state
                .pending
                .iter()
                .map(|(msgid, p)| InflightSnapshot {
                    msgid: *msgid,
                    method: p.method.clone(),
                    ndata: p.ndata,
                    age: p.started.elapsed(),
                    last_message: p.last_message.as_ref().map(|m| {
                        serde_json::json!({
                            "status": m.status as u8,
                            "d": m.data.d.clone(),
                        })
                    }),
                })
                .collect(),
            aborted: state
                .aborted
                .iter()
                .map(|(msgid, a)| AbortedSnapshot {
                    msgid: *msgid,
                    method: a.method.clone(),
                    nignored: a.nignored,
                    age: a.since.elapsed(),
                })
                .collect(),
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

async fn read_task<R>(
    inner: Arc<ClientInner>,
    mut frames: FramedRead<R, FastRpcCodec>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!(inner.log, "client read task stopped");
                return;
            }
            item = frames.next() => match item {
                Some(Ok(msg)) => inner.route_message(msg),
                Some(Err(e)) => {
                    inner.fatal(e);
                    return;
                }
                None => {
                    inner.transport_ended();
                    return;
                }
            }
        }
    }
}

async fn write_task<W>(
    inner: Arc<ClientInner>,
    mut sink: FramedWrite<W, FastRpcCodec>,
    mut outbound: mpsc::UnboundedReceiver<FastMessage>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!(inner.log, "client write task stopped");
                return;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        inner.fatal(e);
                        return;
                    }
                }
                None => return,
            }
        }
    }
}
