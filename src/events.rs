// Copyright 2020 Joyent, Inc.

//! Structured observability events and introspection snapshots.
//!
//! The engines do not talk to any logging or metrics backend directly.
//! Besides their slog output, they emit the typed events below to an
//! optional channel sink supplied at construction time, and they can
//! produce point-in-time snapshots of their internal state on demand.
//! Counters use atomic increments so snapshots may be taken from any
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Where engine events are delivered. Sends never block; if the receiver
/// falls away the engine simply stops reporting.
pub type EventSink<E> = mpsc::UnboundedSender<E>;

pub(crate) fn emit<E>(sink: &Option<EventSink<E>>, event: E) {
    if let Some(tx) = sink {
        let _ = tx.send(event);
    }
}

/// Events emitted by a Fast client engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    RpcStart {
        client_id: u64,
        msgid: u32,
        method: String,
        args: Value,
    },
    RpcData {
        client_id: u64,
        msgid: u32,
        datum: Value,
    },
    RpcDone {
        client_id: u64,
        msgid: u32,
        error: Option<String>,
    },
    /// Fired once, for the first fatal engine error.
    Error { client_id: u64, error: String },
}

/// Events emitted by a Fast server engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnCreate {
        server_id: u64,
        conn_id: u64,
        label: String,
    },
    ConnDestroy {
        server_id: u64,
        conn_id: u64,
    },
    RpcStart {
        server_id: u64,
        conn_id: u64,
        req_id: u32,
        method: String,
    },
    RpcDone {
        server_id: u64,
        conn_id: u64,
        req_id: u32,
        error: Option<String>,
    },
}

/// Monotonic request counters shared by both engine halves.
#[derive(Debug, Default)]
pub struct EngineCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an engine's request counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One in-flight request, as seen at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct InflightSnapshot {
    pub msgid: u32,
    pub method: String,
    /// Data items delivered (client) or written (server) so far.
    pub ndata: u64,
    pub age: Duration,
    /// Digest of the most recent inbound message for this request
    /// (client side only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Value>,
}

/// One locally-aborted request still awaiting the server's END.
#[derive(Debug, Clone, Serialize)]
pub struct AbortedSnapshot {
    pub msgid: u32,
    pub method: String,
    /// Messages received and discarded since the abort.
    pub nignored: u64,
    pub age: Duration,
}

/// How a completed request finished.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestOutcome {
    Ok,
    Failed,
    Aborted,
}

/// One recently-completed request retained for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedSnapshot {
    pub msgid: u32,
    pub method: String,
    pub ndata: u64,
    pub outcome: RequestOutcome,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Introspection snapshot of a client engine.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: u64,
    pub counters: CounterSnapshot,
    pub detached: bool,
    pub fatal_error: Option<String>,
    /// Fatal errors observed after the first; only the first is acted on.
    pub nfatal_suppressed: u64,
    pub pending: Vec<InflightSnapshot>,
    pub aborted: Vec<AbortedSnapshot>,
    pub recent: Vec<CompletedSnapshot>,
}

/// Introspection snapshot of one server connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub conn_id: u64,
    pub label: String,
    pub inflight: Vec<InflightSnapshot>,
}

/// Introspection snapshot of a server engine.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub server_id: u64,
    pub counters: CounterSnapshot,
    pub connections: Vec<ConnectionSnapshot>,
    pub recent: Vec<CompletedSnapshot>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = ClientEvent::RpcStart {
            client_id: 1,
            msgid: 7,
            method: String::from("testmethod"),
            args: json!(["x"]),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], json!("rpc-start"));
        assert_eq!(v["msgid"], json!(7));

        let event = ServerEvent::ConnDestroy {
            server_id: 2,
            conn_id: 3,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], json!("conn-destroy"));
    }

    #[test]
    fn counters_accumulate() {
        let counters = EngineCounters::default();
        counters.record_started();
        counters.record_started();
        counters.record_completed();
        counters.record_failed();
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                started: 2,
                completed: 1,
                failed: 1
            }
        );
    }
}
