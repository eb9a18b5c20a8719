// Copyright 2020 Joyent, Inc.

use std::sync::Mutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::io::duplex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use fast_rpc::client::{ClientConfig, FastClient, RpcOptions};
use fast_rpc::error::{
    FastError, FastProtocolError, FastRequestError, RemoteServerError,
};
use fast_rpc::events::{ClientEvent, ServerEvent};
use fast_rpc::protocol::{
    FastMessage, FastMessageData, FastMessageStatus, FastRpcCodec,
};
use fast_rpc::server::{FastRpcContext, FastServer, ServerConfig};

fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Attach a fresh client to `server` over an in-memory duplex pipe.
async fn connect(server: &FastServer) -> FastClient {
    let (client_side, server_side) = duplex(1 << 16);
    let srv = server.clone();
    tokio::spawn(async move {
        srv.serve_connection(server_side, String::from("test-conn")).await;
    });
    FastClient::new(Some(test_log()), client_side, ClientConfig::default())
}

async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn expect_server_cause<'a>(err: &'a FastRequestError) -> &'a RemoteServerError {
    match err.cause.as_ref() {
        FastError::Server(server_err) => &server_err.cause,
        other => panic!("expected server error cause, got {:?}", other),
    }
}

#[tokio::test]
async fn empty_end_delivers_no_values() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("testmethod", |rpc: FastRpcContext| async move {
            rpc.end().await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let values = client
        .rpc("testmethod", vec![json!("val")])
        .collect()
        .await
        .expect("request succeeds");
    assert!(values.is_empty());
    assert!(client.snapshot().fatal_error.is_none());

    let snapshot = client.snapshot();
    assert_eq!(snapshot.counters.started, 1);
    assert_eq!(snapshot.counters.completed, 1);
    assert_eq!(snapshot.counters.failed, 0);
}

#[tokio::test]
async fn data_messages_flatten_in_order() {
    let (client_side, peer_side) = duplex(1 << 16);
    let client = FastClient::new(
        Some(test_log()),
        client_side,
        ClientConfig::default(),
    );
    let mut peer = Framed::new(peer_side, FastRpcCodec::default());

    let req = client.rpc("testmethod", vec![json!("val")]);
    let inbound = peer
        .next()
        .await
        .expect("request frame")
        .expect("request decodes");
    assert_eq!(inbound.status, FastMessageStatus::Data);
    assert_eq!(inbound.data.m.name, "testmethod");
    assert_eq!(inbound.data.d, json!(["val"]));
    let msgid = inbound.id;

    // Five DATA messages carrying 0 through 4 items each, then END.
    for i in 0..5u32 {
        let items: Vec<Value> = (0..i)
            .map(|j| json!(format!("string {}_{}", i, j)))
            .collect();
        let msg = FastMessage::data(
            msgid,
            FastMessageData::new(
                String::from("testmethod"),
                Value::Array(items),
            ),
        );
        peer.send(msg).await.expect("peer write");
    }
    peer.send(FastMessage::end(msgid, String::from("testmethod")))
        .await
        .expect("peer write");

    let values = req.collect().await.expect("request succeeds");
    let expected: Vec<Value> = vec![
        "string 1_0",
        "string 2_0",
        "string 2_1",
        "string 3_0",
        "string 3_1",
        "string 3_2",
        "string 4_0",
        "string 4_1",
        "string 4_2",
        "string 4_3",
    ]
    .into_iter()
    .map(|s| json!(s))
    .collect();
    assert_eq!(values, expected);
}

#[tokio::test]
async fn server_error_produces_layered_request_error() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("testmethod", |rpc: FastRpcContext| async move {
            let mut info = Map::new();
            info.insert(String::from("dummyProp"), json!("dummyVal"));
            rpc.fail(RemoteServerError::with_info(
                "DummyError",
                "dummy error message",
                info,
            ))
            .await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let req = client.rpc("testmethod", vec![]);
    let msgid = req.msgid();
    let err = req.collect().await.expect_err("request must fail");

    assert_eq!(
        err.to_string(),
        "request failed: server error: dummy error message"
    );
    let remote = expect_server_cause(&err);
    assert_eq!(remote.name, "DummyError");
    assert_eq!(remote.message, "dummy error message");
    assert_eq!(err.info["rpcMsgid"], json!(msgid));
    assert_eq!(err.info["rpcMethod"], json!("testmethod"));
    assert_eq!(err.info["dummyProp"], json!("dummyVal"));
}

#[tokio::test]
async fn transport_close_before_reply_is_fatal() {
    let (client_side, peer_side) = duplex(1 << 16);
    let client = FastClient::new(
        Some(test_log()),
        client_side,
        ClientConfig::default(),
    );
    let mut peer = Framed::new(peer_side, FastRpcCodec::default());

    let mut req = client.rpc("testmethod", vec![]);
    let _ = peer.next().await.expect("request frame").expect("decodes");
    drop(peer);

    let err = req.recv().await.expect_err("request must fail");
    assert_eq!(
        err.to_string(),
        "request failed: unexpected end of transport stream"
    );
    assert!(matches!(
        err.cause.as_ref(),
        FastError::Protocol(FastProtocolError::UnexpectedEnd)
    ));
    assert_eq!(
        client.snapshot().fatal_error.as_deref(),
        Some("unexpected end of transport stream")
    );
}

#[tokio::test]
async fn unknown_msgid_is_fatal_protocol_error() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (client_side, peer_side) = duplex(1 << 16);
    let config = ClientConfig {
        events: Some(events_tx),
        ..ClientConfig::default()
    };
    let client = FastClient::new(Some(test_log()), client_side, config);
    let mut peer = Framed::new(peer_side, FastRpcCodec::default());

    let mut req = client.rpc("testmethod", vec![]);
    let inbound = peer.next().await.expect("request frame").expect("decodes");
    assert_ne!(inbound.id, 47);

    peer.send(FastMessage::end(47, String::from("testmethod")))
        .await
        .expect("peer write");

    let err = req.recv().await.expect_err("request must fail");
    assert_eq!(
        err.to_string(),
        "request failed: fast protocol: received message with unknown msgid 47"
    );
    assert_eq!(
        client.snapshot().fatal_error.as_deref(),
        Some("fast protocol: received message with unknown msgid 47")
    );

    let mut nerrors = 0;
    while let Ok(event) = events_rx.try_recv() {
        if let ClientEvent::Error { error, .. } = event {
            assert!(error.contains("unknown msgid 47"));
            nerrors += 1;
        }
    }
    assert_eq!(nerrors, 1);
}

#[tokio::test]
async fn ten_thousand_values_then_final_value() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("stream", |rpc: FastRpcContext| async move {
            for i in 0..10_000u32 {
                rpc.write(json!(format!("string_{}", i))).await;
            }
            rpc.end_with(json!("lastmessage")).await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let values = client
        .rpc("stream", vec![])
        .collect()
        .await
        .expect("request succeeds");
    assert_eq!(values.len(), 10_001);
    for (i, value) in values.iter().take(10_000).enumerate() {
        assert_eq!(*value, json!(format!("string_{}", i)));
    }
    assert_eq!(values[10_000], json!("lastmessage"));
}

#[tokio::test]
async fn abort_discards_messages_until_end() {
    let (client_side, peer_side) = duplex(1 << 16);
    let client = FastClient::new(
        Some(test_log()),
        client_side,
        ClientConfig::default(),
    );
    let mut peer = Framed::new(peer_side, FastRpcCodec::default());

    let mut req = client.rpc("testmethod", vec![]);
    let inbound = peer.next().await.expect("request frame").expect("decodes");
    let msgid = inbound.id;

    req.abort();
    let err = req.recv().await.expect_err("request must abort");
    assert_eq!(err.to_string(), "request failed: request aborted");

    // The server knows nothing of the abort and keeps streaming.
    for i in 0..3u32 {
        let msg = FastMessage::data(
            msgid,
            FastMessageData::new(
                String::from("testmethod"),
                json!([format!("late_{}", i)]),
            ),
        );
        peer.send(msg).await.expect("peer write");
    }
    wait_until(|| {
        client
            .snapshot()
            .aborted
            .first()
            .map(|a| a.nignored == 3)
            .unwrap_or(false)
    })
    .await;

    // Its END finally retires the aborted entry without any protocol
    // error.
    peer.send(FastMessage::end(msgid, String::from("testmethod")))
        .await
        .expect("peer write");
    wait_until(|| client.snapshot().aborted.is_empty()).await;
    assert!(client.snapshot().fatal_error.is_none());
}

#[tokio::test]
async fn unsupported_method_yields_fast_error() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    let client = connect(&server).await;

    let err = client
        .rpc("nosuchmethod", vec![])
        .collect()
        .await
        .expect_err("request must fail");
    assert_eq!(
        err.to_string(),
        "request failed: server error: unsupported RPC method: nosuchmethod"
    );
    let remote = expect_server_cause(&err);
    assert_eq!(remote.name, "FastError");

    // The connection survives; a registered method still works.
    server
        .register_rpc_method("echo", |rpc: FastRpcContext| async move {
            let value = rpc.argv().first().cloned().unwrap_or(json!(null));
            rpc.end_with(value).await;
        })
        .expect("registration");
    let values = client
        .rpc("echo", vec![json!("still alive")])
        .collect()
        .await
        .expect("request succeeds");
    assert_eq!(values, vec![json!("still alive")]);
}

#[tokio::test]
async fn concurrent_requests_multiplex_independently() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("echo", |rpc: FastRpcContext| async move {
            let value = rpc.argv().first().cloned().unwrap_or(json!(null));
            rpc.write(value.clone()).await;
            rpc.end_with(value).await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let requests: Vec<_> = (0..10u32)
        .map(|i| (i, client.rpc("echo", vec![json!(i)])))
        .collect();
    for (i, req) in requests {
        let values = req.collect().await.expect("request succeeds");
        assert_eq!(values, vec![json!(i), json!(i)]);
    }

    let snapshot = client.snapshot();
    assert_eq!(snapshot.counters.started, 10);
    assert_eq!(snapshot.counters.completed, 10);
}

#[tokio::test]
async fn request_timeout_fires_while_server_is_silent() {
    let (client_side, peer_side) = duplex(1 << 16);
    let client = FastClient::new(
        Some(test_log()),
        client_side,
        ClientConfig::default(),
    );
    let mut peer = Framed::new(peer_side, FastRpcCodec::default());

    let opts = RpcOptions {
        timeout: Some(Duration::from_millis(25)),
        log: None,
    };
    let mut req = client.rpc_opts("slowmethod", vec![], opts);
    let inbound = peer.next().await.expect("request frame").expect("decodes");
    assert_eq!(inbound.data.m.name, "slowmethod");

    let err = req.recv().await.expect_err("request must time out");
    assert_eq!(err.to_string(), "request failed: request aborted");
    match err.cause.as_ref() {
        FastError::Aborted(aborted) => match aborted.cause.as_deref() {
            Some(FastError::Timeout(t)) => assert_eq!(t.timeout_ms, 25),
            other => panic!("expected timeout cause, got {:?}", other),
        },
        other => panic!("expected aborted cause, got {:?}", other),
    }
}

#[tokio::test]
async fn close_waits_for_inflight_requests() {
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("slow", |rpc: FastRpcContext| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            rpc.end_with(json!("done")).await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let req = client.rpc("slow", vec![]);
    wait_until(|| {
        server
            .snapshot()
            .connections
            .iter()
            .any(|c| !c.inflight.is_empty())
    })
    .await;

    let closer = {
        let server = server.clone();
        tokio::spawn(async move { server.close().await })
    };

    // The in-flight request still completes normally during the drain.
    let values = req.collect().await.expect("request succeeds");
    assert_eq!(values, vec![json!("done")]);

    closer.await.expect("close completes");
    assert!(server.snapshot().connections.is_empty());
    let snapshot = server.snapshot();
    assert_eq!(snapshot.counters.completed, 1);
}

#[tokio::test]
async fn drain_deadline_abandons_stuck_handlers() {
    let config = ServerConfig {
        drain_timeout: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = FastServer::new(Some(test_log()), config);
    server
        .register_rpc_method("wedge", |rpc: FastRpcContext| async move {
            // Holds the request open far past the drain deadline.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            rpc.end().await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let _req = client.rpc("wedge", vec![]);
    wait_until(|| {
        server
            .snapshot()
            .connections
            .iter()
            .any(|c| !c.inflight.is_empty())
    })
    .await;

    server.close().await;
    assert!(server.snapshot().connections.is_empty());
}

#[tokio::test]
async fn server_events_trace_connection_lifecycle() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let config = ServerConfig {
        events: Some(events_tx),
        ..ServerConfig::default()
    };
    let server = FastServer::new(Some(test_log()), config);
    server
        .register_rpc_method("echo", |rpc: FastRpcContext| async move {
            rpc.end().await;
        })
        .expect("registration");
    let client = connect(&server).await;

    let values = client
        .rpc("echo", vec![])
        .collect()
        .await
        .expect("request succeeds");
    assert!(values.is_empty());

    client.detach();
    wait_until(|| server.snapshot().connections.is_empty()).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        kinds.push(match event {
            ServerEvent::ConnCreate { .. } => "conn-create",
            ServerEvent::RpcStart { .. } => "rpc-start",
            ServerEvent::RpcDone { error: None, .. } => "rpc-done",
            ServerEvent::RpcDone { .. } => "rpc-done-error",
            ServerEvent::ConnDestroy { .. } => "conn-destroy",
        });
    }
    assert_eq!(
        kinds,
        vec!["conn-create", "rpc-start", "rpc-done", "conn-destroy"]
    );
}

#[tokio::test]
async fn client_events_trace_request_lifecycle() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let server = FastServer::new(Some(test_log()), ServerConfig::default());
    server
        .register_rpc_method("emit", |rpc: FastRpcContext| async move {
            rpc.write(json!(1)).await;
            rpc.end().await;
        })
        .expect("registration");
    let (client_side, server_side) = duplex(1 << 16);
    {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .serve_connection(server_side, String::from("test-conn"))
                .await;
        });
    }
    let config = ClientConfig {
        events: Some(events_tx),
        ..ClientConfig::default()
    };
    let client = FastClient::new(Some(test_log()), client_side, config);

    let values = client
        .rpc("emit", vec![])
        .collect()
        .await
        .expect("request succeeds");
    assert_eq!(values, vec![json!(1)]);

    let mut kinds = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        kinds.push(match event {
            ClientEvent::RpcStart { .. } => "rpc-start",
            ClientEvent::RpcData { .. } => "rpc-data",
            ClientEvent::RpcDone { error: None, .. } => "rpc-done",
            ClientEvent::RpcDone { .. } => "rpc-done-error",
            ClientEvent::Error { .. } => "error",
        });
    }
    assert_eq!(kinds, vec!["rpc-start", "rpc-data", "rpc-done"]);
}

fn echo_handler(
    rpc: FastRpcContext,
) -> impl std::future::Future<Output = ()> + Send {
    async move {
        let args: Vec<Value> = rpc.argv().to_vec();
        for value in args {
            rpc.write(value).await;
        }
        rpc.end().await;
    }
}

#[test]
fn client_server_comms() {
    tokio_test::block_on(async {
        let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let root_log = Logger::root(
            Mutex::new(LevelFilter::new(
                slog_term::FullFormat::new(plain).build(),
                Level::Info,
            ))
            .fuse(),
            o!("build-id" => "0.2.0"),
        );

        let server =
            FastServer::new(Some(root_log.clone()), ServerConfig::default());
        server
            .register_rpc_method("echo", echo_handler)
            .expect("registration");

        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().expect("local addr");
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let stream =
            TcpStream::connect(addr).await.expect("failed to connect");
        let client = FastClient::new(
            Some(root_log),
            stream,
            ClientConfig::default(),
        );

        for i in 1..100usize {
            let data_size = i * 1000;
            let arg = json!("a".repeat(data_size));
            let values = client
                .rpc("echo", vec![arg.clone()])
                .collect()
                .await
                .expect("rpc");
            assert_eq!(values, vec![arg]);
        }

        client.detach();
        server.close().await;
        serve_task.await.expect("accept loop exits");
    });
}
