use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use trellis::buffer::IoBuffer;
use trellis::protocol::bolt::{
    BoltCodec, BoltCommand, CMD_CODE_HEARTBEAT, CMD_CODE_RPC_RESPONSE,
    CMD_TYPE_REQUEST_ONEWAY, CMD_TYPE_RESPONSE, STATUS_SERVER_THREADPOOL_BUSY, STATUS_SUCCESS,
    STATUS_TIMEOUT,
};
use trellis::proxy::{GracefulTimings, Proxy, ProxyStats};
use trellis::server::Runtime;
use trellis_common::config::{ProxyConfig, TrellisConfig};
use trellis_common::headers::HeaderBag;

/// Binds an ephemeral listener running the proxy data plane; returns its
/// address, the listener's stat sheet, and the shutdown handle.
async fn start_proxy_with(
    runtime: Arc<Runtime>,
    router_name: &str,
    timings: GracefulTimings,
) -> (std::net::SocketAddr, Arc<ProxyStats>, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(ProxyStats::default());

    let proxy_config: ProxyConfig = serde_json::from_value(serde_json::json!({
        "downstream_protocol": "Auto",
        "router_config_name": router_name,
    }))
    .unwrap();
    let wrapper = runtime.router_manager.get_router_wrapper(router_name);
    let listener_stats = stats.clone();
    let notify_shutdown = broadcast::channel::<()>(1).0;
    let accept_shutdown = notify_shutdown.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let proxy = Proxy::new(
                proxy_config.clone(),
                runtime.cluster_manager.clone(),
                wrapper.clone(),
                runtime.worker_pool.clone(),
                runtime.registry.clone(),
                runtime.filter_factories(),
                listener_stats.clone(),
            );
            let shutdown = accept_shutdown.subscribe();
            tokio::spawn(proxy.handle_connection(stream, shutdown, timings));
        }
    });
    (addr, stats, notify_shutdown)
}

async fn start_proxy(runtime: Arc<Runtime>, router_name: &str) -> (std::net::SocketAddr, Arc<ProxyStats>) {
    // The accept task keeps its own sender clone, so dropping this handle
    // does not signal shutdown.
    let (addr, stats, _shutdown) =
        start_proxy_with(runtime, router_name, GracefulTimings::default()).await;
    (addr, stats)
}

/// A BoltRPC upstream double: answers heartbeats, records requests, and
/// optionally responds after a delay.
async fn start_bolt_upstream(
    respond: bool,
    delay: Duration,
) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<BoltCommand>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let (mut read, write) = stream.into_split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
                tokio::spawn(async move {
                    let mut write = write;
                    while let Some(frame) = out_rx.recv().await {
                        if write.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });

                let mut buf = IoBuffer::new();
                loop {
                    match read.read_buf(buf.as_mut()).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    while let Ok(Some(cmd)) = BoltCodec::decode(&mut buf) {
                        if cmd.is_heartbeat() {
                            let ack = BoltCommand::new_heartbeat_ack(cmd.request_id);
                            let _ = out_tx.send(
                                BoltCodec::encode(&ack).into_inner().freeze(),
                            );
                            continue;
                        }
                        let _ = seen_tx.send(cmd.clone());
                        if respond {
                            let out_tx = out_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let mut headers = HeaderBag::new();
                                headers.set("rpc-result", "ok");
                                let response = BoltCommand::new_rpc_response(
                                    cmd.request_id,
                                    STATUS_SUCCESS,
                                    headers,
                                    Bytes::from_static(b"result"),
                                );
                                let _ = out_tx.send(
                                    BoltCodec::encode(&response).into_inner().freeze(),
                                );
                            });
                        }
                    }
                }
            });
        }
    });
    (addr, seen_rx)
}

async fn send_cmd(write: &mut OwnedWriteHalf, cmd: &BoltCommand) {
    write
        .write_all(BoltCodec::encode(cmd).bytes())
        .await
        .unwrap();
}

async fn recv_cmd(read: &mut OwnedReadHalf, buf: &mut IoBuffer) -> BoltCommand {
    loop {
        if let Some(cmd) = BoltCodec::decode(buf).unwrap() {
            return cmd;
        }
        let n = read.read_buf(buf.as_mut()).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a frame");
    }
}

fn runtime_with_cluster(
    router_name: &str,
    hosts: &[&str],
    extra_cluster: serde_json::Value,
    extra_route: serde_json::Value,
) -> Arc<Runtime> {
    let mut cluster = serde_json::json!({
        "name": "c1",
        "lb_type": "RoundRobin",
        "connect_timeout_ms": 300,
        "hosts": hosts
            .iter()
            .map(|a| serde_json::json!({"address": a}))
            .collect::<Vec<_>>(),
    });
    if let Some(map) = extra_cluster.as_object() {
        for (k, v) in map {
            cluster[k] = v.clone();
        }
    }
    let mut route = serde_json::json!({
        "match": {"prefix": "/"},
        "route": {"cluster_name": "c1"},
    });
    if let Some(map) = extra_route.as_object() {
        for (k, v) in map {
            route["route"][k] = v.clone();
        }
    }
    let config: TrellisConfig = serde_json::from_value(serde_json::json!({
        "clusters": [cluster],
        "routers": [{
            "router_config_name": router_name,
            "virtual_hosts": [{
                "name": "all",
                "domains": ["*"],
                "routers": [route],
            }],
        }],
    }))
    .unwrap();
    Runtime::new(&config)
}

fn bolt_request(request_id: u32) -> BoltCommand {
    let mut headers = HeaderBag::new();
    headers.set("service", "testSofa");
    BoltCommand::new_rpc_request(request_id, headers, Bytes::from_static(b"hello"), -1)
}

#[tokio::test]
async fn bolt_request_response_happy_path() {
    let (upstream, mut seen) = start_bolt_upstream(true, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({}),
    );
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &bolt_request(7)).await;

    let mut buf = IoBuffer::new();
    let response = recv_cmd(&mut read, &mut buf).await;
    assert_eq!(response.cmd_type, CMD_TYPE_RESPONSE);
    assert_eq!(response.cmd_code, CMD_CODE_RPC_RESPONSE);
    assert_eq!(response.status, STATUS_SUCCESS);
    assert_eq!(response.request_id, 7);
    assert_eq!(&response.content[..], b"result");

    // The upstream saw the same header map, minus internal keys.
    let forwarded = seen.recv().await.unwrap();
    assert_eq!(forwarded.headers.get("service"), Some("testSofa"));
    assert!(forwarded.headers.get("x-mosn-host").is_none());
    assert!(forwarded.headers.get("x-mosn-global-timeout").is_none());
    assert_eq!(&forwarded.content[..], b"hello");
}

#[tokio::test]
async fn heartbeat_is_answered_at_the_stream_layer() {
    let runtime = runtime_with_cluster(
        "egress",
        &[],
        serde_json::json!({}),
        serde_json::json!({}),
    );
    let (addr, stats) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &BoltCommand::new_heartbeat(42)).await;

    let mut buf = IoBuffer::new();
    let ack = recv_cmd(&mut read, &mut buf).await;
    assert_eq!(ack.cmd_type, CMD_TYPE_RESPONSE);
    assert_eq!(ack.cmd_code, CMD_CODE_HEARTBEAT);
    assert_eq!(ack.request_id, 42);

    // No active stream was created for the heartbeat.
    assert_eq!(stats.downstream_request_total.get(), 0);
}

#[tokio::test]
async fn upstream_connect_failure_retries_next_host() {
    // A port with nothing behind it, tried first by round robin.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (upstream, _seen) = start_bolt_upstream(true, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&dead_addr.to_string(), &upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({"retry_policy": {"retry_on": true, "num_retries": 1}}),
    );
    let snapshot = runtime.cluster_manager.get_cluster_snapshot("c1").unwrap();
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &bolt_request(11)).await;

    let mut buf = IoBuffer::new();
    let response = recv_cmd(&mut read, &mut buf).await;
    assert_eq!(response.status, STATUS_SUCCESS);
    assert_eq!(response.request_id, 11);

    let stats = snapshot.info.stats();
    assert_eq!(stats.upstream_connection_con_fail.get(), 1);
    assert_eq!(stats.upstream_request_total.get(), 2);
    assert_eq!(stats.upstream_request_retry.get(), 1);
}

#[tokio::test]
async fn circuit_breaker_overflow_synthesizes_busy_response() {
    let (upstream, _seen) = start_bolt_upstream(true, Duration::from_millis(500)).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({"max_requests": 1}),
        serde_json::json!({}),
    );
    let snapshot = runtime.cluster_manager.get_cluster_snapshot("c1").unwrap();
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &bolt_request(1)).await;
    // Let the first request reach the upstream before the second arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;
    send_cmd(&mut write, &bolt_request(2)).await;

    let mut buf = IoBuffer::new();
    let first = recv_cmd(&mut read, &mut buf).await;
    let second = recv_cmd(&mut read, &mut buf).await;
    let (busy, ok) = if first.status == STATUS_SERVER_THREADPOOL_BUSY {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(busy.status, STATUS_SERVER_THREADPOOL_BUSY);
    assert_eq!(busy.request_id, 2);
    assert_eq!(ok.status, STATUS_SUCCESS);
    assert_eq!(ok.request_id, 1);
    assert_eq!(
        snapshot.info.stats().upstream_request_pending_overflow.get(),
        1
    );
}

#[tokio::test]
async fn request_timeout_synthesizes_gateway_timeout() {
    let (upstream, _seen) = start_bolt_upstream(false, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({"timeout_ms": 200}),
    );
    let snapshot = runtime.cluster_manager.get_cluster_snapshot("c1").unwrap();
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &bolt_request(5)).await;

    let mut buf = IoBuffer::new();
    let response = recv_cmd(&mut read, &mut buf).await;
    assert_eq!(response.status, STATUS_TIMEOUT);
    assert_eq!(response.request_id, 5);
    assert_eq!(snapshot.info.stats().upstream_request_timeout.get(), 1);
    // The in-flight counter drained with the reset.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(snapshot.info.stats().upstream_request_active.get(), 0);
}

#[tokio::test]
async fn downstream_close_resets_active_streams() {
    let (upstream, mut seen) = start_bolt_upstream(false, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({}),
    );
    let snapshot = runtime.cluster_manager.get_cluster_snapshot("c1").unwrap();
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (_read, mut write) = stream.into_split();
    for id in 1..=3 {
        send_cmd(&mut write, &bolt_request(id)).await;
    }
    for _ in 0..3 {
        seen.recv().await.unwrap();
    }
    assert_eq!(snapshot.info.stats().upstream_request_active.get(), 3);

    drop(write);
    drop(_read);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(snapshot.info.stats().upstream_request_active.get(), 0);
}

#[tokio::test]
async fn oneway_request_stays_oneway_upstream() {
    let (upstream, mut seen) = start_bolt_upstream(true, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({}),
    );
    let snapshot = runtime.cluster_manager.get_cluster_snapshot("c1").unwrap();
    let (addr, _) = start_proxy(runtime, "egress").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    let mut request = bolt_request(21);
    request.cmd_type = CMD_TYPE_REQUEST_ONEWAY;
    send_cmd(&mut write, &request).await;

    // The upstream sees the call still tagged oneway on the wire.
    let forwarded = seen.recv().await.unwrap();
    assert!(forwarded.is_oneway());
    assert_eq!(forwarded.headers.get("service"), Some("testSofa"));

    // Even though the double answers, nothing flows back downstream and no
    // reply is tracked.
    let mut buf = IoBuffer::new();
    let reply = tokio::time::timeout(
        Duration::from_millis(300),
        recv_cmd(&mut read, &mut buf),
    )
    .await;
    assert!(reply.is_err(), "oneway must not produce a downstream reply");
    assert_eq!(snapshot.info.stats().upstream_request_active.get(), 0);
}

#[tokio::test]
async fn shutdown_stages_connection_close() {
    let (upstream, mut seen) = start_bolt_upstream(false, Duration::ZERO).await;
    let runtime = runtime_with_cluster(
        "egress",
        &[&upstream.to_string()],
        serde_json::json!({}),
        serde_json::json!({}),
    );
    let timings = GracefulTimings {
        graceful_timeout: Duration::from_millis(300),
        conn_read_timeout: Duration::from_millis(100),
    };
    let (addr, stats, shutdown) = start_proxy_with(runtime, "egress", timings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    send_cmd(&mut write, &bolt_request(31)).await;
    seen.recv().await.unwrap();
    assert_eq!(stats.downstream_connection_active.get(), 1);

    let _ = shutdown.send(());

    // Established connections survive the grace window.
    let mut probe = [0u8; 8];
    let early = tokio::time::timeout(Duration::from_millis(150), read.read(&mut probe)).await;
    assert!(early.is_err(), "connection closed before the grace window");

    // After the grace window the stop-connection close lands and the peer
    // sees the transport go away.
    let late = tokio::time::timeout(Duration::from_millis(600), read.read(&mut probe))
        .await
        .expect("connection still open after the grace window")
        .unwrap();
    assert_eq!(late, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stats.downstream_connection_active.get(), 0);
}

#[tokio::test]
async fn http2_prefix_rewrite_reaches_upstream() {
    // Mock HTTP/2 upstream recording the request path.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let (path_tx, mut path_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let path_tx = path_tx.clone();
            tokio::spawn(async move {
                let mut connection = h2::server::handshake(stream).await.unwrap();
                while let Some(Ok((request, mut respond))) = connection.accept().await {
                    let _ = path_tx.send(request.uri().path().to_owned());
                    let response = http::Response::builder()
                        .status(200)
                        .header("x-upstream", "mock")
                        .body(())
                        .unwrap();
                    let mut send = respond.send_response(response, false).unwrap();
                    let _ = send.send_data(Bytes::from_static(b"ok"), true);
                }
            });
        }
    });

    let config: TrellisConfig = serde_json::from_value(serde_json::json!({
        "clusters": [{
            "name": "h2c",
            "connect_timeout_ms": 1000,
            "hosts": [{"address": upstream_addr.to_string()}],
        }],
        "routers": [{
            "router_config_name": "egress",
            "virtual_hosts": [{
                "name": "all",
                "domains": ["*"],
                "routers": [{
                    "match": {"prefix": "/api"},
                    "route": {"cluster_name": "h2c", "prefix_rewrite": "/v1"},
                }],
            }],
        }],
    }))
    .unwrap();
    let runtime = Runtime::new(&config);
    let (addr, _) = start_proxy(runtime, "egress").await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let (send_request, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("GET")
        .uri("http://example.com/api/users")
        .body(())
        .unwrap();
    let mut ready = send_request.ready().await.unwrap();
    let (response, _) = ready.send_request(request, true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-upstream").unwrap(),
        "mock"
    );
    assert_eq!(path_rx.recv().await.unwrap(), "/v1/users");
}
