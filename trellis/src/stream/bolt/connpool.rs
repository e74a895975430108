use super::keepalive::{BoltKeepAlive, DEFAULT_KEEPALIVE_THRESHOLD, DEFAULT_KEEPALIVE_TIMEOUT};
use super::stream::BoltStreamConnection;
use crate::network::{Connection, ConnectionEvent, ConnectionEventListener};
use crate::protocol::ProtocolName;
use crate::stream::{
    ConnectionPool, PoolEventListener, PoolFailureReason, PoolReadiness, StreamContext,
    StreamEventListener, StreamReceiveListener, StreamResetReason,
};
use crate::upstream::Host;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

pub const DEFAULT_SUB_PROTOCOL: u8 = 0x00;

const INIT: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Per upstream-host pool of Bolt stream connections, one active client per
/// sub-protocol.
pub struct BoltConnPool {
    this: Weak<BoltConnPool>,
    host: Arc<Host>,
    clients: Mutex<HashMap<u8, Arc<ActiveClient>>>,
}

/// The pool's handle on one upstream stream connection, including its
/// keep-alive state and the marker used for failure accounting when the
/// transport dies under in-flight requests.
pub struct ActiveClient {
    sub_protocol: u8,
    state: AtomicU8,
    client: Mutex<Option<Arc<BoltStreamConnection>>>,
    keepalive: Mutex<Option<Arc<BoltKeepAlive>>>,
    close_with_active_req: AtomicBool,
    total_stream: AtomicU64,
}

impl ActiveClient {
    fn new(sub_protocol: u8) -> Arc<Self> {
        Arc::new(ActiveClient {
            sub_protocol,
            state: AtomicU8::new(INIT),
            client: Mutex::new(None),
            keepalive: Mutex::new(None),
            close_with_active_req: AtomicBool::new(false),
            total_stream: AtomicU64::new(0),
        })
    }
}

impl BoltConnPool {
    pub fn new(host: Arc<Host>) -> Arc<Self> {
        Arc::new_cyclic(|this| BoltConnPool {
            this: this.clone(),
            host,
            clients: Mutex::new(HashMap::new()),
        })
    }

    async fn init_client(self: Arc<Self>, client: Arc<ActiveClient>) {
        debug!("pool init host {}", self.host.address());
        let info = self.host.cluster_info().clone();
        let conn = match Connection::connect(self.host.address(), info.connect_timeout()).await {
            Ok(conn) => conn,
            Err(event) => {
                self.host.stats().upstream_connection_con_fail.inc();
                info.stats().upstream_connection_con_fail.inc();
                if event == ConnectionEvent::ConnectTimeout {
                    self.host.stats().upstream_request_timeout.inc();
                    info.stats().upstream_request_timeout.inc();
                }
                // Evict so the next request re-triggers init.
                self.clients.lock().unwrap().remove(&client.sub_protocol);
                return;
            }
        };

        let sc = BoltStreamConnection::new_client(conn.clone());
        conn.add_event_listener(Arc::new(ClientConnListener {
            pool: self.this.clone(),
            client: client.clone(),
        }));

        if client.sub_protocol != DEFAULT_SUB_PROTOCOL {
            let keepalive =
                BoltKeepAlive::new(&sc, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_KEEPALIVE_THRESHOLD);
            sc.set_keepalive(keepalive.clone());
            keepalive.start();
            *client.keepalive.lock().unwrap() = Some(keepalive);
        }

        *client.client.lock().unwrap() = Some(sc);

        self.host.stats().upstream_connection_total.inc();
        self.host.stats().upstream_connection_active.inc();
        info.stats().upstream_connection_total.inc();
        info.stats().upstream_connection_active.inc();

        client.state.store(CONNECTED, Ordering::Release);
    }

    fn on_connection_event(&self, client: &Arc<ActiveClient>, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }
        let host_stats = self.host.stats();
        let cluster_stats = self.host.cluster_info().stats();

        host_stats.upstream_connection_close.inc();
        host_stats.upstream_connection_active.dec();
        cluster_stats.upstream_connection_close.inc();
        cluster_stats.upstream_connection_active.dec();

        let with_active = client.close_with_active_req.load(Ordering::Acquire);
        match event {
            // A pool-initiated close (resource pressure, keep-alive
            // exhaustion) counts as local: the close originates on our side
            // of the transport.
            ConnectionEvent::LocalClose => {
                host_stats.upstream_connection_local_close.inc();
                cluster_stats.upstream_connection_local_close.inc();
                if with_active {
                    host_stats
                        .upstream_connection_local_close_with_active_request
                        .inc();
                    cluster_stats
                        .upstream_connection_local_close_with_active_request
                        .inc();
                }
            }
            ConnectionEvent::RemoteClose | ConnectionEvent::OnReadErrClose => {
                host_stats.upstream_connection_remote_close.inc();
                cluster_stats.upstream_connection_remote_close.inc();
                if with_active {
                    host_stats
                        .upstream_connection_remote_close_with_active_request
                        .inc();
                    cluster_stats
                        .upstream_connection_remote_close_with_active_request
                        .inc();
                }
            }
            _ => {}
        }

        let mut clients = self.clients.lock().unwrap();
        if let Some(current) = clients.get(&client.sub_protocol) {
            if Arc::ptr_eq(current, client) {
                clients.remove(&client.sub_protocol);
            }
        }
    }

    fn on_stream_destroy(&self) {
        self.host.stats().upstream_request_active.dec();
        self.host.cluster_info().stats().upstream_request_active.dec();
        self.host
            .cluster_info()
            .resource_manager()
            .requests
            .decrease();
    }

    fn on_stream_reset(&self, client: &Arc<ActiveClient>, reason: StreamResetReason) {
        let host_stats = self.host.stats();
        let cluster_stats = self.host.cluster_info().stats();
        match reason {
            StreamResetReason::ConnectionTermination | StreamResetReason::ConnectionFailed => {
                host_stats.upstream_request_failure_eject.inc();
                cluster_stats.upstream_request_failure_eject.inc();
                client.close_with_active_req.store(true, Ordering::Release);
            }
            StreamResetReason::LocalReset => {
                host_stats.upstream_request_local_reset.inc();
                cluster_stats.upstream_request_local_reset.inc();
            }
            StreamResetReason::RemoteReset => {
                host_stats.upstream_request_remote_reset.inc();
                cluster_stats.upstream_request_remote_reset.inc();
            }
            StreamResetReason::Overflow => {}
        }
    }
}

#[async_trait]
impl ConnectionPool for BoltConnPool {
    fn protocol(&self) -> ProtocolName {
        ProtocolName::Bolt
    }

    async fn check_and_init(&self, ctx: &StreamContext) -> bool {
        let sub = ctx.sub_protocol;
        let client = self
            .clients
            .lock()
            .unwrap()
            .entry(sub)
            .or_insert_with(|| ActiveClient::new(sub))
            .clone();

        if client.state.load(Ordering::Acquire) == CONNECTED {
            return true;
        }

        // Only one dial per sub-protocol is ever in flight.
        if client
            .state
            .compare_exchange(INIT, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(pool) = self.this.upgrade() {
                tokio::spawn(pool.init_client(client));
            }
        }
        false
    }

    fn readiness(&self, ctx: &StreamContext) -> PoolReadiness {
        match self.clients.lock().unwrap().get(&ctx.sub_protocol) {
            None => PoolReadiness::Failed,
            Some(client) => {
                if client.state.load(Ordering::Acquire) == CONNECTED {
                    PoolReadiness::Connected
                } else {
                    PoolReadiness::Connecting
                }
            }
        }
    }

    async fn new_stream(
        &self,
        ctx: &StreamContext,
        receiver: Option<Arc<dyn StreamReceiveListener>>,
        listener: Arc<dyn PoolEventListener>,
    ) {
        // Every stream attempt counts, reachable upstream or not.
        self.host.stats().upstream_request_total.inc();
        self.host.cluster_info().stats().upstream_request_total.inc();

        let client = self.clients.lock().unwrap().get(&ctx.sub_protocol).cloned();
        let Some(client) = client else {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        };
        if client.state.load(Ordering::Acquire) != CONNECTED {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        }
        let sc = client.client.lock().unwrap().clone();
        let Some(sc) = sc else {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        };

        let info = self.host.cluster_info().clone();
        if !info.resource_manager().requests.can_create() {
            listener.on_failure(PoolFailureReason::Overflow, self.host.clone());
            self.host.stats().upstream_request_pending_overflow.inc();
            info.stats().upstream_request_pending_overflow.inc();
            return;
        }

        client.total_stream.fetch_add(1, Ordering::Relaxed);

        let track_reply = receiver.is_some();
        let stream = sc.new_stream(ctx, receiver);
        if track_reply {
            stream.set_event_listener(Arc::new(PoolStreamListener {
                pool: self.this.clone(),
                client: client.clone(),
            }));
            self.host.stats().upstream_request_active.inc();
            info.stats().upstream_request_active.inc();
            info.resource_manager().requests.increase();
        }

        listener.on_ready(stream, self.host.clone());
    }

    async fn close(&self) {
        let clients: Vec<Arc<ActiveClient>> =
            self.clients.lock().unwrap().values().cloned().collect();
        for client in clients {
            let sc = client.client.lock().unwrap().clone();
            if let Some(sc) = sc {
                sc.connection().close(ConnectionEvent::LocalClose);
            }
        }
    }

    fn shutdown(&self) {
        let clients: Vec<Arc<ActiveClient>> =
            self.clients.lock().unwrap().values().cloned().collect();
        for client in clients {
            let keepalive = client.keepalive.lock().unwrap().clone();
            if let Some(keepalive) = keepalive {
                keepalive.stop();
            }
        }
    }
}

struct ClientConnListener {
    pool: Weak<BoltConnPool>,
    client: Arc<ActiveClient>,
}

impl ConnectionEventListener for ClientConnListener {
    fn on_event(&self, event: ConnectionEvent) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connection_event(&self.client, event);
        }
    }
}

struct PoolStreamListener {
    pool: Weak<BoltConnPool>,
    client: Arc<ActiveClient>,
}

impl StreamEventListener for PoolStreamListener {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_stream_reset(&self.client, reason);
        }
    }

    fn on_destroy_stream(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_stream_destroy();
        }
    }
}
