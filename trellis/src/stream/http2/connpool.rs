use super::stream::Http2ClientStreamConnection;
use crate::protocol::ProtocolName;
use crate::stream::{
    ConnectionPool, PoolEventListener, PoolFailureReason, PoolReadiness, StreamContext,
    StreamEventListener, StreamReceiveListener, StreamResetReason,
};
use crate::network::ConnectionEvent;
use crate::upstream::Host;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

const INIT: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Per upstream-host pool over one multiplexed HTTP/2 connection; h2
/// streams are cheap, so a single active client carries all requests.
pub struct Http2ConnPool {
    this: Weak<Http2ConnPool>,
    host: Arc<Host>,
    client: Mutex<Option<Arc<ActiveH2Client>>>,
}

struct ActiveH2Client {
    state: AtomicU8,
    conn: Mutex<Option<Arc<Http2ClientStreamConnection>>>,
    close_with_active_req: AtomicBool,
    closed_by_pool: AtomicBool,
}

impl ActiveH2Client {
    fn new() -> Arc<Self> {
        Arc::new(ActiveH2Client {
            state: AtomicU8::new(INIT),
            conn: Mutex::new(None),
            close_with_active_req: AtomicBool::new(false),
            closed_by_pool: AtomicBool::new(false),
        })
    }
}

impl Http2ConnPool {
    pub fn new(host: Arc<Host>) -> Arc<Self> {
        Arc::new_cyclic(|this| Http2ConnPool {
            this: this.clone(),
            host,
            client: Mutex::new(None),
        })
    }

    async fn init_client(self: Arc<Self>, client: Arc<ActiveH2Client>) {
        debug!("pool init http2 host {}", self.host.address());
        let info = self.host.cluster_info().clone();
        let pool = self.this.clone();
        let closed_client = client.clone();
        let on_closed = Box::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.on_client_closed(&closed_client);
            }
        });

        match Http2ClientStreamConnection::connect(
            self.host.address(),
            info.connect_timeout(),
            on_closed,
        )
        .await
        {
            Ok(conn) => {
                *client.conn.lock().unwrap() = Some(conn);
                self.host.stats().upstream_connection_total.inc();
                self.host.stats().upstream_connection_active.inc();
                info.stats().upstream_connection_total.inc();
                info.stats().upstream_connection_active.inc();
                client.state.store(CONNECTED, Ordering::Release);
            }
            Err(event) => {
                self.host.stats().upstream_connection_con_fail.inc();
                info.stats().upstream_connection_con_fail.inc();
                if event == ConnectionEvent::ConnectTimeout {
                    self.host.stats().upstream_request_timeout.inc();
                    info.stats().upstream_request_timeout.inc();
                }
                self.evict(&client);
            }
        }
    }

    fn on_client_closed(&self, client: &Arc<ActiveH2Client>) {
        let host_stats = self.host.stats();
        let cluster_stats = self.host.cluster_info().stats();
        host_stats.upstream_connection_close.inc();
        host_stats.upstream_connection_active.dec();
        cluster_stats.upstream_connection_close.inc();
        cluster_stats.upstream_connection_active.dec();

        let with_active = client.close_with_active_req.load(Ordering::Acquire);
        if client.closed_by_pool.load(Ordering::Acquire) {
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
        } else {
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
        self.evict(client);
    }

    fn evict(&self, client: &Arc<ActiveH2Client>) {
        let mut current = self.client.lock().unwrap();
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(existing, client) {
                *current = None;
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

    fn on_stream_reset(&self, client: &Arc<ActiveH2Client>, reason: StreamResetReason) {
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
impl ConnectionPool for Http2ConnPool {
    fn protocol(&self) -> ProtocolName {
        ProtocolName::Http2
    }

    async fn check_and_init(&self, _ctx: &StreamContext) -> bool {
        let client = self
            .client
            .lock()
            .unwrap()
            .get_or_insert_with(ActiveH2Client::new)
            .clone();

        if client.state.load(Ordering::Acquire) == CONNECTED {
            return true;
        }
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

    fn readiness(&self, _ctx: &StreamContext) -> PoolReadiness {
        match self.client.lock().unwrap().as_ref() {
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

        let client = self.client.lock().unwrap().clone();
        let Some(client) = client else {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        };
        if client.state.load(Ordering::Acquire) != CONNECTED {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        }
        let conn = client.conn.lock().unwrap().clone();
        let Some(conn) = conn else {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        };
        if conn.is_closed() {
            listener.on_failure(PoolFailureReason::ConnectionFailure, self.host.clone());
            return;
        }

        let info = self.host.cluster_info().clone();
        if !info.resource_manager().requests.can_create() {
            listener.on_failure(PoolFailureReason::Overflow, self.host.clone());
            self.host.stats().upstream_request_pending_overflow.inc();
            info.stats().upstream_request_pending_overflow.inc();
            return;
        }

        let track_reply = receiver.is_some();
        let stream = conn.new_stream(ctx, receiver);
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
        let client = self.client.lock().unwrap().clone();
        if let Some(client) = client {
            client.closed_by_pool.store(true, Ordering::Release);
            // Dropping the request handle lets the connection task wind
            // down once in-flight streams finish.
            *client.conn.lock().unwrap() = None;
            self.evict(&client);
        }
    }

    fn shutdown(&self) {
        // No protocol-level keep-alive to stop for HTTP/2.
    }
}

struct PoolStreamListener {
    pool: Weak<Http2ConnPool>,
    client: Arc<ActiveH2Client>,
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
