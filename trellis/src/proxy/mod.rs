mod downstream;
pub mod filters;

pub use downstream::DownStream;

use crate::network::{alloc_conn_id, Connection, ConnectionEvent, RewindIo};
use crate::protocol::{MatchResult, ProtocolName, ProtocolRegistry};
use crate::router::RouterWrapper;
use crate::stream::bolt::BoltStreamConnection;
use crate::stream::http2::serve_server_connection;
use crate::stream::{
    ServerStreamConnectionEventListener, StreamContext, StreamReceiveListener, StreamResetReason,
    StreamSender,
};
use crate::sync::WorkerPool;
use crate::upstream::cluster_manager::ClusterManager;
use crate::upstream::Counter;
use bytes::BytesMut;
use filters::StreamFilterChainFactory;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error};
use trellis_common::config::{ProtocolKind, ProxyConfig};

/// Drain windows applied once the server stops accepting: established
/// connections ride out `graceful_timeout`, then get a stop-connection
/// close; whatever still lingers is forcibly closed after
/// `graceful_timeout + conn_read_timeout` more.
#[derive(Debug, Clone, Copy)]
pub struct GracefulTimings {
    pub graceful_timeout: Duration,
    pub conn_read_timeout: Duration,
}

impl Default for GracefulTimings {
    fn default() -> Self {
        GracefulTimings {
            graceful_timeout: Duration::from_secs(30),
            conn_read_timeout: Duration::from_secs(15),
        }
    }
}

/// Downstream-side proxy stats, one sheet per listener.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub downstream_connection_total: Counter,
    pub downstream_connection_active: Counter,
    pub downstream_connection_destroy: Counter,
    pub downstream_request_total: Counter,
    pub downstream_request_active: Counter,
    pub downstream_request_reset: Counter,
}

/// State shared by every connection a listener accepts: managers, filter
/// factories, stats, and the live set of active streams.
pub struct ProxyShared {
    this: Weak<ProxyShared>,
    pub cluster_manager: Arc<ClusterManager>,
    pub router_wrapper: Option<Arc<RouterWrapper>>,
    pub worker_pool: Arc<WorkerPool>,
    pub registry: Arc<ProtocolRegistry>,
    pub filter_factories: Vec<Arc<dyn StreamFilterChainFactory>>,
    pub stats: Arc<ProxyStats>,
    active_streams: Mutex<Vec<Weak<DownStream>>>,
}

impl ProxyShared {
    fn add_stream(&self, stream: &Arc<DownStream>) {
        let mut streams = self.active_streams.lock().unwrap();
        streams.retain(|w| w.strong_count() > 0);
        streams.push(Arc::downgrade(stream));
    }

    pub(crate) fn remove_stream(&self, stream: &DownStream) {
        let mut streams = self.active_streams.lock().unwrap();
        streams.retain(|w| match w.upgrade() {
            Some(s) => !std::ptr::eq(s.as_ref(), stream),
            None => false,
        });
    }

    fn reset_active_streams(&self, reason: StreamResetReason) {
        let streams: Vec<Arc<DownStream>> = self
            .active_streams
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect();
        for stream in streams {
            stream.on_reset(reason);
        }
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl ServerStreamConnectionEventListener for ProxyShared {
    /// One downstream active stream per detected request, with its filter
    /// chain installed.
    fn new_stream_detect(
        &self,
        ctx: StreamContext,
        sender: Option<Arc<dyn StreamSender>>,
    ) -> Arc<dyn StreamReceiveListener> {
        self.stats.downstream_request_total.inc();
        self.stats.downstream_request_active.inc();

        let filters = self
            .filter_factories
            .iter()
            .flat_map(|f| f.create_filters(&ctx))
            .collect();
        let shared = self
            .this
            .upgrade()
            .expect("proxy outlives its streams");
        let stream = DownStream::new(ctx, shared, sender, filters);
        self.add_stream(&stream);
        stream
    }
}

/// The per-listener read filter: auto-detects the protocol on the first
/// bytes of each accepted connection, then hands the transport to the
/// protocol's server stream connection.
pub struct Proxy {
    shared: Arc<ProxyShared>,
    config: ProxyConfig,
}

impl Proxy {
    /// One proxy per accepted connection; `stats` is the listener's shared
    /// sheet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProxyConfig,
        cluster_manager: Arc<ClusterManager>,
        router_wrapper: Option<Arc<RouterWrapper>>,
        worker_pool: Arc<WorkerPool>,
        registry: Arc<ProtocolRegistry>,
        filter_factories: Vec<Arc<dyn StreamFilterChainFactory>>,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        if router_wrapper.is_none() {
            error!(
                "router config {} does not exist",
                config.router_config_name
            );
        }
        let shared = Arc::new_cyclic(|this| ProxyShared {
            this: this.clone(),
            cluster_manager,
            router_wrapper,
            worker_pool,
            registry,
            filter_factories,
            stats,
            active_streams: Mutex::new(Vec::new()),
        });
        Arc::new(Proxy { shared, config })
    }

    pub fn shared(&self) -> &Arc<ProxyShared> {
        &self.shared
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.shared.stats
    }

    /// Drives one accepted downstream connection to completion. Returns
    /// only once the transport is gone, so the caller's drain guard tracks
    /// the real connection lifetime; `shutdown` starts the staged close.
    pub async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        mut shutdown: broadcast::Receiver<()>,
        timings: GracefulTimings,
    ) {
        self.shared.stats.downstream_connection_total.inc();
        self.shared.stats.downstream_connection_active.inc();

        let mut initial = BytesMut::new();
        let protocol = match self.config.downstream_protocol {
            ProtocolKind::Bolt => Some(ProtocolName::Bolt),
            ProtocolKind::Http2 => Some(ProtocolName::Http2),
            ProtocolKind::Auto => {
                // EAGAIN keeps buffering, FAILED closes with a read error.
                loop {
                    match self.shared.registry.match_protocol(&initial) {
                        MatchResult::Matched(protocol) => break Some(protocol),
                        MatchResult::Failed => {
                            let head = &initial[..initial.len().min(10)];
                            error!("protocol auto-detect failed, magic: {:?}", head);
                            break None;
                        }
                        MatchResult::Again => match stream.read_buf(&mut initial).await {
                            Ok(0) | Err(_) => break None,
                            Ok(_) => {}
                        },
                    }
                }
            }
        };

        let Some(protocol) = protocol else {
            // OnReadErrClose: nothing decodable ever arrived.
            self.connection_destroyed();
            return;
        };
        debug!("protocol auto-detect: {}", protocol);

        match protocol {
            ProtocolName::Bolt => {
                let conn = Connection::new(stream, Some(initial.freeze()));
                let _sc = BoltStreamConnection::new_server(
                    conn.clone(),
                    self.shared.clone(),
                    self.shared.worker_pool.clone(),
                );
                // The stream connection owns the read loop; its close
                // listener resets in-flight streams. Hold here until the
                // transport actually dies, staging the close on shutdown.
                tokio::select! {
                    _ = conn.closed() => {}
                    _ = shutdown.recv() => {
                        tokio::select! {
                            _ = conn.closed() => {}
                            _ = tokio::time::sleep(timings.graceful_timeout) => {
                                conn.close(ConnectionEvent::LocalClose);
                                let hard = timings.graceful_timeout + timings.conn_read_timeout;
                                if tokio::time::timeout(hard, conn.closed()).await.is_err() {
                                    debug!("conn {} forced close on shutdown", conn.id());
                                    conn.force_close();
                                }
                            }
                        }
                    }
                }
                conn.closed().await;
                self.connection_destroyed();
            }
            ProtocolName::Http2 => {
                let io = RewindIo::new(initial.freeze(), stream);
                let conn_id = alloc_conn_id();
                let serve = serve_server_connection(
                    io,
                    conn_id,
                    self.shared.clone(),
                    self.shared.worker_pool.clone(),
                );
                tokio::pin!(serve);
                tokio::select! {
                    result = &mut serve => {
                        if let Err(e) = result {
                            debug!("http2 connection ended: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        // In-flight streams get the full drain window, then
                        // the connection task is abandoned outright.
                        let hard = timings.graceful_timeout * 2 + timings.conn_read_timeout;
                        if tokio::time::timeout(hard, &mut serve).await.is_err() {
                            debug!("conn {} forced close on shutdown", conn_id);
                        }
                    }
                }
                // Transport gone: every still-active stream terminates.
                self.shared
                    .reset_active_streams(StreamResetReason::ConnectionTermination);
                self.connection_destroyed();
            }
        }
    }

    fn connection_destroyed(&self) {
        self.shared.stats.downstream_connection_active.dec();
        self.shared.stats.downstream_connection_destroy.inc();
    }
}
