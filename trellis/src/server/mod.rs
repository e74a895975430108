use crate::protocol::ProtocolRegistry;
use crate::proxy::filters::StreamFilterChainFactory;
use crate::proxy::{GracefulTimings, Proxy, ProxyStats};
use crate::router::RouterManager;
use crate::sync::WorkerPool;
use crate::upstream::cluster_manager::ClusterManager;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};
use trellis_common::config::{ListenerConfig, TrellisConfig};

/// Root value replacing process-global singletons: cluster manager, router
/// manager, worker pool and the protocol registry, threaded through
/// constructors. Tests build private runtimes for isolation.
pub struct Runtime {
    pub cluster_manager: Arc<ClusterManager>,
    pub router_manager: Arc<RouterManager>,
    pub worker_pool: Arc<WorkerPool>,
    pub registry: Arc<ProtocolRegistry>,
    filter_factories: RwLock<Vec<Arc<dyn StreamFilterChainFactory>>>,
}

impl Runtime {
    pub fn new(config: &TrellisConfig) -> Arc<Self> {
        let cluster_manager = ClusterManager::new();
        for cluster in &config.clusters {
            cluster_manager.add_or_update_primary_cluster(cluster);
        }
        let router_manager = RouterManager::new();
        for router in &config.routers {
            if let Err(e) = router_manager.add_or_update_router(router) {
                error!(
                    "router config {} rejected: {}",
                    router.router_config_name, e
                );
            }
        }
        let worker_pool = match config.worker_pool_size {
            Some(size) => WorkerPool::new(size),
            None => WorkerPool::with_default_size(),
        };
        Arc::new(Runtime {
            cluster_manager,
            router_manager,
            worker_pool,
            registry: Arc::new(ProtocolRegistry::with_defaults()),
            filter_factories: RwLock::new(Vec::new()),
        })
    }

    pub fn add_stream_filter_factory(&self, factory: Arc<dyn StreamFilterChainFactory>) {
        self.filter_factories.write().unwrap().push(factory);
    }

    pub fn filter_factories(&self) -> Vec<Arc<dyn StreamFilterChainFactory>> {
        self.filter_factories.read().unwrap().clone()
    }
}

pub struct Server {
    config: TrellisConfig,
    runtime: Arc<Runtime>,
}

impl Server {
    pub fn new(config: TrellisConfig) -> Self {
        let runtime = Runtime::new(&config);
        Server { config, runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Binds every configured listener and serves until interrupted, then
    /// drains: accepting stops at once; established connections ride out
    /// the grace window, get a stop-connection close, and are forcibly
    /// closed if still around after twice the grace plus the read timeout.
    pub async fn run(self) -> crate::Result<()> {
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let notify_shutdown = broadcast::channel::<()>(1).0;
        let timings = GracefulTimings {
            graceful_timeout: Duration::from_millis(self.config.graceful_timeout_ms),
            conn_read_timeout: Duration::from_millis(self.config.conn_read_timeout_ms),
        };

        for listener_config in self.config.listeners.clone() {
            tokio::spawn(Self::monitor(
                listener_config,
                self.runtime.clone(),
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
                timings,
            ));
        }
        drop(shutdown_complete_tx);

        signal::ctrl_c().await?;
        info!("trellis server shutting down");
        let _ = notify_shutdown.send(());

        // Connection tasks hold drain guards for their whole lifetime and
        // enforce the staged close themselves; wait out the hard deadline.
        let grace = 2 * timings.graceful_timeout + timings.conn_read_timeout;
        let _ = tokio::time::timeout(grace + Duration::from_secs(1), async {
            let _ = shutdown_complete_rx.recv().await;
        })
        .await;
        self.runtime.cluster_manager.close_all_pools().await;
        info!("trellis server shut");
        Ok(())
    }

    async fn monitor(
        config: ListenerConfig,
        runtime: Arc<Runtime>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        timings: GracefulTimings,
    ) -> crate::Result<()> {
        let listener = TcpListener::bind(&config.address).await?;
        info!("listener {} bound on {}", config.name, config.address);
        let stats = Arc::new(ProxyStats::default());
        let router_wrapper = runtime
            .router_manager
            .get_router_wrapper(&config.proxy.router_config_name);
        let mut shutdown = notify_shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    // Stop accepting; in-flight connections keep their
                    // grace period through the drain channel.
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("listener {} accepted {}", config.name, peer);
                    let proxy = Proxy::new(
                        config.proxy.clone(),
                        runtime.cluster_manager.clone(),
                        router_wrapper.clone(),
                        runtime.worker_pool.clone(),
                        runtime.registry.clone(),
                        runtime.filter_factories(),
                        stats.clone(),
                    );
                    let conn_shutdown = notify_shutdown.subscribe();
                    let drain = shutdown_complete_tx.clone();
                    tokio::spawn(async move {
                        proxy.handle_connection(stream, conn_shutdown, timings).await;
                        drop(drain);
                    });
                }
                Err(e) => error!("listener {} accept error: {}", config.name, e),
            }
        }
    }
}
