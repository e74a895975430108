pub mod cluster_manager;
pub mod loadbalancer;

use loadbalancer::{new_load_balancer, LoadBalancer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use trellis_common::config::{ClusterConfig, HostConfig, LbPolicyConfig, SubsetConfig};

pub const MIN_HOST_WEIGHT: u32 = 1;
pub const MAX_HOST_WEIGHT: u32 = 128;

/// Monotonic-per-request counter: incremented at admission, decremented
/// exactly once at destruction.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Shared stat sheet; one per host and one per cluster, bumped together.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub upstream_connection_total: Counter,
    pub upstream_connection_active: Counter,
    pub upstream_connection_close: Counter,
    pub upstream_connection_local_close: Counter,
    pub upstream_connection_remote_close: Counter,
    pub upstream_connection_local_close_with_active_request: Counter,
    pub upstream_connection_remote_close_with_active_request: Counter,
    pub upstream_connection_con_fail: Counter,
    pub upstream_request_total: Counter,
    pub upstream_request_active: Counter,
    pub upstream_request_timeout: Counter,
    pub upstream_request_failure_eject: Counter,
    pub upstream_request_pending_overflow: Counter,
    pub upstream_request_local_reset: Counter,
    pub upstream_request_remote_reset: Counter,
    pub upstream_request_retry: Counter,
}

/// One circuit-breaker gauge. `can_create` admits while below the
/// threshold; admission and release are the caller's responsibility.
#[derive(Debug)]
pub struct ResourceLimit {
    max: u64,
    current: AtomicI64,
}

impl ResourceLimit {
    pub fn new(max: u64) -> Self {
        ResourceLimit {
            max,
            current: AtomicI64::new(0),
        }
    }

    pub fn can_create(&self) -> bool {
        (self.current.load(Ordering::Relaxed) as u64) < self.max
    }

    pub fn increase(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrease(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

#[derive(Debug)]
pub struct ResourceManager {
    pub connections: ResourceLimit,
    pub pending_requests: ResourceLimit,
    pub requests: ResourceLimit,
    pub retries: ResourceLimit,
}

impl ResourceManager {
    fn from_config(config: &ClusterConfig) -> Self {
        ResourceManager {
            connections: ResourceLimit::new(config.max_connections),
            pending_requests: ResourceLimit::new(config.max_pending_requests),
            requests: ResourceLimit::new(config.max_requests),
            retries: ResourceLimit::new(config.max_retries),
        }
    }
}

/// Immutable per-cluster facts shared by hosts, pools and snapshots.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    lb_type: LbPolicyConfig,
    connect_timeout: Duration,
    stats: UpstreamStats,
    resource_manager: ResourceManager,
    subset: Option<SubsetConfig>,
}

impl ClusterInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lb_type(&self) -> LbPolicyConfig {
        self.lb_type
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn stats(&self) -> &UpstreamStats {
        &self.stats
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn subset(&self) -> Option<&SubsetConfig> {
        self.subset.as_ref()
    }
}

/// An upstream endpoint. The owning cluster is referenced by name only;
/// callers refetch through the cluster manager to tolerate live updates.
#[derive(Debug)]
pub struct Host {
    address: String,
    weight: u32,
    healthy: AtomicBool,
    stats: UpstreamStats,
    metadata: HashMap<String, String>,
    cluster_info: Arc<ClusterInfo>,
}

impl Host {
    pub fn new(config: &HostConfig, cluster_info: Arc<ClusterInfo>) -> Arc<Self> {
        Arc::new(Host {
            address: config.address.clone(),
            weight: config.weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT),
            healthy: AtomicBool::new(true),
            stats: UpstreamStats::default(),
            metadata: config.metadata.clone(),
            cluster_info,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &UpstreamStats {
        &self.stats
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.cluster_info
    }

    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.metadata.get(k).map(|m| m == v).unwrap_or(false))
    }
}

/// Immutable host list plus its healthy-host derivative, recomputed
/// synchronously before a new snapshot is published.
#[derive(Debug)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
    healthy_hosts: Vec<Arc<Host>>,
}

impl HostSet {
    pub fn new(hosts: Vec<Arc<Host>>) -> Arc<Self> {
        let healthy_hosts = hosts.iter().filter(|h| h.is_healthy()).cloned().collect();
        Arc::new(HostSet {
            hosts,
            healthy_hosts,
        })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn healthy_hosts(&self) -> &[Arc<Host>] {
        &self.healthy_hosts
    }
}

/// A named host set with its load-balancing policy. Hosts and the balancer
/// are replaced together so in-flight lookups keep a coherent snapshot.
pub struct Cluster {
    info: Arc<ClusterInfo>,
    host_set: RwLock<Arc<HostSet>>,
    lb: RwLock<Arc<dyn LoadBalancer>>,
}

impl Cluster {
    pub fn new(config: &ClusterConfig) -> Arc<Self> {
        let info = Arc::new(ClusterInfo {
            name: config.name.clone(),
            lb_type: config.lb_type,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            stats: UpstreamStats::default(),
            resource_manager: ResourceManager::from_config(config),
            subset: config.subset.clone(),
        });
        let hosts = config
            .hosts
            .iter()
            .map(|h| Host::new(h, info.clone()))
            .collect();
        let host_set = HostSet::new(hosts);
        let lb = new_load_balancer(&info, host_set.clone());
        Arc::new(Cluster {
            info,
            host_set: RwLock::new(host_set),
            lb: RwLock::new(lb),
        })
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn update_hosts(&self, configs: &[HostConfig]) {
        let hosts = configs
            .iter()
            .map(|h| Host::new(h, self.info.clone()))
            .collect();
        let host_set = HostSet::new(hosts);
        let lb = new_load_balancer(&self.info, host_set.clone());
        // Host set and balancer swap under one lock ordering so a snapshot
        // never pairs a balancer with a foreign host list.
        let mut hs = self.host_set.write().unwrap();
        let mut lbw = self.lb.write().unwrap();
        *hs = host_set;
        *lbw = lb;
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let host_set = self.host_set.read().unwrap().clone();
        let lb = self.lb.read().unwrap().clone();
        ClusterSnapshot {
            info: self.info.clone(),
            host_set,
            lb,
        }
    }
}

/// What an in-flight request holds: stable for the duration of its host
/// selection regardless of concurrent updates.
#[derive(Clone)]
pub struct ClusterSnapshot {
    pub info: Arc<ClusterInfo>,
    pub host_set: Arc<HostSet>,
    pub lb: Arc<dyn LoadBalancer>,
}

impl ClusterSnapshot {
    pub fn choose_host(&self, ctx: &loadbalancer::LbContext) -> Option<Arc<Host>> {
        self.lb.choose_host(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_config(hosts: Vec<(&str, u32)>) -> ClusterConfig {
        serde_json::from_value(serde_json::json!({
            "name": "c1",
            "hosts": hosts
                .into_iter()
                .map(|(addr, weight)| serde_json::json!({"address": addr, "weight": weight}))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn host_weight_is_clamped() {
        let cluster = Cluster::new(&cluster_config(vec![("127.0.0.1:1", 0), ("127.0.0.1:2", 9000)]));
        let snapshot = cluster.snapshot();
        assert_eq!(snapshot.host_set.hosts()[0].weight(), MIN_HOST_WEIGHT);
        assert_eq!(snapshot.host_set.hosts()[1].weight(), MAX_HOST_WEIGHT);
    }

    #[test]
    fn snapshot_is_stable_across_updates() {
        let cluster = Cluster::new(&cluster_config(vec![("127.0.0.1:1", 1)]));
        let before = cluster.snapshot();
        cluster.update_hosts(&[]);
        assert_eq!(before.host_set.hosts().len(), 1);
        assert_eq!(cluster.snapshot().host_set.hosts().len(), 0);
    }

    #[test]
    fn resource_limit_gates_admission() {
        let limit = ResourceLimit::new(1);
        assert!(limit.can_create());
        limit.increase();
        assert!(!limit.can_create());
        limit.decrease();
        assert!(limit.can_create());
        assert_eq!(limit.count(), 0);
    }
}
