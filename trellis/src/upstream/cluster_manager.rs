use super::{Cluster, ClusterSnapshot, Host};
use crate::protocol::ProtocolName;
use crate::stream::bolt::connpool::BoltConnPool;
use crate::stream::http2::connpool::Http2ConnPool;
use crate::stream::ConnectionPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;
use trellis_common::config::{ClusterConfig, HostConfig};

/// Registry of clusters and their host sets. Updates publish immutable
/// snapshots, so in-flight lookups keep using what they captured. Also owns
/// the per-(host, protocol) connection pools so pools outlive single
/// requests.
pub struct ClusterManager {
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    pools: Mutex<HashMap<(String, ProtocolName), Arc<dyn ConnectionPool>>>,
}

impl ClusterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(ClusterManager {
            clusters: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent by name: the new config replaces the old cluster wholesale.
    pub fn add_or_update_primary_cluster(&self, config: &ClusterConfig) {
        let cluster = Cluster::new(config);
        info!(
            "cluster {} updated, {} hosts",
            config.name,
            config.hosts.len()
        );
        self.clusters
            .write()
            .unwrap()
            .insert(config.name.clone(), cluster);
    }

    pub fn update_cluster_hosts(
        &self,
        name: &str,
        hosts: &[HostConfig],
    ) -> trellis_common::TrellisResult<()> {
        let clusters = self.clusters.read().unwrap();
        let cluster = clusters
            .get(name)
            .ok_or_else(|| trellis_common::error::TrellisError::Other(format!(
                "cluster {} not found",
                name
            )))?;
        cluster.update_hosts(hosts);
        Ok(())
    }

    pub fn get_cluster_snapshot(&self, name: &str) -> Option<ClusterSnapshot> {
        self.clusters.read().unwrap().get(name).map(|c| c.snapshot())
    }

    pub fn remove_primary_cluster(&self, name: &str) {
        let removed = self.clusters.write().unwrap().remove(name);
        if let Some(cluster) = removed {
            let addrs: Vec<String> = cluster
                .snapshot()
                .host_set
                .hosts()
                .iter()
                .map(|h| h.address().to_owned())
                .collect();
            let mut pools = self.pools.lock().unwrap();
            pools.retain(|(addr, _), _| !addrs.contains(addr));
        }
    }

    /// Lazily creates the pool for one upstream host and protocol.
    pub fn conn_pool_for_host(
        &self,
        host: &Arc<Host>,
        protocol: ProtocolName,
    ) -> Arc<dyn ConnectionPool> {
        let key = (host.address().to_owned(), protocol);
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(key)
            .or_insert_with(|| match protocol {
                ProtocolName::Bolt => BoltConnPool::new(host.clone()),
                ProtocolName::Http2 => Http2ConnPool::new(host.clone()),
            })
            .clone()
    }

    pub async fn close_all_pools(&self) {
        let pools: Vec<Arc<dyn ConnectionPool>> =
            self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            pool.shutdown();
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, addrs: &[&str]) -> ClusterConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "hosts": addrs
                .iter()
                .map(|a| serde_json::json!({"address": a}))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn add_update_remove() {
        let cm = ClusterManager::new();
        cm.add_or_update_primary_cluster(&config("c1", &["127.0.0.1:1"]));
        assert!(cm.get_cluster_snapshot("c1").is_some());

        cm.update_cluster_hosts("c1", &[])
            .expect("cluster must exist");
        assert_eq!(
            cm.get_cluster_snapshot("c1").unwrap().host_set.hosts().len(),
            0
        );

        cm.remove_primary_cluster("c1");
        assert!(cm.get_cluster_snapshot("c1").is_none());
        assert!(cm.update_cluster_hosts("c1", &[]).is_err());
    }

    /// Applying the same config twice yields an equivalent snapshot.
    #[test]
    fn add_is_idempotent() {
        let cm = ClusterManager::new();
        let cfg = config("c1", &["127.0.0.1:1", "127.0.0.1:2"]);
        cm.add_or_update_primary_cluster(&cfg);
        let first = cm.get_cluster_snapshot("c1").unwrap();
        cm.add_or_update_primary_cluster(&cfg);
        let second = cm.get_cluster_snapshot("c1").unwrap();

        assert_eq!(first.info.name(), second.info.name());
        assert_eq!(first.info.lb_type(), second.info.lb_type());
        let addrs = |s: &ClusterSnapshot| {
            s.host_set
                .hosts()
                .iter()
                .map(|h| (h.address().to_owned(), h.weight()))
                .collect::<Vec<_>>()
        };
        assert_eq!(addrs(&first), addrs(&second));
    }

    #[test]
    fn stale_snapshot_survives_update() {
        let cm = ClusterManager::new();
        cm.add_or_update_primary_cluster(&config("c1", &["127.0.0.1:1"]));
        let snapshot = cm.get_cluster_snapshot("c1").unwrap();
        cm.add_or_update_primary_cluster(&config("c1", &["127.0.0.1:9"]));
        assert_eq!(snapshot.host_set.hosts()[0].address(), "127.0.0.1:1");
    }
}
