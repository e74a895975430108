use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration consumed from the external config collaborator.
/// Live updates go through the cluster-manager / router-manager APIs; this
/// model is only the initial snapshot plus the shapes those APIs accept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrellisConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
    #[serde(default)]
    pub worker_pool_size: Option<usize>,
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
    #[serde(default = "default_conn_read_timeout_ms")]
    pub conn_read_timeout_ms: u64,
}

fn default_graceful_timeout_ms() -> u64 {
    30_000
}

fn default_conn_read_timeout_ms() -> u64 {
    15_000
}

impl TrellisConfig {
    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file(path: &str) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub address: String,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub downstream_protocol: ProtocolKind,
    pub router_config_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[default]
    Auto,
    Http2,
    Bolt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub lb_type: LbPolicyConfig,
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub subset: Option<SubsetConfig>,
}

fn default_max_connections() -> u64 {
    1024
}

fn default_max_pending_requests() -> u64 {
    1024
}

fn default_max_requests() -> u64 {
    1024
}

fn default_max_retries() -> u64 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LbPolicyConfig {
    #[default]
    RoundRobin,
    Random,
    LeastActiveRequest,
    LeastRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default = "default_host_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_host_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsetConfig {
    /// Each selector is a set of metadata keys requests may match on.
    pub selectors: Vec<Vec<String>>,
    #[serde(default)]
    pub fallback_policy: SubsetFallbackConfig,
    #[serde(default)]
    pub default_subset: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubsetFallbackConfig {
    #[default]
    NoFallback,
    AnyEndpoint,
    DefaultSubset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub router_config_name: String,
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualHostConfig {
    pub name: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub routers: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub route_match: RouteMatchConfig,
    #[serde(default)]
    pub route: Option<RouteActionConfig>,
    #[serde(default)]
    pub direct_response: Option<DirectResponseConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMatchConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderMatcherConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatcherConfig {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteActionConfig {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub weighted_clusters: Vec<WeightedClusterConfig>,
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyConfig>,
    #[serde(default)]
    pub request_headers_to_add: Vec<HeaderValueConfig>,
    #[serde(default)]
    pub request_headers_to_remove: Vec<String>,
    #[serde(default)]
    pub response_headers_to_add: Vec<HeaderValueConfig>,
    #[serde(default)]
    pub response_headers_to_remove: Vec<String>,
    /// Request metadata labels used by subset load balancing.
    #[serde(default)]
    pub metadata_match: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedClusterConfig {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderValueConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub retry_on: bool,
    #[serde(default)]
    pub num_retries: u32,
    #[serde(default)]
    pub per_try_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectResponseConfig {
    pub status: u32,
    #[serde(default)]
    pub body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"{
            "listeners": [
                {
                    "name": "ingress",
                    "address": "127.0.0.1:2045",
                    "proxy": {
                        "downstream_protocol": "Auto",
                        "router_config_name": "egress_router"
                    }
                }
            ],
            "clusters": [
                {
                    "name": "c1",
                    "lb_type": "RoundRobin",
                    "hosts": [{"address": "127.0.0.1:8080"}]
                }
            ],
            "routers": [
                {
                    "router_config_name": "egress_router",
                    "virtual_hosts": [
                        {
                            "name": "all",
                            "domains": ["*"],
                            "routers": [
                                {
                                    "match": {"prefix": "/"},
                                    "route": {"cluster_name": "c1"}
                                }
                            ]
                        }
                    ]
                }
            ]
        }"#;
        let config = TrellisConfig::from_json(raw).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.clusters[0].hosts[0].weight, 1);
        assert_eq!(config.clusters[0].max_requests, 1024);
        assert_eq!(
            config.routers[0].virtual_hosts[0].routers[0]
                .route
                .as_ref()
                .unwrap()
                .cluster_name
                .as_deref(),
            Some("c1")
        );
    }
}
