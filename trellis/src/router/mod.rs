use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use trellis_common::config::{
    HeaderMatcherConfig, RouteActionConfig, RouteConfig, RouteMatchConfig, RouterConfig,
    VirtualHostConfig,
};
use trellis_common::error::TrellisError;
use trellis_common::headers::{HeaderBag, HEADER_HOST, HEADER_PATH};
use trellis_common::TrellisResult;

/// Named collections of virtual hosts; lookups go through a wrapper so a
/// live config update swaps the routing table under in-flight proxies.
pub struct RouterManager {
    routers: RwLock<HashMap<String, Arc<RouterWrapper>>>,
}

impl RouterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(RouterManager {
            routers: RwLock::new(HashMap::new()),
        })
    }

    pub fn add_or_update_router(&self, config: &RouterConfig) -> TrellisResult<()> {
        let routers = Arc::new(Routers::from_config(config)?);
        let mut table = self.routers.write().unwrap();
        match table.get(&config.router_config_name) {
            Some(wrapper) => wrapper.swap(routers),
            None => {
                table.insert(
                    config.router_config_name.clone(),
                    Arc::new(RouterWrapper {
                        name: config.router_config_name.clone(),
                        inner: RwLock::new(routers),
                    }),
                );
            }
        }
        Ok(())
    }

    pub fn get_router_wrapper(&self, name: &str) -> Option<Arc<RouterWrapper>> {
        self.routers.read().unwrap().get(name).cloned()
    }
}

/// Stable handle the proxy keeps; always points at the latest table.
pub struct RouterWrapper {
    name: String,
    inner: RwLock<Arc<Routers>>,
}

impl RouterWrapper {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routers(&self) -> Arc<Routers> {
        self.inner.read().unwrap().clone()
    }

    fn swap(&self, routers: Arc<Routers>) {
        *self.inner.write().unwrap() = routers;
    }
}

/// One immutable routing table snapshot.
pub struct Routers {
    virtual_hosts: Vec<Arc<VirtualHost>>,
    exact: HashMap<String, usize>,
    /// (`pattern`, index); patterns keep their `*`, longest pattern wins.
    wildcard: Vec<(String, usize)>,
    catch_all: Option<usize>,
}

impl Routers {
    pub fn from_config(config: &RouterConfig) -> TrellisResult<Self> {
        let mut virtual_hosts = Vec::new();
        let mut exact = HashMap::new();
        let mut wildcard: Vec<(String, usize)> = Vec::new();
        let mut catch_all = None;

        for vh_config in &config.virtual_hosts {
            let idx = virtual_hosts.len();
            virtual_hosts.push(Arc::new(VirtualHost::from_config(vh_config)?));
            for domain in &vh_config.domains {
                if domain == "*" {
                    catch_all.get_or_insert(idx);
                } else if domain.starts_with('*') || domain.ends_with('*') {
                    wildcard.push((domain.clone(), idx));
                } else {
                    exact.insert(domain.to_ascii_lowercase(), idx);
                }
            }
        }
        wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Routers {
            virtual_hosts,
            exact,
            wildcard,
            catch_all,
        })
    }

    /// Exact beats wildcard beats catch-all; among wildcards the longest
    /// (most specific) pattern wins.
    pub fn match_virtual_host(&self, host: &str) -> Option<&Arc<VirtualHost>> {
        let host = host.to_ascii_lowercase();
        if let Some(&idx) = self.exact.get(&host) {
            return Some(&self.virtual_hosts[idx]);
        }
        for (pattern, idx) in &self.wildcard {
            let matched = if let Some(suffix) = pattern.strip_prefix('*') {
                host.ends_with(&suffix.to_ascii_lowercase())
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                host.starts_with(&prefix.to_ascii_lowercase())
            } else {
                false
            };
            if matched {
                return Some(&self.virtual_hosts[*idx]);
            }
        }
        self.catch_all.map(|idx| &self.virtual_hosts[idx])
    }

    /// Full lookup: virtual host by the request's host, then the first
    /// route whose matcher is satisfied, in declared order.
    pub fn match_route(&self, headers: &HeaderBag) -> Option<Arc<Route>> {
        let host = headers.get(HEADER_HOST).unwrap_or("");
        let vh = self.match_virtual_host(host)?;
        let route = vh.match_route(headers);
        if route.is_none() {
            debug!("no route for host {}", host);
        }
        route
    }
}

pub struct VirtualHost {
    name: String,
    routes: Vec<Arc<Route>>,
}

impl VirtualHost {
    fn from_config(config: &VirtualHostConfig) -> TrellisResult<Self> {
        let routes = config
            .routers
            .iter()
            .map(Route::from_config)
            .collect::<TrellisResult<Vec<_>>>()?
            .into_iter()
            .map(Arc::new)
            .collect();
        Ok(VirtualHost {
            name: config.name.clone(),
            routes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_route(&self, headers: &HeaderBag) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matches(headers)).cloned()
    }
}

enum PathMatcher {
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

struct HeaderMatcher {
    name: String,
    value: HeaderValueMatcher,
}

enum HeaderValueMatcher {
    Exact(String),
    Regex(Regex),
}

impl HeaderMatcher {
    fn from_config(config: &HeaderMatcherConfig) -> TrellisResult<Self> {
        let value = if config.regex {
            HeaderValueMatcher::Regex(
                Regex::new(&config.value)
                    .map_err(|e| TrellisError::Other(format!("header matcher regex: {}", e)))?,
            )
        } else {
            HeaderValueMatcher::Exact(config.value.clone())
        };
        Ok(HeaderMatcher {
            name: config.name.clone(),
            value,
        })
    }

    fn matches(&self, headers: &HeaderBag) -> bool {
        let Some(actual) = headers.get(&self.name) else {
            return false;
        };
        match &self.value {
            HeaderValueMatcher::Exact(expected) => actual == expected,
            HeaderValueMatcher::Regex(regex) => regex.is_match(actual),
        }
    }
}

pub struct Route {
    path: PathMatcher,
    headers: Vec<HeaderMatcher>,
    action: Option<RouteAction>,
    direct_response: Option<DirectResponse>,
}

#[derive(Debug, Clone)]
pub struct DirectResponse {
    pub status: u32,
    pub body: Option<String>,
}

impl Route {
    fn from_config(config: &RouteConfig) -> TrellisResult<Self> {
        let path = match (&config.route_match.path, &config.route_match.regex) {
            (Some(path), _) => PathMatcher::Exact(path.clone()),
            (None, Some(pattern)) => PathMatcher::Regex(
                Regex::new(pattern)
                    .map_err(|e| TrellisError::Other(format!("path matcher regex: {}", e)))?,
            ),
            (None, None) => {
                PathMatcher::Prefix(config.route_match.prefix.clone().unwrap_or_default())
            }
        };
        let headers = config
            .route_match
            .headers
            .iter()
            .map(HeaderMatcher::from_config)
            .collect::<TrellisResult<Vec<_>>>()?;
        let action = config.route.as_ref().map(RouteAction::from_config);
        let direct_response = config.direct_response.as_ref().map(|d| DirectResponse {
            status: d.status,
            body: d.body.clone(),
        });
        Ok(Route {
            path,
            headers,
            action,
            direct_response,
        })
    }

    pub fn matches(&self, headers: &HeaderBag) -> bool {
        let path = headers.get(HEADER_PATH).unwrap_or("/");
        let path_ok = match &self.path {
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Exact(exact) => path == exact,
            PathMatcher::Regex(regex) => regex.is_match(path),
        };
        path_ok && self.headers.iter().all(|m| m.matches(headers))
    }

    pub fn action(&self) -> Option<&RouteAction> {
        self.action.as_ref()
    }

    pub fn direct_response(&self) -> Option<&DirectResponse> {
        self.direct_response.as_ref()
    }

    /// Request-side mutations: header add/remove and prefix rewrite.
    pub fn apply_request_mutations(&self, headers: &mut HeaderBag) {
        let Some(action) = &self.action else {
            return;
        };
        if let (Some(rewrite), PathMatcher::Prefix(prefix)) = (&action.prefix_rewrite, &self.path)
        {
            if let Some(path) = headers.get(HEADER_PATH).map(|p| p.to_owned()) {
                if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                    headers.set(HEADER_PATH, format!("{}{}", rewrite, rest));
                }
            }
        }
        for key in &action.request_headers_to_remove {
            headers.del(key);
        }
        for (key, value) in &action.request_headers_to_add {
            headers.set(key, value.clone());
        }
    }

    pub fn apply_response_mutations(&self, headers: &mut HeaderBag) {
        let Some(action) = &self.action else {
            return;
        };
        for key in &action.response_headers_to_remove {
            headers.del(key);
        }
        for (key, value) in &action.response_headers_to_add {
            headers.set(key, value.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClusterSpec {
    Name(String),
    Weighted(Vec<(String, u32)>),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_on: bool,
    pub num_retries: u32,
    pub per_try_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RouteAction {
    cluster: ClusterSpec,
    pub prefix_rewrite: Option<String>,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub request_headers_to_add: Vec<(String, String)>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<(String, String)>,
    pub response_headers_to_remove: Vec<String>,
    pub metadata_match: HashMap<String, String>,
}

impl RouteAction {
    fn from_config(config: &RouteActionConfig) -> Self {
        let cluster = if !config.weighted_clusters.is_empty() {
            ClusterSpec::Weighted(
                config
                    .weighted_clusters
                    .iter()
                    .map(|w| (w.name.clone(), w.weight.max(1)))
                    .collect(),
            )
        } else {
            ClusterSpec::Name(config.cluster_name.clone().unwrap_or_default())
        };
        RouteAction {
            cluster,
            prefix_rewrite: config.prefix_rewrite.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
            retry_policy: config.retry_policy.map(|r| RetryPolicy {
                retry_on: r.retry_on,
                num_retries: r.num_retries,
                per_try_timeout: if r.per_try_timeout_ms > 0 {
                    Some(Duration::from_millis(r.per_try_timeout_ms))
                } else {
                    None
                },
            }),
            request_headers_to_add: config
                .request_headers_to_add
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect(),
            request_headers_to_remove: config.request_headers_to_remove.clone(),
            response_headers_to_add: config
                .response_headers_to_add
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect(),
            response_headers_to_remove: config.response_headers_to_remove.clone(),
            metadata_match: config.metadata_match.clone(),
        }
    }

    /// Resolves the target cluster; for weighted actions the draw happens
    /// once per request.
    pub fn pick_cluster(&self) -> String {
        match &self.cluster {
            ClusterSpec::Name(name) => name.clone(),
            ClusterSpec::Weighted(weighted) => {
                let total: u64 = weighted.iter().map(|(_, w)| *w as u64).sum();
                let mut draw = rand::thread_rng().gen_range(0..total);
                for (name, weight) in weighted {
                    if draw < *weight as u64 {
                        return name.clone();
                    }
                    draw -= *weight as u64;
                }
                weighted.last().map(|(n, _)| n.clone()).unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_config(raw: serde_json::Value) -> RouterConfig {
        serde_json::from_value(raw).unwrap()
    }

    fn sample_routers() -> Routers {
        Routers::from_config(&router_config(serde_json::json!({
            "router_config_name": "test",
            "virtual_hosts": [
                {
                    "name": "exact",
                    "domains": ["api.example.com"],
                    "routers": [
                        {"match": {"prefix": "/api"}, "route": {"cluster_name": "api", "prefix_rewrite": "/v1"}},
                        {"match": {"prefix": "/"}, "route": {"cluster_name": "fallback"}}
                    ]
                },
                {
                    "name": "wild",
                    "domains": ["*.example.com"],
                    "routers": [
                        {"match": {"prefix": "/"}, "route": {"cluster_name": "wild"}}
                    ]
                },
                {
                    "name": "all",
                    "domains": ["*"],
                    "routers": [
                        {
                            "match": {"prefix": "/", "headers": [{"name": "service", "value": "testSofa"}]},
                            "route": {"cluster_name": "rpc"}
                        }
                    ]
                }
            ]
        })))
        .unwrap()
    }

    fn bag(host: &str, path: &str) -> HeaderBag {
        let mut bag = HeaderBag::new();
        bag.set(HEADER_HOST, host);
        bag.set(HEADER_PATH, path);
        bag
    }

    #[test]
    fn domain_precedence() {
        let routers = sample_routers();
        assert_eq!(
            routers.match_virtual_host("api.example.com").unwrap().name(),
            "exact"
        );
        assert_eq!(
            routers.match_virtual_host("x.example.com").unwrap().name(),
            "wild"
        );
        assert_eq!(routers.match_virtual_host("other.io").unwrap().name(), "all");
    }

    #[test]
    fn first_matching_route_wins() {
        let routers = sample_routers();
        let route = routers.match_route(&bag("api.example.com", "/api/users")).unwrap();
        assert_eq!(route.action().unwrap().pick_cluster(), "api");
        let route = routers.match_route(&bag("api.example.com", "/other")).unwrap();
        assert_eq!(route.action().unwrap().pick_cluster(), "fallback");
    }

    #[test]
    fn header_matcher_gates_route() {
        let routers = sample_routers();
        let mut headers = bag("unknown.io", "/");
        assert!(routers.match_route(&headers).is_none());
        headers.set("service", "testSofa");
        let route = routers.match_route(&headers).unwrap();
        assert_eq!(route.action().unwrap().pick_cluster(), "rpc");
    }

    #[test]
    fn lookup_is_deterministic() {
        let routers = sample_routers();
        let headers = bag("api.example.com", "/api/x");
        let first = routers.match_route(&headers).unwrap();
        for _ in 0..10 {
            let again = routers.match_route(&headers).unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[test]
    fn prefix_rewrite_rewrites_matched_prefix() {
        let routers = sample_routers();
        let mut headers = bag("api.example.com", "/api/users");
        let route = routers.match_route(&headers).unwrap();
        route.apply_request_mutations(&mut headers);
        assert_eq!(headers.get(HEADER_PATH), Some("/v1/users"));
    }

    #[test]
    fn header_mutations_are_order_independent_on_disjoint_keys() {
        let config = router_config(serde_json::json!({
            "router_config_name": "test",
            "virtual_hosts": [{
                "name": "all",
                "domains": ["*"],
                "routers": [{
                    "match": {"prefix": "/"},
                    "route": {
                        "cluster_name": "c",
                        "request_headers_to_add": [
                            {"key": "x-added-a", "value": "1"},
                            {"key": "x-added-b", "value": "2"}
                        ],
                        "request_headers_to_remove": ["x-stale"]
                    }
                }]
            }]
        }));
        let routers = Routers::from_config(&config).unwrap();
        let mut headers = bag("any", "/");
        headers.set("x-stale", "old");
        let route = routers.match_route(&headers).unwrap();
        route.apply_request_mutations(&mut headers);
        assert_eq!(headers.get("x-added-a"), Some("1"));
        assert_eq!(headers.get("x-added-b"), Some("2"));
        assert!(headers.get("x-stale").is_none());
    }

    #[test]
    fn live_update_swaps_table() {
        let manager = RouterManager::new();
        manager
            .add_or_update_router(&router_config(serde_json::json!({
                "router_config_name": "r",
                "virtual_hosts": [{
                    "name": "v",
                    "domains": ["*"],
                    "routers": [{"match": {"prefix": "/"}, "route": {"cluster_name": "old"}}]
                }]
            })))
            .unwrap();
        let wrapper = manager.get_router_wrapper("r").unwrap();
        let stale = wrapper.routers();

        manager
            .add_or_update_router(&router_config(serde_json::json!({
                "router_config_name": "r",
                "virtual_hosts": [{
                    "name": "v",
                    "domains": ["*"],
                    "routers": [{"match": {"prefix": "/"}, "route": {"cluster_name": "new"}}]
                }]
            })))
            .unwrap();

        let headers = bag("any", "/");
        assert_eq!(
            stale.match_route(&headers).unwrap().action().unwrap().pick_cluster(),
            "old"
        );
        assert_eq!(
            wrapper
                .routers()
                .match_route(&headers)
                .unwrap()
                .action()
                .unwrap()
                .pick_cluster(),
            "new"
        );
    }
}
