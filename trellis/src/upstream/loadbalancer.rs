use super::{ClusterInfo, Host, HostSet};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use trellis_common::config::{LbPolicyConfig, SubsetConfig, SubsetFallbackConfig};

/// Request-side inputs to host selection.
#[derive(Debug, Default)]
pub struct LbContext {
    /// Route metadata labels for subset selection.
    pub metadata: HashMap<String, String>,
    /// Host addresses to avoid when alternatives exist (retry path).
    pub excluded: Vec<String>,
}

impl LbContext {
    pub fn excludes(&self, host: &Host) -> bool {
        self.excluded.iter().any(|a| a == host.address())
    }
}

pub trait LoadBalancer: Send + Sync {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>>;
}

pub fn new_load_balancer(info: &ClusterInfo, host_set: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
    if let Some(subset) = info.subset() {
        return Arc::new(SubsetLoadBalancer {
            config: subset.clone(),
            policy: info.lb_type(),
            host_set,
        });
    }
    new_policy_balancer(info.lb_type(), host_set)
}

fn new_policy_balancer(policy: LbPolicyConfig, host_set: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
    match policy {
        LbPolicyConfig::RoundRobin => Arc::new(RoundRobinLoadBalancer::new(host_set)),
        LbPolicyConfig::Random => Arc::new(RandomLoadBalancer { host_set }),
        LbPolicyConfig::LeastActiveRequest => {
            Arc::new(LeastActiveRequestLoadBalancer { host_set })
        }
        LbPolicyConfig::LeastRequest => Arc::new(LeastRequestLoadBalancer {
            host_set,
            choice_count: DEFAULT_CHOICE_COUNT,
        }),
    }
}

const DEFAULT_CHOICE_COUNT: usize = 2;

/// Weight-scaled deadline increments; weight is bounded so increments never
/// round to zero.
const WEIGHT_SCALE: u64 = 1 << 16;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EdfEntry {
    deadline: u64,
    seq: u64,
    idx: usize,
}

/// Earliest-deadline-first weighted round robin: higher-weight hosts are
/// drawn proportionally without bursting.
pub struct RoundRobinLoadBalancer {
    host_set: Arc<HostSet>,
    queue: Mutex<BinaryHeap<Reverse<EdfEntry>>>,
}

impl RoundRobinLoadBalancer {
    pub fn new(host_set: Arc<HostSet>) -> Self {
        let mut queue = BinaryHeap::new();
        for (idx, host) in host_set.healthy_hosts().iter().enumerate() {
            queue.push(Reverse(EdfEntry {
                deadline: WEIGHT_SCALE / host.weight() as u64,
                seq: idx as u64,
                idx,
            }));
        }
        RoundRobinLoadBalancer {
            host_set,
            queue: Mutex::new(queue),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        let hosts = self.host_set.healthy_hosts();
        if hosts.is_empty() {
            return None;
        }
        let mut queue = self.queue.lock().unwrap();
        let mut fallback = None;
        for _ in 0..hosts.len() {
            let Reverse(mut entry) = queue.pop()?;
            let host = hosts[entry.idx].clone();
            entry.deadline += WEIGHT_SCALE / host.weight() as u64;
            queue.push(Reverse(entry));
            if !ctx.excludes(&host) {
                return Some(host);
            }
            fallback.get_or_insert(host);
        }
        // Every candidate was excluded; serving a request beats failing it.
        fallback
    }
}

pub struct RandomLoadBalancer {
    host_set: Arc<HostSet>,
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        pick_random(self.host_set.healthy_hosts(), ctx)
    }
}

/// Among healthy hosts, the one with the fewest in-flight requests; ties
/// broken by a weighted draw.
pub struct LeastActiveRequestLoadBalancer {
    host_set: Arc<HostSet>,
}

impl LoadBalancer for LeastActiveRequestLoadBalancer {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        let candidates = filter_excluded(self.host_set.healthy_hosts(), ctx);
        let min = candidates
            .iter()
            .map(|h| h.stats().upstream_request_active.get())
            .min()?;
        let tied: Vec<Arc<Host>> = candidates
            .into_iter()
            .filter(|h| h.stats().upstream_request_active.get() == min)
            .collect();
        pick_weighted(&tied)
    }
}

/// Power-of-N-choices: sample `choice_count` hosts, keep the least loaded.
pub struct LeastRequestLoadBalancer {
    host_set: Arc<HostSet>,
    choice_count: usize,
}

impl LoadBalancer for LeastRequestLoadBalancer {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        let candidates = filter_excluded(self.host_set.healthy_hosts(), ctx);
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let mut best: Option<Arc<Host>> = None;
        for _ in 0..self.choice_count.max(1) {
            let sampled = candidates[rng.gen_range(0..candidates.len())].clone();
            best = Some(match best {
                None => sampled,
                Some(prev) => {
                    if sampled.stats().upstream_request_active.get()
                        < prev.stats().upstream_request_active.get()
                    {
                        sampled
                    } else {
                        prev
                    }
                }
            });
        }
        best
    }
}

/// Restricts candidates to hosts whose metadata matches the request labels
/// under one of the configured selectors; misses fall back per policy.
pub struct SubsetLoadBalancer {
    config: SubsetConfig,
    policy: LbPolicyConfig,
    host_set: Arc<HostSet>,
}

impl SubsetLoadBalancer {
    fn selector_covers(&self, metadata: &HashMap<String, String>) -> bool {
        self.config
            .selectors
            .iter()
            .any(|keys| keys.len() == metadata.len() && keys.iter().all(|k| metadata.contains_key(k)))
    }

    fn pick_matching(
        &self,
        labels: &HashMap<String, String>,
        ctx: &LbContext,
    ) -> Option<Arc<Host>> {
        let matching: Vec<Arc<Host>> = self
            .host_set
            .healthy_hosts()
            .iter()
            .filter(|h| h.matches_labels(labels))
            .cloned()
            .collect();
        if matching.is_empty() {
            return None;
        }
        let not_excluded: Vec<Arc<Host>> = matching
            .iter()
            .filter(|h| !ctx.excludes(h))
            .cloned()
            .collect();
        pick_weighted(if not_excluded.is_empty() {
            &matching
        } else {
            &not_excluded
        })
    }
}

impl LoadBalancer for SubsetLoadBalancer {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        if !ctx.metadata.is_empty() && self.selector_covers(&ctx.metadata) {
            if let Some(host) = self.pick_matching(&ctx.metadata, ctx) {
                return Some(host);
            }
        }
        match self.config.fallback_policy {
            SubsetFallbackConfig::NoFallback => None,
            SubsetFallbackConfig::AnyEndpoint => {
                new_policy_balancer(self.policy, self.host_set.clone()).choose_host(ctx)
            }
            SubsetFallbackConfig::DefaultSubset => {
                self.pick_matching(&self.config.default_subset, ctx)
            }
        }
    }
}

fn filter_excluded(hosts: &[Arc<Host>], ctx: &LbContext) -> Vec<Arc<Host>> {
    let remaining: Vec<Arc<Host>> = hosts.iter().filter(|h| !ctx.excludes(h)).cloned().collect();
    if remaining.is_empty() {
        hosts.to_vec()
    } else {
        remaining
    }
}

fn pick_random(hosts: &[Arc<Host>], ctx: &LbContext) -> Option<Arc<Host>> {
    let candidates = filter_excluded(hosts, ctx);
    if candidates.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[idx].clone())
}

fn pick_weighted(hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
    if hosts.is_empty() {
        return None;
    }
    let total: u64 = hosts.iter().map(|h| h.weight() as u64).sum();
    let mut draw = rand::thread_rng().gen_range(0..total);
    for host in hosts {
        let weight = host.weight() as u64;
        if draw < weight {
            return Some(host.clone());
        }
        draw -= weight;
    }
    hosts.last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::config::ClusterConfig;

    fn host_set(hosts: Vec<(&str, u32)>) -> Arc<HostSet> {
        let config: ClusterConfig = serde_json::from_value(serde_json::json!({
            "name": "test",
            "hosts": hosts
                .into_iter()
                .map(|(addr, weight)| serde_json::json!({"address": addr, "weight": weight}))
                .collect::<Vec<_>>(),
        }))
        .unwrap();
        super::super::Cluster::new(&config).snapshot().host_set
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let lb = RoundRobinLoadBalancer::new(host_set(vec![
            ("127.0.0.1:1", 1),
            ("127.0.0.1:2", 1),
            ("127.0.0.1:3", 1),
        ]));
        let ctx = LbContext::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(lb.choose_host(&ctx).unwrap().address().to_owned());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn round_robin_respects_weights() {
        let lb = RoundRobinLoadBalancer::new(host_set(vec![
            ("127.0.0.1:1", 3),
            ("127.0.0.1:2", 1),
        ]));
        let ctx = LbContext::default();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..40 {
            let host = lb.choose_host(&ctx).unwrap();
            *counts.entry(host.address().to_owned()).or_default() += 1;
        }
        assert_eq!(counts["127.0.0.1:1"], 30);
        assert_eq!(counts["127.0.0.1:2"], 10);
    }

    #[test]
    fn empty_host_set_yields_none() {
        let lb = RoundRobinLoadBalancer::new(host_set(vec![]));
        assert!(lb.choose_host(&LbContext::default()).is_none());
        let lb = RandomLoadBalancer {
            host_set: host_set(vec![]),
        };
        assert!(lb.choose_host(&LbContext::default()).is_none());
    }

    #[test]
    fn least_active_prefers_idle_host() {
        let set = host_set(vec![("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        for _ in 0..10 {
            set.healthy_hosts()[0].stats().upstream_request_active.inc();
        }
        let lb = LeastActiveRequestLoadBalancer {
            host_set: set.clone(),
        };
        let host = lb.choose_host(&LbContext::default()).unwrap();
        assert_eq!(host.address(), "127.0.0.1:2");
    }

    #[test]
    fn exclusion_skips_failed_host_when_possible() {
        let set = host_set(vec![("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        let lb = RandomLoadBalancer {
            host_set: set.clone(),
        };
        let ctx = LbContext {
            excluded: vec!["127.0.0.1:1".to_owned()],
            ..Default::default()
        };
        for _ in 0..10 {
            assert_eq!(lb.choose_host(&ctx).unwrap().address(), "127.0.0.1:2");
        }
        // Sole host stays eligible even when excluded.
        let lone = RandomLoadBalancer {
            host_set: host_set(vec![("127.0.0.1:1", 1)]),
        };
        assert!(lone.choose_host(&ctx).is_some());
    }

    #[test]
    fn subset_falls_back_per_policy() {
        let config: ClusterConfig = serde_json::from_value(serde_json::json!({
            "name": "test",
            "subset": {
                "selectors": [["zone"]],
                "fallback_policy": "NoFallback",
            },
            "hosts": [
                {"address": "127.0.0.1:1", "metadata": {"zone": "a"}},
                {"address": "127.0.0.1:2", "metadata": {"zone": "b"}},
            ],
        }))
        .unwrap();
        let cluster = super::super::Cluster::new(&config);
        let snapshot = cluster.snapshot();

        let mut ctx = LbContext::default();
        ctx.metadata.insert("zone".to_owned(), "b".to_owned());
        assert_eq!(
            snapshot.choose_host(&ctx).unwrap().address(),
            "127.0.0.1:2"
        );

        ctx.metadata.insert("zone".to_owned(), "c".to_owned());
        assert!(snapshot.choose_host(&ctx).is_none());
    }
}
