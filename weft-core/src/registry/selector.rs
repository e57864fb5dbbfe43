use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng;

use crate::error::{Error, Result};

use super::Node;

/// Load-balancing policy: pick one node from a service's node list.
pub trait Selector: Send + Sync {
    /// Pick a node. An empty list means the service is unavailable.
    fn select(&self, service: &str, nodes: &[Node]) -> Result<Node>;

    /// Feedback after a call; selectors may use it to steer future picks.
    fn mark(&self, _service: &str, _node_id: &str, _ok: bool) {}
}

fn no_nodes(service: &str) -> Error {
    Error::ServiceUnavailable(format!("no nodes available for {service}"))
}

/// Cycles through nodes with a per-service cursor.
#[derive(Default)]
pub struct RoundRobinSelector {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobinSelector {
    fn select(&self, service: &str, nodes: &[Node]) -> Result<Node> {
        if nodes.is_empty() {
            return Err(no_nodes(service));
        }
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(nodes[index].clone())
    }
}

/// Uniform random pick.
#[derive(Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for RandomSelector {
    fn select(&self, service: &str, nodes: &[Node]) -> Result<Node> {
        if nodes.is_empty() {
            return Err(no_nodes(service));
        }
        let index = rand::thread_rng().gen_range(0..nodes.len());
        Ok(nodes[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn nodes(count: usize) -> Vec<Node> {
        (0..count)
            .map(|i| Node::new(format!("host-{i}"), 9000 + i as u16))
            .collect()
    }

    #[test]
    fn round_robin_is_fair() {
        let selector = RoundRobinSelector::new();
        let nodes = nodes(3);
        let mut counts: HashMap<String, usize> = HashMap::new();

        let total = 30;
        for _ in 0..total {
            let picked = selector.select("svc", &nodes).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, total / 3);
        }
    }

    #[test]
    fn round_robin_uneven_split() {
        let selector = RoundRobinSelector::new();
        let nodes = nodes(3);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let picked = selector.select("svc", &nodes).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        // 10 over 3 nodes: each node picked 3 or 4 times.
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
    }

    #[test]
    fn round_robin_cursor_is_per_service() {
        let selector = RoundRobinSelector::new();
        let nodes = nodes(2);
        let first_a = selector.select("a", &nodes).unwrap();
        let first_b = selector.select("b", &nodes).unwrap();
        // Both services start at the head of the list.
        assert_eq!(first_a.id, nodes[0].id);
        assert_eq!(first_b.id, nodes[0].id);
    }

    #[test]
    fn empty_list_is_unavailable() {
        let selector = RoundRobinSelector::new();
        let err = selector.select("svc", &[]).unwrap_err();
        assert_eq!(err.status_code(), 503);

        let selector = RandomSelector::new();
        let err = selector.select("svc", &[]).unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn random_selects_within_list() {
        let selector = RandomSelector::new();
        let nodes = nodes(4);
        for _ in 0..50 {
            let picked = selector.select("svc", &nodes).unwrap();
            assert!(nodes.iter().any(|n| n.id == picked.id));
        }
    }
}
