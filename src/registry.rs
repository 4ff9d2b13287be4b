use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// The strategy used to order candidate broker URLs for a single connect
/// attempt, once priority nodes have been placed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverStrategy {
    /// Rotate through the candidate list by a monotonic cursor.
    #[default]
    RoundRobin,
    /// Shuffle the remaining candidates on every selection.
    Random,
}

/// A single configured broker URL's observed health, as tracked by the
/// cluster-node health background sweep.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    url: String,
    healthy: bool,
    last_checked: Option<Instant>,
    failure_count: u32,
}

impl NodeStatus {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: true,
            last_checked: None,
            failure_count: 0,
        }
    }

    /// The broker URL this status describes.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether this node is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// When this node was last probed, if ever.
    pub fn last_checked(&self) -> Option<Instant> {
        self.last_checked
    }

    /// The number of consecutive failed probes/connects for this node.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// The threshold of consecutive failures after which a node is marked
/// unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;

/// Tracks the set of configured broker URLs, their health, and the
/// round-robin cursor used by the failover strategy.
///
/// Generalizes a single-DSN connector into one that tracks a cluster of
/// candidate URLs and their health.
pub struct NodeRegistry {
    nodes: RwLock<Vec<NodeStatus>>,
    priority: Vec<String>,
    strategy: FailoverStrategy,
    shuffle_nodes: bool,
    cursor: AtomicUsize,
}

impl NodeRegistry {
    /// Builds a new registry from the given URLs, priority subset, and
    /// failover strategy. `shuffle_nodes` is independent of `strategy`: it
    /// additionally shuffles the non-priority candidates once up front before
    /// `strategy` takes over ordering them on each call, so a fresh process
    /// doesn't always try nodes in their configured order even under
    /// `round-robin`.
    pub fn new(
        urls: Vec<String>,
        priority: Vec<String>,
        strategy: FailoverStrategy,
        shuffle_nodes: bool,
    ) -> Self {
        let mut nodes: Vec<NodeStatus> = urls.into_iter().map(NodeStatus::new).collect();

        if shuffle_nodes {
            nodes.shuffle(&mut rand::rng());
        }

        Self {
            nodes: RwLock::new(nodes),
            priority,
            strategy,
            shuffle_nodes,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns a snapshot of every configured node's status.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.nodes.read().clone()
    }

    /// Records a successful probe/connect for the given URL: resets its
    /// failure count and marks it healthy.
    pub fn mark_healthy(&self, url: &str) {
        let mut nodes = self.nodes.write();

        if let Some(node) = nodes.iter_mut().find(|n| n.url == url) {
            node.healthy = true;
            node.failure_count = 0;
            node.last_checked = Some(Instant::now());
        }
    }

    /// Records a failed probe/connect for the given URL: increments its
    /// failure count, and marks it unhealthy once the threshold is reached.
    pub fn mark_unhealthy(&self, url: &str) {
        let mut nodes = self.nodes.write();

        if let Some(node) = nodes.iter_mut().find(|n| n.url == url) {
            node.failure_count += 1;
            node.last_checked = Some(Instant::now());

            if node.failure_count >= UNHEALTHY_THRESHOLD {
                node.healthy = false;
            }
        }
    }

    /// Composes the ordered candidate list for a single connect attempt:
    ///
    /// 1. Start from healthy nodes; fall back to all nodes if none are healthy.
    /// 2. Place configured priority nodes first, preserving their order.
    /// 3. Apply the failover strategy to the remainder (shuffle for
    ///    `random`; rotate by the monotonic cursor for `round-robin`).
    pub fn candidates(&self) -> Vec<String> {
        let nodes = self.nodes.read();

        let healthy: Vec<&NodeStatus> = nodes.iter().filter(|n| n.healthy).collect();
        let pool: Vec<&NodeStatus> = if healthy.is_empty() {
            nodes.iter().collect()
        } else {
            healthy
        };

        let mut priority_first = Vec::with_capacity(pool.len());
        let mut rest = Vec::with_capacity(pool.len());

        for priority_url in &self.priority {
            if let Some(node) = pool.iter().find(|n| &n.url == priority_url) {
                priority_first.push(node.url.clone());
            }
        }

        for node in &pool {
            if !self.priority.contains(&node.url) {
                rest.push(node.url.clone());
            }
        }

        match self.strategy {
            FailoverStrategy::Random => {
                rest.shuffle(&mut rand::rng());
            }
            FailoverStrategy::RoundRobin => {
                if self.shuffle_nodes {
                    rest.shuffle(&mut rand::rng());
                }

                if !rest.is_empty() {
                    let cursor = self.cursor.fetch_add(1, Ordering::Relaxed) % rest.len();
                    rest.rotate_left(cursor);
                }
            }
        }

        priority_first.extend(rest);
        priority_first
    }
}
