//! Fault injection for grid testing.
//!
//! [`ChaosController`] sits in front of a [`LocalTransport`](crate::network::LocalTransport)
//! as its interceptor. It can crash members for a while, drop or delay
//! requests at random, and hold chosen requests until released.

use crate::error::NetworkError;
use crate::network::{NodeRequest, TransportInterceptor};
use crate::types::NodeAddress;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Configuration for random faults.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of dropping a request (0.0 - 1.0).
    pub message_drop_probability: f64,

    /// Probability of delaying a request (0.0 - 1.0).
    pub message_delay_probability: f64,

    /// Minimum request delay.
    pub message_delay_min: Duration,

    /// Maximum request delay.
    pub message_delay_max: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl ChaosConfig {
    /// No random faults.
    pub fn none() -> Self {
        Self {
            message_drop_probability: 0.0,
            message_delay_probability: 0.0,
            message_delay_min: Duration::ZERO,
            message_delay_max: Duration::ZERO,
        }
    }

    /// Occasional short delays, rare drops.
    pub fn light() -> Self {
        Self {
            message_drop_probability: 0.01,
            message_delay_probability: 0.05,
            message_delay_min: Duration::from_millis(1),
            message_delay_max: Duration::from_millis(10),
        }
    }

    /// Frequent delays and drops.
    pub fn moderate() -> Self {
        Self {
            message_drop_probability: 0.05,
            message_delay_probability: 0.2,
            message_delay_min: Duration::from_millis(5),
            message_delay_max: Duration::from_millis(50),
        }
    }
}

/// A simulated member crash.
#[derive(Debug, Clone)]
pub struct NodeCrash {
    /// The crashed member.
    pub node: NodeAddress,

    /// When the crash occurred.
    pub crashed_at: Instant,

    /// When the member recovers.
    pub recovers_at: Instant,
}

impl NodeCrash {
    /// Check if the member has recovered.
    pub fn is_recovered(&self) -> bool {
        Instant::now() >= self.recovers_at
    }

    /// Get the downtime duration.
    pub fn downtime(&self) -> Duration {
        self.recovers_at.duration_since(self.crashed_at)
    }
}

/// Requests matching a hold wait until it is released.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hold {
    operation: &'static str,
    cache: String,
}

impl Hold {
    fn matches(&self, request: &NodeRequest) -> bool {
        request.name() == self.operation && request.cache() == Some(self.cache.as_str())
    }
}

/// Fault injector for node-to-node requests.
#[derive(Debug)]
pub struct ChaosController {
    config: ChaosConfig,
    enabled: AtomicBool,
    crashes: RwLock<HashMap<NodeAddress, NodeCrash>>,
    holds: RwLock<Vec<Hold>>,
    released: Notify,

    messages_dropped: AtomicU64,
    messages_delayed: AtomicU64,
    messages_held: AtomicU64,
    crashes_triggered: AtomicU64,
}

impl ChaosController {
    /// Create a controller. Random faults stay off until [`enable`](Self::enable).
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            config,
            enabled: AtomicBool::new(false),
            crashes: RwLock::new(HashMap::new()),
            holds: RwLock::new(Vec::new()),
            released: Notify::new(),
            messages_dropped: AtomicU64::new(0),
            messages_delayed: AtomicU64::new(0),
            messages_held: AtomicU64::new(0),
            crashes_triggered: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults() -> Self {
        Self::new(ChaosConfig::default())
    }

    /// Enable random faults.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable random faults.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if random faults are enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    // ==================== Crashes ====================

    /// Make `node` unreachable for `duration`.
    pub fn crash_node(&self, node: NodeAddress, duration: Duration) {
        let now = Instant::now();
        let crash = NodeCrash {
            node: node.clone(),
            crashed_at: now,
            recovers_at: now + duration,
        };
        tracing::debug!(node = %node, ?duration, "Injected node crash");
        self.crashes.write().insert(node, crash);
        self.crashes_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Check if a member is crashed.
    pub fn is_crashed(&self, node: &NodeAddress) -> bool {
        let mut crashes = self.crashes.write();
        crashes.retain(|_, c| !c.is_recovered());
        crashes.contains_key(node)
    }

    /// Recover one member immediately.
    pub fn recover_node(&self, node: &NodeAddress) {
        self.crashes.write().remove(node);
    }

    /// Recover all crashed members immediately.
    pub fn recover_all_nodes(&self) {
        self.crashes.write().clear();
    }

    // ==================== Holds ====================

    /// Hold every `operation` request (see [`NodeRequest::name`]) for `cache`.
    pub fn hold(&self, operation: &'static str, cache: impl Into<String>) {
        let hold = Hold {
            operation,
            cache: cache.into(),
        };
        let mut holds = self.holds.write();
        if !holds.contains(&hold) {
            holds.push(hold);
        }
    }

    /// Release every held request.
    pub fn release_all(&self) {
        self.holds.write().clear();
        self.released.notify_waiters();
    }

    /// Number of requests that have waited on a hold.
    pub fn held_requests(&self) -> u64 {
        self.messages_held.load(Ordering::Relaxed)
    }

    fn is_held(&self, request: &NodeRequest) -> bool {
        self.holds.read().iter().any(|h| h.matches(request))
    }

    async fn wait_for_release(&self, request: &NodeRequest) {
        let mut counted = false;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_held(request) {
                return;
            }
            if !counted {
                counted = true;
                self.messages_held.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation = request.name(), "Holding request");
            }
            notified.await;
        }
    }

    // ==================== Random faults ====================

    fn should_drop_message(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if rand::rng().random::<f64>() < self.config.message_drop_probability {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn message_delay(&self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let mut rng = rand::rng();
        if rng.random::<f64>() >= self.config.message_delay_probability {
            return None;
        }
        self.messages_delayed.fetch_add(1, Ordering::Relaxed);
        let min_ms = self.config.message_delay_min.as_millis() as u64;
        let max_ms = (self.config.message_delay_max.as_millis() as u64).max(min_ms);
        Some(Duration::from_millis(rng.random_range(min_ms..=max_ms)))
    }

    /// Clear every fault and counter.
    pub fn reset(&self) {
        self.recover_all_nodes();
        self.release_all();
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.messages_delayed.store(0, Ordering::Relaxed);
        self.messages_held.store(0, Ordering::Relaxed);
        self.crashes_triggered.store(0, Ordering::Relaxed);
    }

    /// Fault statistics.
    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            enabled: self.is_enabled(),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_delayed: self.messages_delayed.load(Ordering::Relaxed),
            messages_held: self.messages_held.load(Ordering::Relaxed),
            crashes_triggered: self.crashes_triggered.load(Ordering::Relaxed),
            active_crashes: self.crashes.read().len(),
        }
    }
}

impl Default for ChaosController {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl TransportInterceptor for ChaosController {
    async fn before_send(
        &self,
        target: &NodeAddress,
        request: &NodeRequest,
    ) -> Result<(), NetworkError> {
        if self.is_crashed(target) {
            return Err(NetworkError::NodeUnreachable(target.clone()));
        }
        self.wait_for_release(request).await;
        if let Some(delay) = self.message_delay() {
            tokio::time::sleep(delay).await;
        }
        if self.should_drop_message() {
            return Err(NetworkError::NodeUnreachable(target.clone()));
        }
        Ok(())
    }
}

/// Fault statistics.
#[derive(Debug, Clone)]
pub struct ChaosStats {
    /// Whether random faults are enabled.
    pub enabled: bool,
    /// Total requests dropped.
    pub messages_dropped: u64,
    /// Total requests delayed.
    pub messages_delayed: u64,
    /// Total requests that waited on a hold.
    pub messages_held: u64,
    /// Total crashes triggered.
    pub crashes_triggered: u64,
    /// Currently crashed members.
    pub active_crashes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ping() -> NodeRequest {
        NodeRequest::Ping
    }

    #[tokio::test]
    async fn test_crashed_node_is_unreachable() {
        let chaos = ChaosController::with_defaults();
        let node = NodeAddress::new("a");
        chaos.crash_node(node.clone(), Duration::from_secs(60));

        assert!(chaos.is_crashed(&node));
        let err = chaos.before_send(&node, &ping()).await.unwrap_err();
        assert!(matches!(err, NetworkError::NodeUnreachable(n) if n == node));

        chaos.recover_node(&node);
        assert!(chaos.before_send(&node, &ping()).await.is_ok());
    }

    #[tokio::test]
    async fn test_crash_expires() {
        let chaos = ChaosController::with_defaults();
        let node = NodeAddress::new("a");
        chaos.crash_node(node.clone(), Duration::ZERO);
        assert!(!chaos.is_crashed(&node));
        assert_eq!(chaos.stats().crashes_triggered, 1);
    }

    #[tokio::test]
    async fn test_hold_blocks_until_released() {
        let chaos = Arc::new(ChaosController::with_defaults());
        chaos.hold("clear", "default");

        let sender = {
            let chaos = chaos.clone();
            tokio::spawn(async move {
                let request = NodeRequest::Clear {
                    cache: "default".into(),
                };
                chaos.before_send(&NodeAddress::new("a"), &request).await
            })
        };

        let observed = crate::testing::wait_for(
            || chaos.held_requests() == 1,
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await;
        assert!(observed);
        assert!(!sender.is_finished());

        // Other caches pass through.
        let other = NodeRequest::Clear {
            cache: "users".into(),
        };
        assert!(chaos.before_send(&NodeAddress::new("a"), &other).await.is_ok());

        chaos.release_all();
        assert!(sender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_disabled_controller_never_drops() {
        let config = ChaosConfig {
            message_drop_probability: 1.0,
            ..ChaosConfig::none()
        };
        let chaos = ChaosController::new(config);
        let node = NodeAddress::new("a");
        assert!(chaos.before_send(&node, &ping()).await.is_ok());

        chaos.enable();
        assert!(chaos.before_send(&node, &ping()).await.is_err());
        assert_eq!(chaos.stats().messages_dropped, 1);

        chaos.reset();
        assert_eq!(chaos.stats().messages_dropped, 0);
    }
}
