//! Connection Manager
//!
//! Supervises a single broker connection and the channels opened on it.
//! Each transport role (producer, consumer) owns its own manager; nothing is
//! shared between roles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::BrokerError;
use super::{Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionEvents};

/// Capped linear backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Producer policy: give up after 5 attempts and keep buffering
    pub fn bounded() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(5),
        }
    }

    /// Consumer policy: never stop trying
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::bounded()
        }
    }

    /// Delay before the given (1-based) attempt: `min(base × attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Lock-free connection flags, readable by health checks at any time
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    shutting_down: AtomicBool,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Snapshot of a manager's state for liveness probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub active_channels: usize,
    pub is_shutting_down: bool,
}

/// Result of [`ConnectionManager::connect`]
pub struct Connected {
    pub connection: Arc<dyn BrokerConnection>,
    /// Generation of the connection; events tagged with an older generation are stale
    pub generation: u64,
    /// Present only when a fresh connection was opened by this call
    pub events: Option<ConnectionEvents>,
}

/// Outcome of applying a connection event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Event belonged to an older connection or the link was already down
    Ignored,
    /// Link marked down; the owner should reconnect unless shutting down
    Lost { reconnect: bool },
}

pub struct ConnectionManager {
    role: &'static str,
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    state: Arc<ConnectionState>,
    generation: AtomicU64,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channels: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        role: &'static str,
        broker: Arc<dyn Broker>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            role,
            broker,
            policy,
            connect_timeout,
            state: Arc::new(ConnectionState::default()),
            generation: AtomicU64::new(0),
            connection: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> Arc<ConnectionState> {
        self.state.clone()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Return the live connection, or open a new one.
    ///
    /// Fails with a connection error when the broker is unreachable; retry
    /// scheduling is left to the caller.
    pub async fn connect(&self) -> Result<Connected, BrokerError> {
        let _guard = self.connect_lock.lock().await;

        if self.state.is_shutting_down() {
            return Err(BrokerError::ConnectionClosed);
        }

        if let Some(existing) = self.live_connection() {
            return Ok(Connected {
                connection: existing,
                generation: self.generation(),
                events: None,
            });
        }

        info!(role = self.role, "Establishing broker connection");
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let (connection, events) =
            match tokio::time::timeout(self.connect_timeout, self.broker.connect()).await {
                Ok(Ok(opened)) => opened,
                Ok(Err(e)) => {
                    warn!(role = self.role, error = %e, "Failed to connect to broker");
                    self.state.connected.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                Err(_) => {
                    warn!(role = self.role, timeout_ms, "Broker connection timed out");
                    self.state.connected.store(false, Ordering::SeqCst);
                    return Err(BrokerError::Timeout(timeout_ms));
                }
            };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.connection.lock() = Some(connection.clone());
        self.state.connected.store(true, Ordering::SeqCst);
        self.state.reconnect_attempts.store(0, Ordering::SeqCst);
        info!(role = self.role, generation, "Broker connection established");

        Ok(Connected {
            connection,
            generation,
            events: Some(events),
        })
    }

    fn live_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        if !self.state.is_connected() {
            return None;
        }
        self.connection.lock().clone().filter(|c| c.is_open())
    }

    /// Open a channel on the current connection and track it.
    ///
    /// Without a name, an identifier is generated.
    pub async fn create_channel(
        &self,
        name: Option<&str>,
    ) -> Result<(String, Arc<dyn BrokerChannel>), BrokerError> {
        let connection = self.live_connection().ok_or(BrokerError::NotConnected)?;
        let channel = connection.create_channel().await.inspect_err(|e| {
            warn!(role = self.role, error = %e, "Failed to create channel");
        })?;

        let channel_id = match name {
            Some(name) => name.to_string(),
            None => format!("channel_{}", ulid::Ulid::new()),
        };
        self.channels
            .lock()
            .insert(channel_id.clone(), channel.clone());
        debug!(role = self.role, channel_id = %channel_id, "Channel opened");

        Ok((channel_id, channel))
    }

    /// Stop tracking a channel after a channel-level error
    pub fn untrack_channel(&self, channel_id: &str, reason: &str) {
        if self.channels.lock().remove(channel_id).is_some() {
            warn!(role = self.role, channel_id, reason, "Channel error, untracked");
        }
    }

    /// Apply a connection event.
    ///
    /// This is the only place that flips a live link to disconnected.
    pub fn handle_event(&self, generation: u64, event: ConnectionEvent) -> Transition {
        if generation != self.generation() || !self.state.is_connected() {
            debug!(role = self.role, generation, ?event, "Ignoring stale connection event");
            return Transition::Ignored;
        }

        match &event {
            ConnectionEvent::Error(reason) => {
                warn!(role = self.role, reason = %reason, "Broker connection error")
            }
            ConnectionEvent::Closed => warn!(role = self.role, "Broker connection closed"),
        }

        self.state.connected.store(false, Ordering::SeqCst);
        self.channels.lock().clear();
        if let Some(stale) = self.connection.lock().take()
            && stale.is_open()
        {
            // Half-dead link (e.g. only our channel died): release it in the background
            let role = self.role;
            tokio::spawn(async move {
                if let Err(e) = stale.close().await {
                    debug!(role, error = %e, "Error releasing stale connection");
                }
            });
        }

        Transition::Lost {
            reconnect: !self.state.is_shutting_down(),
        }
    }

    /// Count one reconnect attempt and return how long to wait before it.
    ///
    /// `None` when shutting down or when the attempt budget is spent.
    pub fn next_reconnect_delay(&self) -> Option<Duration> {
        if self.state.is_shutting_down() {
            return None;
        }
        let attempts = self.state.reconnect_attempts();
        if let Some(max) = self.policy.max_attempts
            && attempts >= max
        {
            return None;
        }
        let attempt = attempts + 1;
        self.state
            .reconnect_attempts
            .store(attempt, Ordering::SeqCst);
        Some(self.policy.delay_for(attempt))
    }

    /// Flag the manager as shutting down; suppresses every future reconnect
    pub fn begin_shutdown(&self) -> bool {
        !self.state.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Close all tracked channels, then the connection.
    ///
    /// Individual close failures are logged and do not abort the shutdown.
    pub async fn close(&self) {
        self.begin_shutdown();
        let _guard = self.connect_lock.lock().await;

        let channels: Vec<_> = self.channels.lock().drain().collect();
        let connection = self.connection.lock().take();
        if channels.is_empty() && connection.is_none() {
            return;
        }

        info!(role = self.role, "Closing broker connection");
        for (channel_id, channel) in channels {
            match channel.close().await {
                Ok(()) => debug!(role = self.role, channel_id = %channel_id, "Channel closed"),
                Err(e) => {
                    warn!(role = self.role, channel_id = %channel_id, error = %e, "Error closing channel")
                }
            }
        }

        if let Some(connection) = connection {
            match connection.close().await {
                Ok(()) => info!(role = self.role, "Broker connection closed"),
                Err(e) => warn!(role = self.role, error = %e, "Error closing broker connection"),
            }
        }
        self.state.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.live_connection().is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            is_connected: self.state.is_connected(),
            reconnect_attempts: self.state.reconnect_attempts(),
            active_channels: self.channels.lock().len(),
            is_shutting_down: self.state.is_shutting_down(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn manager(broker: &InMemoryBroker, policy: ReconnectPolicy) -> ConnectionManager {
        ConnectionManager::new(
            "test",
            Arc::new(broker.clone()),
            policy,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_linear_backoff_is_capped() {
        let policy = ReconnectPolicy::bounded();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(50), Duration::from_secs(30));
    }

    #[test]
    fn test_bounded_policy_stops_after_max_attempts() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());

        let delays: Vec<_> = std::iter::from_fn(|| mgr.next_reconnect_delay()).collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(mgr.stats().reconnect_attempts, 5);
        assert!(mgr.next_reconnect_delay().is_none());
    }

    #[test]
    fn test_unbounded_policy_keeps_going() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::unbounded());

        for _ in 0..20 {
            assert!(mgr.next_reconnect_delay().is_some());
        }
        assert_eq!(mgr.stats().reconnect_attempts, 20);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());

        let first = mgr.connect().await.unwrap();
        assert!(first.events.is_some());
        let second = mgr.connect().await.unwrap();
        assert!(second.events.is_none());
        assert_eq!(first.generation, second.generation);
        assert_eq!(broker.open_connections(), 1);
        assert!(mgr.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let mgr = manager(&broker, ReconnectPolicy::bounded());

        assert!(mgr.connect().await.is_err());
        assert!(!mgr.stats().is_connected);
    }

    #[tokio::test]
    async fn test_successful_connect_resets_attempts() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());
        mgr.next_reconnect_delay();
        mgr.next_reconnect_delay();

        mgr.connect().await.unwrap();
        assert_eq!(mgr.stats().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_connection_loss_clears_channels() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());
        let connected = mgr.connect().await.unwrap();
        mgr.create_channel(Some("a")).await.unwrap();
        mgr.create_channel(None).await.unwrap();
        assert_eq!(mgr.stats().active_channels, 2);

        let transition = mgr.handle_event(connected.generation, ConnectionEvent::Closed);
        assert_eq!(transition, Transition::Lost { reconnect: true });
        assert_eq!(mgr.stats().active_channels, 0);
        assert!(!mgr.stats().is_connected);

        // A second report of the same loss is a no-op
        let again = mgr.handle_event(connected.generation, ConnectionEvent::Error("x".into()));
        assert_eq!(again, Transition::Ignored);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());
        let first = mgr.connect().await.unwrap();
        mgr.handle_event(first.generation, ConnectionEvent::Closed);
        let second = mgr.connect().await.unwrap();

        assert_eq!(
            mgr.handle_event(first.generation, ConnectionEvent::Closed),
            Transition::Ignored
        );
        assert!(mgr.stats().is_connected);
        assert!(second.generation > first.generation);
    }

    #[tokio::test]
    async fn test_closed_channel_is_untracked() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::bounded());
        mgr.connect().await.unwrap();
        let (id, channel) = mgr.create_channel(Some("work")).await.unwrap();
        mgr.create_channel(None).await.unwrap();

        channel.close().await.unwrap();
        mgr.untrack_channel(&id, "channel closed");
        mgr.untrack_channel(&id, "channel closed");
        let stats = mgr.stats();
        assert_eq!(stats.active_channels, 1);
        assert!(stats.is_connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_reconnect() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, ReconnectPolicy::unbounded());
        let connected = mgr.connect().await.unwrap();
        mgr.create_channel(Some("work")).await.unwrap();

        mgr.close().await;
        mgr.close().await;

        let stats = mgr.stats();
        assert!(stats.is_shutting_down);
        assert!(!stats.is_connected);
        assert_eq!(stats.active_channels, 0);
        assert_eq!(broker.open_connections(), 0);
        assert!(mgr.next_reconnect_delay().is_none());
        assert!(mgr.connect().await.is_err());
        assert_eq!(
            mgr.handle_event(connected.generation, ConnectionEvent::Closed),
            Transition::Ignored
        );
    }
}
