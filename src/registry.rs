//! Outstanding calls, keyed by correlation id.
//!
//! Each live waiter owns the sending half of a oneshot channel. Resolving
//! removes the entry and sends in one step: whoever wins the `remove` is
//! the only one holding the sender, so a waiter can never see two outcomes.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::broker::BrokerError;
use crate::wire::Reply;

/// What a waiter eventually receives.
pub type Outcome = Result<Reply, BrokerError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("correlation id '{0}' already has a live waiter")]
    Duplicate(String),
}

struct Waiter {
    slot: oneshot::Sender<Outcome>,
    deadline: Instant,
    timeout: Duration,
}

/// Registry of blocked callers. Owned by one broker; shared with its
/// listener through an `Arc`.
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: DashMap<String, Waiter>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Fails rather than overwrite a live one.
    /// `timeout` is what gets reported if the waiter is reaped.
    pub fn register(
        &self,
        correlation_id: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, RegistryError> {
        match self.waiters.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(correlation_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(Waiter {
                    slot: tx,
                    deadline,
                    timeout,
                });
                Ok(rx)
            }
        }
    }

    /// Hand `outcome` to the waiter for `correlation_id`, removing it.
    /// Returns `false` when there is no such waiter (already resolved,
    /// timed out, or never registered) or it stopped listening.
    pub fn resolve(&self, correlation_id: &str, outcome: Outcome) -> bool {
        match self.waiters.remove(correlation_id) {
            Some((_, waiter)) => waiter.slot.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without resolving it. Returns whether it was still live.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Resolve every live waiter with an error built by `error`.
    pub fn fail_all(&self, error: impl Fn() -> BrokerError) -> usize {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.resolve(id, Err(error())))
            .count()
    }

    /// Resolve waiters whose deadline passed with a timeout. Callers
    /// normally do this themselves; this catches the ones that vanished.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, Duration)> = self
            .waiters
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| (e.key().clone(), e.value().timeout))
            .collect();
        expired
            .into_iter()
            .filter(|(id, timeout)| {
                self.resolve(
                    id,
                    Err(BrokerError::Timeout {
                        correlation_id: id.clone(),
                        timeout: *timeout,
                    }),
                )
            })
            .count()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATIENCE: Duration = Duration::from_secs(30);

    fn later() -> Instant {
        Instant::now() + PATIENCE
    }

    #[tokio::test]
    async fn resolve_delivers_once_and_removes() {
        let registry = WaiterRegistry::new();
        let rx = registry.register("a", later(), PATIENCE).unwrap();

        assert!(registry.resolve("a", Ok(Reply::success("a", "1+1", "2"))));
        assert!(!registry.contains("a"));
        assert!(!registry.resolve("a", Ok(Reply::success("a", "1+1", "2"))));

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.outcome(), Ok("2"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = WaiterRegistry::new();
        let _rx = registry.register("dup", later(), PATIENCE).unwrap();
        assert_eq!(
            registry.register("dup", later(), PATIENCE).unwrap_err(),
            RegistryError::Duplicate("dup".to_string())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_unknown_is_a_no_op() {
        let registry = WaiterRegistry::new();
        assert!(!registry.resolve("ghost", Err(BrokerError::ShutDown)));
    }

    #[test]
    fn cancel_removes_without_delivering() {
        let registry = WaiterRegistry::new();
        let mut rx = registry.register("c", later(), PATIENCE).unwrap();
        assert!(registry.cancel("c"));
        assert!(!registry.cancel("c"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_all_resolves_everyone() {
        let registry = WaiterRegistry::new();
        let rx1 = registry.register("1", later(), PATIENCE).unwrap();
        let rx2 = registry.register("2", later(), PATIENCE).unwrap();

        assert_eq!(
            registry.fail_all(|| BrokerError::ListenerLost("gone".into())),
            2
        );
        assert!(registry.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(BrokerError::ListenerLost(_))));
        assert!(matches!(rx2.await.unwrap(), Err(BrokerError::ListenerLost(_))));
    }

    #[tokio::test]
    async fn reap_expired_only_touches_past_deadlines() {
        let registry = WaiterRegistry::new();
        let now = Instant::now();
        let stale = registry.register("stale", now, Duration::ZERO).unwrap();
        let _fresh = registry.register("fresh", later(), PATIENCE).unwrap();

        assert_eq!(registry.reap_expired(now), 1);
        assert!(registry.contains("fresh"));
        assert!(matches!(
            stale.await.unwrap(),
            Err(BrokerError::Timeout { .. })
        ));
    }

    #[test]
    fn dropped_receiver_counts_as_undelivered() {
        let registry = WaiterRegistry::new();
        drop(registry.register("gone", later(), PATIENCE).unwrap());
        assert!(!registry.resolve("gone", Err(BrokerError::ShutDown)));
        assert!(registry.is_empty());
    }
}
