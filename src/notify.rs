//! # Summary
//!
//! Broadcast-once notification channels. Each key maps to a channel that is
//! opened by the first waiter and closed by the single notifier; closing is
//! the broadcast. Waiters re-check their condition after every wakeup and
//! give up at a deadline instead of blocking forever.

use std::time::Duration;

use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time;

/// Outcome of a bounded wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    Notified,
    TimedOut,
}

pub struct Registry<K> {
    channels: Mutex<Map<K, watch::Sender<()>>>,
}

impl<K: std::hash::Hash + Eq + Clone> Default for Registry<K> {
    fn default() -> Self {
        Registry { channels: Mutex::new(Map::default()) }
    }
}

impl<K: std::hash::Hash + Eq + Clone> Registry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver that observes the next close of `key`'s channel.
    pub fn subscribe(&self, key: K) -> watch::Receiver<()> {
        self.channels
            .lock()
            .entry(key)
            .or_insert_with(|| watch::channel(()).0)
            .subscribe()
    }

    /// Closes `key`'s channel, waking every current subscriber.
    pub fn notify(&self, key: &K) {
        self.channels.lock().remove(key);
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until `done` holds, re-checking after each notification on `key`,
    /// for at most `timeout`. The condition must be made true before the
    /// notifier calls [`Registry::notify`].
    pub async fn wait_until<F>(&self, key: K, timeout: Duration, done: F) -> Wait
        where F: Fn() -> bool
    {
        let deadline = time::Instant::now() + timeout;
        loop {
            let mut rx = self.subscribe(key.clone());
            if done() {
                // Nobody may close a channel opened after the condition held
                self.notify(&key);
                return Wait::Notified
            }
            if time::timeout_at(deadline, rx.changed()).await.is_err() {
                return if done() { Wait::Notified } else { Wait::TimedOut }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn wakes_every_waiter() {
        let registry: Arc<Registry<usize>> = Arc::new(Registry::new());
        let flag = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicUsize::new(0));

        let waiters = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let flag = flag.clone();
                let woken = woken.clone();
                tokio::spawn(async move {
                    let wait = registry
                        .wait_until(7, Duration::from_secs(5), || flag.load(Ordering::SeqCst))
                        .await;
                    woken.fetch_add(1, Ordering::SeqCst);
                    wait
                })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::SeqCst);
        registry.notify(&7);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Wait::Notified);
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn satisfied_condition_returns_at_once() {
        let registry: Registry<u32> = Registry::new();
        let wait = registry.wait_until(1, Duration::from_secs(5), || true).await;
        assert_eq!(wait, Wait::Notified);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn gives_up_at_deadline() {
        let registry: Registry<u32> = Registry::new();
        let wait = registry.wait_until(1, Duration::from_millis(10), || false).await;
        assert_eq!(wait, Wait::TimedOut);
    }

    #[tokio::test]
    async fn unrelated_notifications_keep_waiting() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let registry = registry.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                registry
                    .wait_until(3, Duration::from_secs(5), || counter.load(Ordering::SeqCst) >= 2)
                    .await
            })
        };
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            registry.notify(&3);
        }
        assert_eq!(waiter.await.unwrap(), Wait::Notified);
    }
}
