//! Broadcast fan-out: one publisher unblocks any number of waiters.
//!
//! A single event-loop task owns the subscriber set, so subscribes,
//! unsubscribes, and broadcasts are serialized and a wakeup can never be
//! lost to a membership race. Each waiter has a one-slot buffer: a
//! broadcast that finds the slot full is dropped, because that waiter
//! already has a wakeup pending.

use tokio::sync::{mpsc, oneshot};

enum Cmd {
    Subscribe(oneshot::Sender<mpsc::Receiver<()>>),
    Broadcast,
    Stop,
}

/// Handle to the waiter group's event loop.
#[derive(Clone)]
pub struct WaiterGroup {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl WaiterGroup {
    pub fn new() -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut subscribers: Vec<mpsc::Sender<()>> = Vec::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Cmd::Subscribe(reply) => {
                        let (tx, rx) = mpsc::channel(1);
                        if reply.send(rx).is_ok() {
                            subscribers.push(tx);
                        }
                    }
                    Cmd::Broadcast => {
                        // Dropped waiters unsubscribe implicitly.
                        subscribers.retain(|tx| !tx.is_closed());
                        for tx in &subscribers {
                            // Full slot: the waiter already has a pending
                            // wakeup, nothing to add.
                            let _ = tx.try_send(());
                        }
                    }
                    Cmd::Stop => break,
                }
            }
            // Dropping the senders ends every waiter with `false`.
        });
        Self { cmd_tx }
    }

    /// Register a new waiter. After [`stop`] the returned waiter's
    /// `wait` resolves `false` immediately.
    ///
    /// [`stop`]: WaiterGroup::stop
    pub async fn new_waiter(&self) -> Waiter {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Subscribe(reply_tx)).is_ok() {
            if let Ok(rx) = reply_rx.await {
                return Waiter { rx };
            }
        }
        // Group already stopped: a pre-closed waiter.
        let (_, rx) = mpsc::channel(1);
        Waiter { rx }
    }

    /// Wake every currently subscribed waiter.
    pub fn broadcast(&self) {
        let _ = self.cmd_tx.send(Cmd::Broadcast);
    }

    /// Stop the group: every waiter, current and future, resolves `false`.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }
}

impl Default for WaiterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscription to a [`WaiterGroup`]. Dropping it unsubscribes.
pub struct Waiter {
    rx: mpsc::Receiver<()>,
}

impl Waiter {
    /// Block until the next broadcast (`true`) or until the group stops
    /// (`false`).
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn broadcast_wakes_all_waiters() {
        let group = WaiterGroup::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mut waiter = group.new_waiter().await;
            handles.push(tokio::spawn(async move { waiter.wait().await }));
        }

        group.broadcast();

        let all = tokio::time::timeout(Duration::from_millis(200), async {
            let mut results = Vec::new();
            for h in handles {
                results.push(h.await.unwrap());
            }
            results
        })
        .await
        .expect("all waiters wake within 200ms");
        assert_eq!(all, vec![true; 10]);
    }

    #[tokio::test]
    async fn stop_releases_all_waiters_with_false() {
        let group = WaiterGroup::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mut waiter = group.new_waiter().await;
            handles.push(tokio::spawn(async move { waiter.wait().await }));
        }

        group.stop();

        for h in handles {
            assert!(!h.await.unwrap());
        }
    }

    #[tokio::test]
    async fn waiter_after_stop_is_already_released() {
        let group = WaiterGroup::new();
        group.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut waiter = group.new_waiter().await;
        assert!(!waiter.wait().await);
    }

    #[tokio::test]
    async fn broadcast_before_wait_is_buffered_once() {
        let group = WaiterGroup::new();
        let mut waiter = group.new_waiter().await;
        group.broadcast();
        group.broadcast(); // second broadcast finds the slot full, dropped
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(waiter.wait().await);

        // Only one wakeup was buffered.
        let empty = tokio::time::timeout(Duration::from_millis(50), waiter.wait()).await;
        assert!(empty.is_err(), "no second wakeup pending");
    }
}
