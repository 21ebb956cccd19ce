//! Per-connection liveness watchdog.
//!
//! Promotes "the broker client keeps retrying forever" into a bounded,
//! observable timeout. `established()`/`closed()` are exposed as async
//! predicates so publishers can defer sending while a reconnect is underway,
//! the same role `tokio_util::sync::CancellationToken` plays for pipeline
//! shutdown in the teacher's agent runtime.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::time::Timedelta;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Never connected yet, or connected and then lost again.
    Disconnected = 0,
    Connected = 1,
}

/// Information handed to the timeout callback: which connection, and how
/// long it waited.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTimeout {
    pub connection_name: &'static str,
    pub timeout: Timedelta,
}

// Not `Send`/`Sync`: like `RpcHandler` (see `rpc.rs`), this callback runs on
// the single current-thread scheduler that owns its agent, and routinely
// closes over `Rc`-shared agent state (the stop-signal sender).
pub type OnTimeout = Rc<dyn Fn(WatchdogTimeout) -> Pin<Box<dyn Future<Output = ()>>>>;

/// Liveness watchdog for one broker connection.
///
/// `established_tx` is the single source of truth: `true` once
/// `set_established` has been called and no `set_closed` has followed.
/// `phase` only exists to make `Disconnected` vs. `Connected` legible in
/// logs without re-deriving it from the watch value each time.
pub struct ConnectionWatchdog {
    connection_name: &'static str,
    timeout: Timedelta,
    phase: AtomicU8,
    active: AtomicBool,
    established_tx: watch::Sender<bool>,
    established_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl ConnectionWatchdog {
    pub fn new(connection_name: &'static str, timeout: Timedelta) -> Arc<Self> {
        let (established_tx, established_rx) = watch::channel(false);
        Arc::new(ConnectionWatchdog {
            connection_name,
            timeout,
            phase: AtomicU8::new(Phase::Disconnected as u8),
            active: AtomicBool::new(false),
            established_tx,
            established_rx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn connection_name(&self) -> &'static str {
        self.connection_name
    }

    pub fn timeout(&self) -> Timedelta {
        self.timeout
    }

    /// Spawns the background timeout task. A second call before `stop()` is
    /// a no-op, logged at debug: the watchdog is already watching.
    pub fn start(self: &Arc<Self>, on_timeout: OnTimeout) -> Option<JoinHandle<()>> {
        if self.active.swap(true, Ordering::SeqCst) {
            log::debug!(
                "connection watchdog for {} already running, ignoring duplicate start()",
                self.connection_name
            );
            return None;
        }
        let watchdog = Arc::clone(self);
        Some(tokio::task::spawn_local(async move {
            watchdog.run(on_timeout).await;
        }))
    }

    async fn run(self: Arc<Self>, on_timeout: OnTimeout) {
        let mut rx = self.established_rx.clone();
        loop {
            let wait_established = rx.wait_for(|established| *established);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = tokio::time::timeout(self.timeout.as_duration(), wait_established) => {
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) => return, // sender dropped, watchdog orphaned
                        Err(_elapsed) => {
                            log::warn!(
                                "{} did not reestablish within {}",
                                self.connection_name, self.timeout
                            );
                            on_timeout(WatchdogTimeout {
                                connection_name: self.connection_name,
                                timeout: self.timeout,
                            }).await;
                            return;
                        }
                    }
                }
            }

            let wait_closed = rx.wait_for(|established| !*established);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = wait_closed => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Atomically marks the connection established. Any in-flight
    /// `established()` awaiter observes `true` in the same scheduling turn.
    pub fn set_established(&self) {
        self.phase.store(Phase::Connected as u8, Ordering::SeqCst);
        let _ = self.established_tx.send(true);
    }

    pub fn set_closed(&self) {
        self.phase.store(Phase::Disconnected as u8, Ordering::SeqCst);
        let _ = self.established_tx.send(false);
    }

    pub fn is_established(&self) -> bool {
        *self.established_rx.borrow()
    }

    /// Awaits until the connection is established.
    pub async fn established(&self) {
        let mut rx = self.established_rx.clone();
        let _ = rx.wait_for(|established| *established).await;
    }

    /// Awaits until the connection is (or becomes) closed.
    pub async fn closed(&self) {
        let mut rx = self.established_rx.clone();
        let _ = rx.wait_for(|established| !*established).await;
    }

    /// Idempotently cancels the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.active.store(false, Ordering::SeqCst);
    }

    /// The cancellation token backing `stop()`, shared with the reconnect
    /// loop a `DataClient` spawns alongside this watchdog so both stop
    /// together.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn established_resolves_immediately_once_set() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let watchdog = ConnectionWatchdog::new("test", Timedelta::from_s(10.0));
                watchdog.set_established();
                tokio::time::timeout(Duration::from_millis(50), watchdog.established())
                    .await
                    .expect("established() should resolve without waiting");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_timeout_exactly_once_when_never_established() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let watchdog = ConnectionWatchdog::new("test", Timedelta::from_ms(10.0));
                let fired = Arc::new(AtomicBool::new(false));
                let fired_clone = Arc::clone(&fired);
                let on_timeout: OnTimeout = Rc::new(move |_info| {
                    let fired = Arc::clone(&fired_clone);
                    Box::pin(async move {
                        fired.store(true, Ordering::SeqCst);
                    })
                });
                let handle = watchdog.start(on_timeout).unwrap();
                handle.await.unwrap();
                assert!(fired.load(Ordering::SeqCst));
            })
            .await;
    }

    #[test]
    fn second_start_before_stop_is_a_noop() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, async {
            let watchdog = ConnectionWatchdog::new("test", Timedelta::from_s(60.0));
            let on_timeout: OnTimeout = Rc::new(|_info| Box::pin(async {}));
            let first = watchdog.start(on_timeout.clone());
            assert!(first.is_some());
            let second = watchdog.start(on_timeout);
            assert!(second.is_none());
            watchdog.stop();
        });
    }
}
