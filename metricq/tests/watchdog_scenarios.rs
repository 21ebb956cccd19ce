//! `ConnectionWatchdog::closed()` itself has no inline coverage in
//! `watchdog.rs` (only `established()` and the timeout path do); this
//! exercises the reconnect-detection path a `Sink`'s resubscribe loop relies
//! on: waiting for `closed()` after having been `established()`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metricq::time::Timedelta;
use metricq::watchdog::ConnectionWatchdog;

#[tokio::test]
async fn closed_resolves_after_a_prior_established_is_revoked() {
    let watchdog = ConnectionWatchdog::new("data", Timedelta::from_s(60.0));
    assert!(!watchdog.is_established());

    watchdog.set_established();
    assert!(watchdog.is_established());

    watchdog.set_closed();
    assert!(!watchdog.is_established());

    tokio::time::timeout(Duration::from_millis(50), watchdog.closed())
        .await
        .expect("closed() should resolve immediately once already closed");
}

#[tokio::test]
async fn multiple_observers_see_the_same_transition() {
    let watchdog = ConnectionWatchdog::new("data", Timedelta::from_s(60.0));
    let observed = Arc::new(AtomicUsize::new(0));

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut waiters = Vec::new();
            for _ in 0..3 {
                let watchdog = Arc::clone(&watchdog);
                let observed = Arc::clone(&observed);
                waiters.push(tokio::task::spawn_local(async move {
                    watchdog.established().await;
                    observed.fetch_add(1, Ordering::SeqCst);
                }));
            }

            // Give every waiter a chance to register before the transition.
            tokio::task::yield_now().await;
            watchdog.set_established();

            for waiter in waiters {
                waiter.await.unwrap();
            }
        })
        .await;

    assert_eq!(observed.load(Ordering::SeqCst), 3);
}
