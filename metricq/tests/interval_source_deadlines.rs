//! `IntervalSource`'s monotonic deadline loop: a slow `update()` call must not
//! cause the following calls to pile up or run in parallel, and successive
//! entry times must never be closer together than the configured period.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use metricq::config::{AgentConfig, DataClientConfig};
use metricq::source::{IntervalSource, Source, UpdateSource};
use metricq::time::{Timedelta, Timestamp};

struct RecordingUpdate {
    entries: Rc<RefCell<Vec<Timestamp>>>,
    slow_once: Rc<RefCell<bool>>,
}

impl UpdateSource for RecordingUpdate {
    async fn update(&mut self, _source: &mut Source) -> anyhow::Result<()> {
        self.entries.borrow_mut().push(Timestamp::now());
        if *self.slow_once.borrow() {
            *self.slow_once.borrow_mut() = false;
            // Longer than the period below: forces at least one missed
            // deadline, which the loop must skip forward past rather than
            // queue up.
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn a_slow_update_is_caught_up_without_parallel_invocations() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let period = Timedelta::from_ms(100.0);
            let entries = Rc::new(RefCell::new(Vec::new()));
            let slow_once = Rc::new(RefCell::new(true));

            let source = Source::new(
                AgentConfig::new("amqp://localhost/", "test-interval-source"),
                DataClientConfig::default(),
            );
            let update = RecordingUpdate {
                entries: Rc::clone(&entries),
                slow_once: Rc::clone(&slow_once),
            };
            let interval = IntervalSource::new(source, update, period);

            let task = tokio::task::spawn_local(async move {
                let _ = interval.task().await;
                interval
            });

            // Let the paused clock auto-advance through several periods,
            // including the one slow iteration.
            tokio::time::sleep(Duration::from_millis(900)).await;
            let entries_snapshot = entries.borrow().clone();
            assert!(
                entries_snapshot.len() >= 4,
                "expected several update() calls by now, got {}",
                entries_snapshot.len()
            );

            for pair in entries_snapshot.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(
                    gap >= period,
                    "successive update() entries must be at least one period apart, got {gap}"
                );
            }

            task.abort();
            let _ = task.await;
        })
        .await;
}
