//! `SynchronousSource`: a [`Source`] run on its own OS thread, so callers on
//! a plain synchronous call stack can still publish values.
//!
//! Grounded on `python/metricq/synchronous_source.py`'s thread-owned event
//! loop plus `connect()`'s cross-thread ready signal; the Rust shape follows
//! §5's "single scheduler owns all Agent state" rule by keeping the `Source`
//! itself on the dedicated thread's `LocalSet` for its entire lifetime and
//! only crossing threads with plain, `Send` command/reply values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as sync_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{AgentConfig, DataClientConfig};
use crate::error::AgentError;
use crate::source::Source;
use crate::time::{Timedelta, Timestamp};

static THREAD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-wide unique thread name, the Rust equivalent of a monotonic
/// counter guarded by a lock: an atomic fetch-add needs no lock at all.
fn next_thread_name() -> String {
    let id = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("metricq-source-{id}")
}

enum Command {
    Send {
        metric: String,
        time: Timestamp,
        value: f64,
        reply: Option<sync_mpsc::Sender<Result<(), AgentError>>>,
    },
    DeclareMetrics {
        metrics: HashMap<String, Value>,
        reply: sync_mpsc::Sender<Result<(), AgentError>>,
    },
    Stop {
        reply: sync_mpsc::Sender<()>,
    },
}

/// A `Source` owned by a dedicated thread, reachable from any other thread
/// through blocking calls with timeouts.
pub struct SynchronousSource {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl SynchronousSource {
    /// Spawns the event-loop thread, connects the underlying `Source` on it,
    /// and blocks up to 60s for that connect to finish; a connect failure on
    /// the background thread is propagated back to this call.
    pub fn new(config: AgentConfig, data_config: DataClientConfig) -> Result<Self, AgentError> {
        let name = next_thread_name();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel::<Command>();
        let (ready_tx, ready_rx) = sync_mpsc::channel::<Result<(), AgentError>>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_event_loop(config, data_config, commands_rx, ready_tx))
            .map_err(|e| {
                AgentError::SynchronousSourceError(format!("failed to spawn {thread_name}: {e}"))
            })?;

        match ready_rx.recv_timeout(Duration::from_secs(60)) {
            Ok(Ok(())) => Ok(SynchronousSource {
                name,
                commands: commands_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_timeout) => Err(AgentError::SynchronousSourceError(format!(
                "{name} did not become ready within 60s"
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules `Source::send` on the event-loop thread. When `block`, waits
    /// up to `timeout` for the publish to finish and returns its result; a
    /// non-blocking send's errors are only logged on the event-loop thread,
    /// matching the original implementation's "never reject a steady-state
    /// send just because a reconnect is in flight" behaviour.
    pub fn send(
        &self,
        metric: &str,
        time: Timestamp,
        value: f64,
        block: bool,
        timeout: Timedelta,
    ) -> Result<(), AgentError> {
        let reply = if block {
            let (tx, rx) = sync_mpsc::channel();
            self.dispatch(Command::Send {
                metric: metric.to_string(),
                time,
                value,
                reply: Some(tx),
            })?;
            return match rx.recv_timeout(timeout.as_duration()) {
                Ok(result) => result,
                Err(_timeout) => Err(AgentError::SynchronousSourceError(format!(
                    "send({metric:?}) on {} timed out after {timeout}",
                    self.name
                ))),
            };
        } else {
            None
        };
        self.dispatch(Command::Send {
            metric: metric.to_string(),
            time,
            value,
            reply,
        })
    }

    /// Schedules `Source::declare_metrics` on the event-loop thread and
    /// blocks for its result.
    pub fn declare_metrics(
        &self,
        metrics: HashMap<String, Value>,
        timeout: Timedelta,
    ) -> Result<(), AgentError> {
        let (tx, rx) = sync_mpsc::channel();
        self.dispatch(Command::DeclareMetrics { metrics, reply: tx })?;
        match rx.recv_timeout(timeout.as_duration()) {
            Ok(result) => result,
            Err(_timeout) => Err(AgentError::SynchronousSourceError(format!(
                "declare_metrics on {} timed out after {timeout}",
                self.name
            ))),
        }
    }

    /// Schedules the underlying `Source`'s stop, waits up to `timeout` for it
    /// to acknowledge, then joins the event-loop thread.
    pub fn stop(&mut self, timeout: Timedelta) -> Result<(), AgentError> {
        let (tx, rx) = sync_mpsc::channel();
        if self.commands.send(Command::Stop { reply: tx }).is_ok() {
            if rx.recv_timeout(timeout.as_duration()).is_err() {
                log::warn!("{} did not acknowledge stop within {timeout}", self.name);
            }
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                AgentError::SynchronousSourceError(format!("{} panicked", self.name))
            })?;
        }
        Ok(())
    }

    fn dispatch(&self, command: Command) -> Result<(), AgentError> {
        self.commands.send(command).map_err(|_| {
            AgentError::SynchronousSourceError(format!("{} event loop is gone", self.name))
        })
    }
}

impl Drop for SynchronousSource {
    /// Best-effort: if the caller never called `stop()`, ask the event loop
    /// to wind down anyway. Does not join — a wedged event loop must not hang
    /// an unrelated drop.
    fn drop(&mut self) {
        if self.thread.is_some() {
            let (tx, _rx) = sync_mpsc::channel();
            let _ = self.commands.send(Command::Stop { reply: tx });
        }
    }
}

/// Runs on the dedicated thread for the lifetime of the `SynchronousSource`:
/// builds a current-thread runtime and `LocalSet`, connects `source`, reports
/// readiness, then drives command processing and the `Source`'s own
/// background tasks (reconnect loop, watchdog) concurrently from the same
/// `run_until` future so they keep progressing between commands, not just
/// while one is in flight.
fn run_event_loop(
    config: AgentConfig,
    data_config: DataClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: sync_mpsc::Sender<Result<(), AgentError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(AgentError::SynchronousSourceError(format!(
                "failed to build event loop runtime: {e}"
            ))));
            return;
        }
    };
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let mut source = Source::new(config, data_config);
        if let Err(e) = source.connect().await {
            let _ = ready.send(Err(e));
            return;
        }
        let _ = ready.send(Ok(()));

        while let Some(command) = commands.recv().await {
            match command {
                Command::Send {
                    metric,
                    time,
                    value,
                    reply,
                } => {
                    let result = source.send(&metric, time, value).await;
                    if let Err(ref e) = result {
                        log::warn!("synchronous source send({metric:?}) failed: {e}");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::DeclareMetrics { metrics, reply } => {
                    let result = source.declare_metrics(metrics).await;
                    let _ = reply.send(result);
                }
                Command::Stop { reply } => {
                    source.stop().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_names_are_unique_and_monotonic() {
        let a = next_thread_name();
        let b = next_thread_name();
        assert_ne!(a, b);
        assert!(a.starts_with("metricq-source-"));
        assert!(b.starts_with("metricq-source-"));
    }
}
