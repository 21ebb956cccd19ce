//! `Source`: a `DataClient` that publishes metric values to the data
//! exchange, plus `IntervalSource`, a periodic driver built on top of it.
//!
//! Grounded on `python/metricq/source.py`, `source_metric.py` and
//! `interval_source.py`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};

use futures::future::join_all;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use prost::Message;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::chunk::DataChunk;
use crate::config::{AgentConfig, DataClientConfig};
use crate::data_client::DataClient;
use crate::error::AgentError;
use crate::rpc::RpcArgs;
use crate::time::{Timedelta, TimeValue, Timestamp};

/// Per-metric chunk builder owned by a [`Source`].
///
/// `previous_timestamp` is the absolute time of the last appended sample (0
/// after a flush, matching a fresh chunk's delta-from-0 invariant); created
/// lazily the first time a metric id is looked up, destroyed with the owning
/// `Source`.
pub struct SourceMetric {
    id: String,
    previous_timestamp: i64,
    pending: Vec<TimeValue>,
    chunk_size: usize,
}

impl SourceMetric {
    fn new(id: String, chunk_size: usize) -> Self {
        SourceMetric {
            id,
            previous_timestamp: 0,
            pending: Vec::new(),
            chunk_size,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Appends a sample, synchronously, without flushing. Like `send` but the
    /// caller decides when to flush.
    pub fn append(&mut self, time: Timestamp, value: f64) {
        self.pending.push(TimeValue::new(time, value));
        self.previous_timestamp = time.posix_ns();
    }

    fn should_flush(&self) -> bool {
        self.chunk_size > 0 && self.pending.len() >= self.chunk_size
    }

    /// Drains the pending samples into a wire chunk, if any, and resets the
    /// per-metric delta baseline to 0.
    fn take_chunk(&mut self) -> Option<metricq_proto::DataChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.pending);
        self.previous_timestamp = 0;
        Some(DataChunk::encode(&samples, 0))
    }
}

/// The user-supplied periodic update hook run by [`IntervalSource`].
///
/// Grounded on the teacher's small, single-required-method source traits:
/// one method, returning a plain future, no blanket default that would hide
/// a missing implementation.
pub trait UpdateSource {
    fn update(&mut self, source: &mut Source) -> impl Future<Output = anyhow::Result<()>>;
}

pub struct Source {
    data_client: DataClient,
    starting_time: Timestamp,
    data_exchange: RefCell<Option<String>>,
    metrics: RefCell<FxHashMap<String, SourceMetric>>,
    default_chunk_size: usize,
}

impl Deref for Source {
    type Target = DataClient;
    fn deref(&self) -> &DataClient {
        &self.data_client
    }
}

impl DerefMut for Source {
    fn deref_mut(&mut self) -> &mut DataClient {
        &mut self.data_client
    }
}

impl Source {
    pub fn new(config: AgentConfig, data_config: DataClientConfig) -> Self {
        let mut extra = crate::rpc::HandlerRegistry::new();
        extra.register("config", crate::rpc::noop_config_handler());
        let (client, data, data_watchdog, reconnect_hook) =
            DataClient::new_with_handlers(config, data_config.clone(), extra);
        Source {
            data_client: DataClient {
                client,
                data,
                data_config,
                data_watchdog,
                reconnect_hook,
            },
            starting_time: Timestamp::now(),
            data_exchange: RefCell::new(None),
            metrics: RefCell::new(FxHashMap::default()),
            default_chunk_size: 1,
        }
    }

    /// The chunk size newly looked-up metrics are created with; `0` or `1`
    /// means "flush every sample".
    pub fn with_default_chunk_size(mut self, chunk_size: usize) -> Self {
        self.default_chunk_size = chunk_size;
        self
    }

    /// Connects the underlying client, registers as a source, opens the data
    /// connection the manager hands back, declares the data exchange
    /// (passive — it must already exist), and dispatches any inline `config`
    /// from the register reply.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.data_client.connect().await?;

        let response = self.data_client.rpc("source.register", Map::new()).await?;
        let data_server_address = response
            .get("dataServerAddress")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope(
                    "source.register reply missing dataServerAddress".to_string(),
                )
            })?
            .to_string();
        let data_exchange = response
            .get("dataExchange")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope(
                    "source.register reply missing dataExchange".to_string(),
                )
            })?
            .to_string();

        self.data_client.open_data_connection(data_server_address).await?;

        let channel = self.data_client.data_channel()?;
        channel
            .exchange_declare(
                &data_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;
        *self.data_exchange.borrow_mut() = Some(data_exchange);

        if let Some(config) = response.get("config").and_then(Value::as_object) {
            let args = RpcArgs {
                from_token: None,
                arguments: config.clone(),
            };
            self.data_client.agent.handlers.dispatch("config", args).await?;
        }

        Ok(())
    }

    pub fn uptime(&self) -> Timedelta {
        Timestamp::now() - self.starting_time
    }

    /// Declares metadata (rate, unit, description, location, ...) for a set
    /// of metrics, keyed by name.
    pub async fn declare_metrics(&self, metrics: HashMap<String, Value>) -> Result<(), AgentError> {
        let mut arguments = Map::new();
        arguments.insert(
            "metrics".to_string(),
            serde_json::to_value(metrics).map_err(AgentError::MalformedEnvelope)?,
        );
        self.data_client.rpc("source.declare_metrics", arguments).await?;
        Ok(())
    }

    /// Logical send: looks up (creating lazily) the metric's `SourceMetric`
    /// and appends, flushing when its chunk size is reached.
    pub async fn send(&self, id: &str, time: Timestamp, value: f64) -> Result<(), AgentError> {
        let chunk = {
            let mut metrics = self.metrics.borrow_mut();
            let metric = metrics
                .entry(id.to_string())
                .or_insert_with(|| SourceMetric::new(id.to_string(), self.default_chunk_size));
            metric.append(time, value);
            if metric.should_flush() {
                metric.take_chunk()
            } else {
                None
            }
        };
        if let Some(chunk) = chunk {
            self.send_chunk(id, chunk).await?;
        }
        Ok(())
    }

    /// Flushes every non-empty metric's pending chunk concurrently.
    pub async fn flush(&self) -> Result<(), AgentError> {
        let chunks: Vec<(String, metricq_proto::DataChunk)> = {
            let mut metrics = self.metrics.borrow_mut();
            metrics
                .values_mut()
                .filter(|metric| !metric.is_empty())
                .filter_map(|metric| metric.take_chunk().map(|chunk| (metric.id.clone(), chunk)))
                .collect()
        };
        let sends = chunks
            .into_iter()
            .map(|(id, chunk)| async move { self.send_chunk(&id, chunk).await });
        for result in join_all(sends).await {
            result?;
        }
        Ok(())
    }

    /// Actual publish of a chunk; not called from anywhere but `send`/`flush`.
    /// Awaits the data watchdog's `established` first, so a reconnect defers
    /// publishing rather than failing outright; one chunk may still be lost
    /// if the connection drops between that check and the publish itself.
    async fn send_chunk(&self, id: &str, chunk: metricq_proto::DataChunk) -> Result<(), AgentError> {
        self.data_client.data_watchdog().established().await;
        let exchange = self
            .data_exchange
            .borrow()
            .clone()
            .ok_or(AgentError::NotConnected("data exchange"))?;
        let channel = self.data_client.data_channel()?;
        let body = chunk.encode_to_vec();
        channel
            .basic_publish(
                &exchange,
                id,
                BasicPublishOptions {
                    mandatory: false,
                    ..BasicPublishOptions::default()
                },
                &body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| AgentError::MetricSendError(id.to_string(), e))?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.data_client.stop_data_connection().await;
        self.data_client.stop(None);
    }
}

/// A [`Source`] whose `task()` drives a user [`UpdateSource`] on a fixed
/// period, rather than being called from the outside.
///
/// The deadline loop is monotonic: missed deadlines are logged and skipped
/// forward rather than causing `update()` calls to pile up.
pub struct IntervalSource<U: UpdateSource> {
    pub source: Source,
    pub update: U,
    period: Timedelta,
    stop: std::rc::Rc<tokio::sync::Notify>,
}

impl<U: UpdateSource> IntervalSource<U> {
    pub fn new(source: Source, update: U, period: Timedelta) -> Self {
        IntervalSource {
            source,
            update,
            period,
            stop: std::rc::Rc::new(tokio::sync::Notify::new()),
        }
    }

    /// Runs the deadline loop until `stop()` is called. Any in-flight
    /// `update()` call runs to completion before the loop exits; the
    /// deadline sleep itself is preempted immediately by `stop()`.
    pub async fn task(&mut self) -> anyhow::Result<()> {
        let mut deadline = Timestamp::now();
        loop {
            self.update.update(&mut self.source).await?;

            deadline = deadline + self.period;
            let mut now = Timestamp::now();
            while now >= deadline {
                log::warn!("missed deadline {deadline}, it is now {now}");
                deadline = deadline + self.period;
                now = Timestamp::now();
            }

            let sleep = tokio::time::sleep((deadline - now).as_duration());
            tokio::select! {
                _ = sleep => {}
                _ = self.stop.notified() => {
                    log::info!("stopping interval source task");
                    return Ok(());
                }
            }
        }
    }

    /// Preempts the task's deadline sleep; has no effect if no `task()` is
    /// currently awaiting it (matches the distilled spec's "stop future" —
    /// a `Notify` permit is only meaningful to a waiter already parked on it).
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

impl<U: UpdateSource> Deref for IntervalSource<U> {
    type Target = Source;
    fn deref(&self) -> &Source {
        &self.source
    }
}

impl<U: UpdateSource> DerefMut for IntervalSource<U> {
    fn deref_mut(&mut self) -> &mut Source {
        &mut self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_metric_flushes_on_chunk_size() {
        let mut metric = SourceMetric::new("test.metric".to_string(), 2);
        metric.append(Timestamp::from_ns(1_000), 1.0);
        assert!(!metric.should_flush());
        metric.append(Timestamp::from_ns(2_000), 2.0);
        assert!(metric.should_flush());

        let chunk = metric.take_chunk().unwrap();
        assert_eq!(chunk.time_delta, vec![1_000, 1_000]);
        assert_eq!(chunk.value, vec![1.0, 2.0]);
        assert!(metric.is_empty());
        assert_eq!(metric.previous_timestamp, 0);
    }

    #[test]
    fn source_metric_chunk_size_zero_means_flush_nothing_automatically() {
        let mut metric = SourceMetric::new("test.metric".to_string(), 0);
        metric.append(Timestamp::from_ns(1_000), 1.0);
        assert!(!metric.should_flush());
    }

    #[test]
    fn source_metric_previous_timestamp_tracks_last_append_between_flushes() {
        let mut metric = SourceMetric::new("test.metric".to_string(), 10);
        assert_eq!(metric.previous_timestamp, 0);
        metric.append(Timestamp::from_ns(500), 1.0);
        assert_eq!(metric.previous_timestamp, 500);
        metric.append(Timestamp::from_ns(1_500), 2.0);
        assert_eq!(metric.previous_timestamp, 1_500);
    }

    #[test]
    fn take_chunk_on_empty_metric_returns_none() {
        let mut metric = SourceMetric::new("test.metric".to_string(), 1);
        assert!(metric.take_chunk().is_none());
    }
}
