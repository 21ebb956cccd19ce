//! `HistoryClient`: a `Client` that opens a third (history) connection to
//! request stored time-series, with a typed, mode-aware response.
//!
//! Grounded on `python/metricq/history_client.py`'s `history_data_request`
//! and `handle_register_response`; the request-type enum and the
//! values/aggregates convert projections follow §4.8/§8.P8 of the
//! specification (not present in the retrieved `original_source`, which
//! predates the aggregate/legacy response modes).

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ExchangeKind};
use metricq_proto::{HistoryRequest as WireHistoryRequest, HistoryResponse as WireHistoryResponse, HistoryResponseType as WireHistoryResponseType};
use prost::Message;
use rustc_hash::FxHashMap;
use serde_json::Map;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::config::{AgentConfig, DataClientConfig};
use crate::data_client::{apply_credentials, open_connection, OpenConnection};
use crate::error::AgentError;
use crate::time::{TimeAggregate, Timedelta, TimeValue, Timestamp};
use crate::watchdog::ConnectionWatchdog;

/// The four request shapes the history store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRequestType {
    AggregateTimeline,
    Aggregate,
    LastValue,
    FlexTimeline,
}

impl HistoryRequestType {
    fn to_wire(self) -> WireHistoryResponseType {
        match self {
            HistoryRequestType::AggregateTimeline => WireHistoryResponseType::AggregateTimeline,
            HistoryRequestType::Aggregate => WireHistoryResponseType::Aggregate,
            HistoryRequestType::LastValue => WireHistoryResponseType::LastValue,
            HistoryRequestType::FlexTimeline => WireHistoryResponseType::FlexTimeline,
        }
    }
}

/// Which of the three mutually exclusive repeated fields a `HistoryResponse`
/// populated, detected by length against `time_delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryMode {
    Aggregates,
    Values,
    Legacy,
}

/// Ambient metadata carried alongside a history response: the broker's
/// `x-request-duration` header, if present.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryResponseMeta {
    pub server_duration: Option<Duration>,
}

/// A decoded, mode-detected `HistoryResponse`.
#[derive(Debug, Clone)]
pub struct HistoryResult {
    mode: HistoryMode,
    timestamps: Vec<Timestamp>,
    value: Vec<f64>,
    aggregate: Vec<metricq_proto::HistoryResponseAggregate>,
    value_min: Vec<f64>,
    value_max: Vec<f64>,
    value_avg: Vec<f64>,
    pub meta: HistoryResponseMeta,
}

impl HistoryResult {
    fn decode(wire: WireHistoryResponse, meta: HistoryResponseMeta) -> Result<Self, AgentError> {
        let n = wire.time_delta.len();
        let aggregate_ok = wire.aggregate.len() == n && !wire.aggregate.is_empty();
        let value_ok = wire.value.len() == n && !wire.value.is_empty();
        let legacy_ok = wire.value_min.len() == n
            && wire.value_max.len() == n
            && wire.value_avg.len() == n
            && !wire.value_min.is_empty();

        let mode = match (aggregate_ok, value_ok, legacy_ok) {
            (true, false, false) => HistoryMode::Aggregates,
            (false, true, false) => HistoryMode::Values,
            (false, false, true) => HistoryMode::Legacy,
            (false, false, false) if n == 0 => HistoryMode::Values,
            _ => {
                return Err(AgentError::MalformedChunk(format!(
                    "history response has {} time_delta entries but an inconsistent mix of aggregate={}, value={}, legacy={}/{}/{} entries",
                    n,
                    wire.aggregate.len(),
                    wire.value.len(),
                    wire.value_min.len(),
                    wire.value_max.len(),
                    wire.value_avg.len()
                )))
            }
        };

        let mut absolute = 0i64;
        let timestamps = wire
            .time_delta
            .iter()
            .map(|&delta| {
                absolute += delta;
                Timestamp::from_ns(absolute)
            })
            .collect();

        Ok(HistoryResult {
            mode,
            timestamps,
            value: wire.value,
            aggregate: wire.aggregate,
            value_min: wire.value_min,
            value_max: wire.value_max,
            value_avg: wire.value_avg,
            meta,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Decoded `(timestamp, value)` pairs. Only valid without conversion when
    /// the response was already in VALUES mode; `convert=true` additionally
    /// accepts AGGREGATES (projected to its mean) and LEGACY (its `value_avg`).
    pub fn values(&self, convert: bool) -> Result<Vec<TimeValue>, AgentError> {
        match self.mode {
            HistoryMode::Values => Ok(self
                .timestamps
                .iter()
                .zip(&self.value)
                .map(|(&t, &v)| TimeValue::new(t, v))
                .collect()),
            HistoryMode::Aggregates if convert => Ok(self
                .timestamps
                .iter()
                .zip(&self.aggregate)
                .map(|(&t, a)| TimeValue::new(t, to_time_aggregate(t, a).mean()))
                .collect()),
            HistoryMode::Legacy if convert => Ok(self
                .timestamps
                .iter()
                .zip(&self.value_avg)
                .map(|(&t, &v)| TimeValue::new(t, v))
                .collect()),
            other => Err(AgentError::MalformedChunk(format!(
                "history response is in {other:?} mode, not VALUES, and convert=false"
            ))),
        }
    }

    /// Decoded aggregate windows. Only valid without conversion when the
    /// response was already in AGGREGATES mode; `convert=true` additionally
    /// re-projects VALUES (one-point aggregates from successive deltas,
    /// skipping the first point) and LEGACY (`active_time=0`, `integral=0`).
    pub fn aggregates(&self, convert: bool) -> Result<Vec<TimeAggregate>, AgentError> {
        match self.mode {
            HistoryMode::Aggregates => Ok(self
                .timestamps
                .iter()
                .zip(&self.aggregate)
                .map(|(&t, a)| to_time_aggregate(t, a))
                .collect()),
            HistoryMode::Values if convert => Ok((1..self.timestamps.len())
                .map(|i| {
                    TimeAggregate::from_value_pair(
                        self.timestamps[i - 1],
                        self.timestamps[i],
                        self.value[i],
                    )
                })
                .collect()),
            HistoryMode::Legacy if convert => Ok(self
                .timestamps
                .iter()
                .zip(self.value_min.iter().zip(self.value_max.iter().zip(&self.value_avg)))
                .map(|(&t, (&minimum, (&maximum, &avg)))| TimeAggregate {
                    timestamp: t,
                    minimum,
                    maximum,
                    sum: avg,
                    count: 1,
                    integral: 0.0,
                    active_time: Timedelta::ZERO,
                })
                .collect()),
            other => Err(AgentError::MalformedChunk(format!(
                "history response is in {other:?} mode, not AGGREGATES, and convert=false"
            ))),
        }
    }
}

fn to_time_aggregate(timestamp: Timestamp, a: &metricq_proto::HistoryResponseAggregate) -> TimeAggregate {
    TimeAggregate {
        timestamp,
        minimum: a.minimum,
        maximum: a.maximum,
        sum: a.sum,
        count: a.count,
        integral: a.integral,
        active_time: Timedelta::from_ns(a.active_time),
    }
}

pub const HISTORY_EXCHANGE_KIND: ExchangeKind = ExchangeKind::Topic;

struct PendingRequest {
    reply: oneshot::Sender<(WireHistoryResponse, HistoryResponseMeta)>,
}

struct HistoryConnection {
    open: OpenConnection,
    exchange: String,
    response_queue: String,
}

pub struct HistoryClient {
    client: Client,
    data_config: DataClientConfig,
    connection: Rc<RefCell<Option<HistoryConnection>>>,
    watchdog: Arc<ConnectionWatchdog>,
    pending: Rc<RefCell<FxHashMap<String, PendingRequest>>>,
}

impl Deref for HistoryClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for HistoryClient {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl HistoryClient {
    pub fn new(config: AgentConfig, data_config: DataClientConfig) -> Self {
        let mut handlers = crate::client::base_handlers();
        handlers.register("config", crate::rpc::noop_config_handler());
        let timeout = data_config.connection_timeout(config.connection_timeout);
        HistoryClient {
            client: Client::new(config, handlers),
            data_config,
            connection: Rc::new(RefCell::new(None)),
            watchdog: ConnectionWatchdog::new("history connection", timeout),
            pending: Rc::new(RefCell::new(FxHashMap::default())),
        }
    }

    /// Connects the underlying client, then `history.register`s to obtain the
    /// history connection's address, exchange and per-client response queue,
    /// opens that connection, and starts consuming the response queue.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.client.connect().await?;

        let response = self.client.rpc("history.register", Map::new()).await?;
        let server_address = response
            .get("dataServerAddress")
            .or_else(|| response.get("historyServerAddress"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope(
                    "history.register reply missing dataServerAddress/historyServerAddress".to_string(),
                )
            })?
            .to_string();
        let exchange = response
            .get("historyExchange")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope("history.register reply missing historyExchange".to_string())
            })?
            .to_string();
        let response_queue = response
            .get("historyQueue")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope("history.register reply missing historyQueue".to_string())
            })?
            .to_string();

        let address = apply_credentials(&server_address, &self.client.config.management_url)?;
        let open = open_connection("history connection", address, &self.data_config, &self.watchdog).await?;
        self.watchdog.set_established();

        open.channel
            .exchange_declare(
                &exchange,
                HISTORY_EXCHANGE_KIND,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;
        open.channel
            .queue_declare(
                &response_queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;

        if let Some(config) = response.get("config").and_then(serde_json::Value::as_object) {
            let args = crate::rpc::RpcArgs {
                from_token: None,
                arguments: config.clone(),
            };
            self.client.agent.handlers.dispatch("config", args).await?;
        }

        *self.connection.borrow_mut() = Some(HistoryConnection {
            open,
            exchange,
            response_queue: response_queue.clone(),
        });

        self.spawn_response_consume(response_queue).await
    }

    async fn spawn_response_consume(&self, response_queue: String) -> Result<(), AgentError> {
        let channel = {
            let guard = self.connection.borrow();
            guard
                .as_ref()
                .ok_or(AgentError::NotConnected("history connection"))?
                .open
                .channel
                .clone()
        };
        let mut consumer = channel
            .basic_consume(
                &response_queue,
                &format!("{}-history-consumer", self.client.token()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;

        let pending = Rc::clone(&self.pending);
        tokio::task::spawn_local(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log::error!("history response consumer error: {e}");
                        break;
                    }
                };
                match handle_history_response(&pending, &delivery) {
                    Ok(()) => {
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    }
                    Err(e) => {
                        log::warn!("failed to handle history response, requeuing: {e}");
                        let _ = delivery.reject(BasicRejectOptions { requeue: true }).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Issues a `HistoryRequest` for `metric` and awaits the matching
    /// response, correlated by a freshly generated correlation ID, timing out
    /// after `timeout` (default 60s, matching [`crate::config::AgentConfig::rpc_timeout`]
    /// when `None`).
    pub async fn history_data_request(
        &self,
        metric: &str,
        start_time: Option<Timestamp>,
        end_time: Option<Timestamp>,
        interval_max: Option<Timedelta>,
        request_type: HistoryRequestType,
        timeout: Option<Timedelta>,
    ) -> Result<HistoryResult, AgentError> {
        let timeout = timeout.unwrap_or(self.client.config.rpc_timeout);
        let (exchange, response_queue) = {
            let guard = self.connection.borrow();
            let connection = guard.as_ref().ok_or(AgentError::NotConnected("history connection"))?;
            (connection.exchange.clone(), connection.response_queue.clone())
        };

        let correlation_id = format!(
            "metricq-history-rs-{}-{}",
            self.client.token(),
            uuid::Uuid::new_v4().simple()
        );
        let request = WireHistoryRequest {
            start_time: start_time.map(Timestamp::posix_ns).unwrap_or(0),
            end_time: end_time.map(Timestamp::posix_ns).unwrap_or(0),
            interval_max: interval_max.map(Timedelta::ns).unwrap_or(0),
            r#type: request_type.to_wire() as i32,
        };
        let body = request.encode_to_vec();

        let (tx, rx) = oneshot::channel();
        self.pending
            .borrow_mut()
            .insert(correlation_id.clone(), PendingRequest { reply: tx });

        let channel = {
            let guard = self.connection.borrow();
            guard
                .as_ref()
                .ok_or(AgentError::NotConnected("history connection"))?
                .open
                .channel
                .clone()
        };
        let properties = BasicProperties::default()
            .with_app_id(self.client.token().to_string().into())
            .with_correlation_id(correlation_id.clone().into())
            .with_reply_to(response_queue.into());

        let publish = channel
            .basic_publish(
                &exchange,
                metric,
                lapin::options::BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await;
        if let Err(e) = publish {
            self.pending.borrow_mut().remove(&correlation_id);
            return Err(AgentError::RpcRequestError(metric.to_string(), e));
        }

        match tokio::time::timeout(timeout.as_duration(), rx).await {
            Ok(Ok((wire, meta))) => HistoryResult::decode(wire, meta),
            Ok(Err(_canceled)) => Err(AgentError::HistoryTimeout(metric.to_string())),
            Err(_elapsed) => {
                self.pending.borrow_mut().remove(&correlation_id);
                Err(AgentError::HistoryTimeout(metric.to_string()))
            }
        }
    }

    /// `AGGREGATE_TIMELINE`-family request with all times/interval unset and
    /// `type=LAST_VALUE`, expecting exactly one result; returns that single
    /// `(timestamp, value)` pair.
    pub async fn history_last_value(&self, metric: &str) -> Result<TimeValue, AgentError> {
        let result = self
            .history_data_request(metric, None, None, None, HistoryRequestType::LastValue, None)
            .await?;
        let values = result.values(true)?;
        if values.len() != 1 {
            return Err(AgentError::MalformedChunk(format!(
                "history_last_value for {metric:?} expected exactly one result, got {}",
                values.len()
            )));
        }
        Ok(values[0])
    }
}

fn handle_history_response(
    pending: &Rc<RefCell<FxHashMap<String, PendingRequest>>>,
    delivery: &lapin::message::Delivery,
) -> Result<(), AgentError> {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|s| s.to_string())
        .ok_or_else(|| AgentError::InvalidRpcEnvelope("history response missing correlation_id".to_string()))?;

    let entry = pending.borrow_mut().remove(&correlation_id);
    let entry = match entry {
        Some(entry) => entry,
        None => {
            log::debug!("dropping history response with unknown correlation id {correlation_id:?}");
            return Ok(());
        }
    };

    let wire = WireHistoryResponse::decode(delivery.data.as_slice())
        .map_err(|e| AgentError::MalformedChunk(format!("failed to decode HistoryResponse: {e}")))?;
    let server_duration = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get("x-request-duration"))
        .and_then(|value| match value {
            AMQPValue::Double(f) => Some(*f),
            AMQPValue::Float(f) => Some(*f as f64),
            AMQPValue::LongLongInt(i) => Some(*i as f64),
            AMQPValue::LongInt(i) => Some(*i as f64),
            _ => None,
        })
        .filter(|seconds| *seconds >= 0.0)
        .map(Duration::from_secs_f64);

    let _ = entry.reply.send((wire, HistoryResponseMeta { server_duration }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_values(deltas: Vec<i64>, values: Vec<f64>) -> WireHistoryResponse {
        WireHistoryResponse {
            time_delta: deltas,
            value: values,
            ..Default::default()
        }
    }

    #[test]
    fn decodes_values_mode() {
        let wire = wire_values(vec![1_000, 500], vec![1.0, 2.0]);
        let result = HistoryResult::decode(wire, HistoryResponseMeta::default()).unwrap();
        let values = result.values(false).unwrap();
        assert_eq!(values[0].timestamp, Timestamp::from_ns(1_000));
        assert_eq!(values[1].timestamp, Timestamp::from_ns(1_500));
    }

    #[test]
    fn rejects_inconsistent_mode() {
        let wire = WireHistoryResponse {
            time_delta: vec![1, 2, 3],
            value: vec![1.0],
            value_min: vec![1.0],
            value_max: vec![2.0],
            ..Default::default()
        };
        assert!(matches!(
            HistoryResult::decode(wire, HistoryResponseMeta::default()),
            Err(AgentError::MalformedChunk(_))
        ));
    }

    #[test]
    fn aggregates_convert_over_values_skips_first_point() {
        let wire = wire_values(vec![0, 1_000_000_000, 1_000_000_000], vec![1.0, 2.0, 3.0]);
        let result = HistoryResult::decode(wire, HistoryResponseMeta::default()).unwrap();
        let aggregates = result.aggregates(true).unwrap();
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].active_time, Timedelta::from_s(1.0));
        assert_eq!(aggregates[0].integral, 1_000_000_000.0 * 2.0);
        assert_eq!(aggregates[0].mean(), 2.0);
    }

    #[test]
    fn values_without_convert_rejects_non_values_mode() {
        let wire = WireHistoryResponse {
            time_delta: vec![1_000],
            aggregate: vec![metricq_proto::HistoryResponseAggregate {
                minimum: 1.0,
                maximum: 1.0,
                sum: 1.0,
                count: 1,
                integral: 0.0,
                active_time: 0,
            }],
            ..Default::default()
        };
        let result = HistoryResult::decode(wire, HistoryResponseMeta::default()).unwrap();
        assert!(result.values(false).is_err());
        assert!(result.values(true).is_ok());
    }
}
