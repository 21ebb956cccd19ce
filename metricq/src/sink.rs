//! `Sink`: a `DataClient` that subscribes to metrics and decodes inbound
//! `DataChunk`s, plus the resubscribe-on-reconnect state machine.
//!
//! Grounded on `python/metricq/sink.py`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::ops::Deref;
use std::rc::Rc;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

use crate::chunk::DataChunk;
use crate::config::{AgentConfig, DataClientConfig};
use crate::data_client::DataClient;
use crate::error::AgentError;
use crate::time::{TimeValue, Timestamp};

/// Arguments remembered from the most recent `subscribe()` call so a
/// reconnect can resubscribe identically (minus the metric list, which comes
/// from `subscribed_metrics`).
#[derive(Debug, Clone, Default)]
pub struct SubscribeArgs {
    pub expires: Option<u64>,
    pub metadata: Option<bool>,
}

impl SubscribeArgs {
    fn to_json(&self, metrics: &[String], data_queue: Option<&str>) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("metrics".to_string(), Value::from(metrics.to_vec()));
        if let Some(expires) = self.expires {
            args.insert("expires".to_string(), Value::from(expires));
        }
        if let Some(metadata) = self.metadata {
            args.insert("metadata".to_string(), Value::Bool(metadata));
        }
        if let Some(data_queue) = data_queue {
            args.insert("dataQueue".to_string(), Value::String(data_queue.to_string()));
        }
        args
    }
}

struct SubscriptionState {
    data_queue_name: Option<String>,
    consumer_tag: Option<String>,
    subscribed_metrics: FxHashSet<String>,
    subscribe_args: SubscribeArgs,
}

impl SubscriptionState {
    fn new() -> Self {
        SubscriptionState {
            data_queue_name: None,
            consumer_tag: None,
            subscribed_metrics: FxHashSet::default(),
            subscribe_args: SubscribeArgs::default(),
        }
    }
}

/// The single user-override point: one call per decoded `(timestamp, value)`
/// pair in an inbound `DataChunk`.
pub trait OnData {
    fn on_data(&mut self, metric: &str, timestamp: Timestamp, value: f64) -> impl Future<Output = ()>;
}

pub struct Sink<H: OnData> {
    /// Shared so the resubscribe-on-reconnect task (spawned on the same
    /// single-threaded scheduler, see `agent.rs`) can call `rpc`/`data_channel`
    /// without Sink itself needing to be `Clone`.
    data_client: Rc<DataClient>,
    handler: Rc<RefCell<H>>,
    state: Rc<RefCell<SubscriptionState>>,
}

impl<H: OnData> Deref for Sink<H> {
    type Target = DataClient;
    fn deref(&self) -> &DataClient {
        &self.data_client
    }
}

impl<H: OnData + 'static> Sink<H> {
    /// Builds a transient sink: `token` gets a UUID suffix by default
    /// (`add_uuid_to_token`), matching `Sink.__init__(add_uuid=True)`.
    pub fn new(config: AgentConfig, data_config: DataClientConfig, handler: H) -> Self {
        let config = config.with_add_uuid_to_token(true);
        Sink {
            data_client: Rc::new(DataClient::new(config, data_config)),
            handler: Rc::new(RefCell::new(handler)),
            state: Rc::new(RefCell::new(SubscriptionState::new())),
        }
    }

    /// Connects the underlying `DataClient` and registers the resubscribe
    /// hook the data connection's reconnect loop runs on every reopen, before
    /// it reports `established()` again. Must be called before any other
    /// `Rc::clone` of the data client handle is taken, since it needs
    /// exclusive access to connect.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        Rc::get_mut(&mut self.data_client)
            .expect("Sink::connect called after the data client handle was shared")
            .client
            .connect()
            .await?;
        self.data_client
            .set_reconnect_hook(make_resubscribe_hook(
                Rc::clone(&self.data_client),
                Rc::clone(&self.handler),
                Rc::clone(&self.state),
            ));
        Ok(())
    }

    async fn declare_data_queue(&self, name: &str) -> Result<(), AgentError> {
        let channel = self.data_client.data_channel()?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;
        Ok(())
    }

    /// Starts (or restarts) consuming `data_queue` under `consumer_tag`,
    /// spawning the per-delivery decode loop on the current-thread scheduler.
    fn start_consume(&self, data_queue: String, consumer_tag: String) -> Result<(), AgentError> {
        let channel = self.data_client.data_channel()?;
        let handler = Rc::clone(&self.handler);
        let consumer_tag_for_consume = consumer_tag.clone();
        tokio::task::spawn_local(async move {
            let mut consumer = match channel
                .basic_consume(
                    &data_queue,
                    &consumer_tag_for_consume,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    log::error!("failed to start consuming sink data queue {data_queue:?}: {e}");
                    return;
                }
            };
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log::error!("sink consumer error: {e}");
                        break;
                    }
                };
                match on_data_message(&handler, &delivery).await {
                    Ok(()) => {
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    }
                    Err(e) => {
                        log::warn!("sink on_data failed, requeuing delivery: {e}");
                        let _ = delivery.reject(BasicRejectOptions { requeue: true }).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Opens the data connection (if needed) and starts consuming the
    /// manager-assigned data queue. Called once, the first time `subscribe`
    /// gets back a fresh `dataQueue`/`dataServerAddress`/`dataExchange`.
    async fn sink_config(
        &self,
        data_server_address: String,
        data_queue: String,
    ) -> Result<(), AgentError> {
        self.data_client.open_data_connection(data_server_address).await?;
        self.declare_data_queue(&data_queue).await?;

        log::info!("starting sink consume on {data_queue}");
        let consumer_tag = format!("{}-sink-consumer", self.data_client.token());
        self.start_consume(data_queue.clone(), consumer_tag.clone())?;

        let mut state = self.state.borrow_mut();
        state.data_queue_name = Some(data_queue);
        state.consumer_tag = Some(consumer_tag);
        Ok(())
    }

    /// Subscribes to `metrics`, opening the data connection and starting
    /// consume on the first call. Remembers `args` for resubscription.
    pub async fn subscribe(
        &self,
        metrics: Vec<String>,
        args: SubscribeArgs,
    ) -> Result<Value, AgentError> {
        let data_queue_name = self.state.borrow().data_queue_name.clone();
        let arguments = args.to_json(&metrics, data_queue_name.as_deref());
        let response = self.data_client.rpc("sink.subscribe", arguments).await?;

        {
            let mut state = self.state.borrow_mut();
            state.subscribed_metrics.extend(metrics);
            state.subscribe_args = args;
        }

        if data_queue_name.is_none() {
            let data_server_address = response
                .get("dataServerAddress")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AgentError::InvalidRpcEnvelope(
                        "sink.subscribe reply missing dataServerAddress".to_string(),
                    )
                })?
                .to_string();
            let data_queue = response
                .get("dataQueue")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AgentError::InvalidRpcEnvelope("sink.subscribe reply missing dataQueue".to_string())
                })?
                .to_string();
            self.sink_config(data_server_address, data_queue).await?;
        }

        Ok(response)
    }

    pub async fn unsubscribe(&self, metrics: &[String]) -> Result<(), AgentError> {
        let data_queue = self
            .state
            .borrow()
            .data_queue_name
            .clone()
            .ok_or(AgentError::NotConnected("data queue"))?;

        let mut arguments = Map::new();
        arguments.insert("dataQueue".to_string(), Value::String(data_queue));
        arguments.insert("metrics".to_string(), Value::from(metrics.to_vec()));
        self.data_client.rpc("sink.unsubscribe", arguments).await?;

        let mut state = self.state.borrow_mut();
        for metric in metrics {
            state.subscribed_metrics.remove(metric);
        }
        if state.subscribed_metrics.is_empty() {
            state.subscribe_args = SubscribeArgs::default();
        }
        Ok(())
    }

    /// Returns the metrics currently subscribed, as remembered for
    /// resubscription; mainly useful to tests. Collected into a plain
    /// `HashSet` so the public API doesn't leak the internal hasher choice.
    pub fn subscribed_metrics(&self) -> HashSet<String> {
        self.state.borrow().subscribed_metrics.iter().cloned().collect()
    }
}

/// Builds the hook the data connection's reconnect loop runs after every
/// reopen, before reporting `established()` again: re-subscribes with the
/// current metric set and restarts consume under the same consumer tag. A
/// failure is logged as `SinkResubscribeError` but does not stop the agent
/// (the next reconnect cycle gets another chance) and still lets
/// `established()` fire, since a stuck hook would otherwise wedge every
/// future reconnect indefinitely.
fn make_resubscribe_hook<H: OnData + 'static>(
    data_client: Rc<DataClient>,
    handler: Rc<RefCell<H>>,
    state: Rc<RefCell<SubscriptionState>>,
) -> crate::data_client::ReconnectHook {
    Rc::new(move || {
        let data_client = Rc::clone(&data_client);
        let handler = Rc::clone(&handler);
        let state = Rc::clone(&state);
        Box::pin(async move {
            if state.borrow().data_queue_name.is_none() {
                return;
            }
            log::info!("sink data connection reestablished, resubscribing");
            match resubscribe(&data_client, &handler, &state).await {
                Ok(()) => {}
                Err(e) => {
                    let err = AgentError::SinkResubscribeError(Box::new(e));
                    log::error!("{err}");
                }
            }
        })
    })
}

/// Performs one resubscribe attempt: re-issues `sink.subscribe` with the
/// metric set and data queue name as they were before the disconnect, then
/// re-declares the data queue and restarts consume under the same consumer
/// tag so downstream bookkeeping (offsets, dedup by tag) stays stable.
async fn resubscribe<H: OnData + 'static>(
    data_client: &Rc<DataClient>,
    handler: &Rc<RefCell<H>>,
    state: &Rc<RefCell<SubscriptionState>>,
) -> Result<(), AgentError> {
    let (metrics, data_queue, args, consumer_tag) = {
        let state = state.borrow();
        let metrics: Vec<String> = state.subscribed_metrics.iter().cloned().collect();
        let data_queue = state
            .data_queue_name
            .clone()
            .ok_or(AgentError::NotConnected("data queue"))?;
        let consumer_tag = state
            .consumer_tag
            .clone()
            .ok_or(AgentError::NotConnected("sink consumer"))?;
        (metrics, data_queue, state.subscribe_args.clone(), consumer_tag)
    };

    let arguments = args.to_json(&metrics, Some(&data_queue));
    let response = data_client.rpc("sink.subscribe", arguments).await?;
    let data_queue = response
        .get("dataQueue")
        .and_then(Value::as_str)
        .unwrap_or(&data_queue)
        .to_string();

    let channel = data_client.data_channel()?;
    channel
        .queue_declare(
            &data_queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(AgentError::Topology)?;

    let handler_for_consume = Rc::clone(handler);
    let consumer_tag_for_consume = consumer_tag.clone();
    let queue_for_consume = data_queue.clone();
    tokio::task::spawn_local(async move {
        let mut consumer = match channel
            .basic_consume(
                &queue_for_consume,
                &consumer_tag_for_consume,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                log::error!("failed to restart consuming sink data queue {queue_for_consume:?}: {e}");
                return;
            }
        };
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    log::error!("sink consumer error: {e}");
                    break;
                }
            };
            match on_data_message(&handler_for_consume, &delivery).await {
                Ok(()) => {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(e) => {
                    log::warn!("sink on_data failed, requeuing delivery: {e}");
                    let _ = delivery.reject(BasicRejectOptions { requeue: true }).await;
                }
            }
        }
    });

    state.borrow_mut().data_queue_name = Some(data_queue);
    Ok(())
}

async fn on_data_message<H: OnData>(
    handler: &Rc<RefCell<H>>,
    delivery: &lapin::message::Delivery,
) -> Result<(), AgentError> {
    let metric = delivery.routing_key.to_string();
    let chunk = DataChunk::decode_from_slice(&delivery.data)?;
    for sample in chunk.samples() {
        handler
            .borrow_mut()
            .on_data(&metric, sample.timestamp, sample.value)
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_args_round_trip_to_json() {
        let args = SubscribeArgs {
            expires: Some(60),
            metadata: Some(true),
        };
        let json = args.to_json(&["a".to_string(), "b".to_string()], Some("queue-1"));
        assert_eq!(json.get("dataQueue").unwrap(), "queue-1");
        assert_eq!(json.get("expires").unwrap(), 60);
        assert_eq!(json.get("metadata").unwrap(), true);
        assert_eq!(json.get("metrics").unwrap().as_array().unwrap().len(), 2);
    }
}
