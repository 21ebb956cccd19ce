//! The generic Agent runtime: one broker connection, one RPC queue, one
//! correlation table, one lifecycle.
//!
//! Every role (`Client`, `DataClient`, `Source`, `Sink`, `HistoryClient`) is
//! built by wrapping an `Agent` rather than subclassing it — Rust has no
//! implementation inheritance, so composition plus `Deref`/`DerefMut` plays
//! the role the original class hierarchy does.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};

use crate::error::AgentError;
use crate::rpc::{HandlerRegistry, InboundRpc, RpcArgs};
use crate::time::Timedelta;
use crate::watchdog::ConnectionWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Connecting,
    Ready,
    Stopping,
    Stopped,
}

/// Why an agent stopped; `None` means a clean, voluntary stop.
pub type AgentStopReason = Option<Arc<AgentError>>;

/// A persistent RPC response handler, registered via
/// [`Agent::rpc_with_callback`]; mirrors the original `_rpc`'s
/// `response_callback`.
pub type RpcCallback = Rc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()>>>>;

type CorrelationMap = Rc<RefCell<FxHashMap<String, CorrelationEntry>>>;

enum CorrelationEntry {
    /// The common case: `rpc()` is awaiting exactly one reply.
    Future(oneshot::Sender<Value>),
    /// A caller-registered handler, invoked on every matching reply until
    /// `cleanup_on_response` retires the entry (or it times out).
    Callback {
        callback: RpcCallback,
        cleanup_on_response: bool,
    },
}

pub struct Agent {
    pub(crate) config: crate::config::AgentConfig,
    pub(crate) handlers: Rc<HandlerRegistry>,
    state: Arc<ArcSwap<AgentState>>,
    stopped_tx: Rc<watch::Sender<AgentStopReason>>,
    stopped_rx: watch::Receiver<AgentStopReason>,
    correlations: CorrelationMap,
    pub(crate) connection: Option<Connection>,
    pub(crate) channel: Option<Channel>,
    pub(crate) rpc_queue_name: Option<String>,
    pub(crate) management_watchdog: Arc<ConnectionWatchdog>,
}

impl Agent {
    pub fn new(config: crate::config::AgentConfig, handlers: HandlerRegistry) -> Self {
        let (stopped_tx, stopped_rx) = watch::channel(None);
        let management_watchdog =
            ConnectionWatchdog::new("management connection", config.connection_timeout);
        Agent {
            config,
            handlers: Rc::new(handlers),
            state: Arc::new(ArcSwap::new(Arc::new(AgentState::Init))),
            stopped_tx: Rc::new(stopped_tx),
            stopped_rx,
            correlations: Rc::new(RefCell::new(FxHashMap::default())),
            connection: None,
            channel: None,
            rpc_queue_name: None,
            management_watchdog,
        }
    }

    /// Liveness watchdog for the management connection; a `DataClient` owns
    /// a second, independent instance for its data connection.
    pub fn management_watchdog(&self) -> &Arc<ConnectionWatchdog> {
        &self.management_watchdog
    }

    pub fn token(&self) -> &str {
        &self.config.token
    }

    pub fn state(&self) -> AgentState {
        **self.state.load()
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(Arc::new(state));
    }

    /// A receiver that resolves once the agent has stopped; clones cheaply so
    /// every awaiter (the `run()` caller, pending RPC futures, a Sink's
    /// resubscribe task) observes the same terminal value.
    pub fn stopped(&self) -> watch::Receiver<AgentStopReason> {
        self.stopped_rx.clone()
    }

    /// The shared stop sender, handed to a `DataClient`'s watchdog so a data
    /// connection timeout can stop the whole agent the same way a management
    /// connection timeout does.
    pub(crate) fn stopped_tx(&self) -> Rc<watch::Sender<AgentStopReason>> {
        Rc::clone(&self.stopped_tx)
    }

    /// Folds additional handlers into this agent's registry after
    /// construction, for roles (`DataClient` and its descendants) whose
    /// extra tags need state only available once the underlying `Agent`
    /// already exists (e.g. its stop-signal sender).
    pub(crate) fn merge_handlers(&mut self, more: HandlerRegistry) {
        Rc::get_mut(&mut self.handlers)
            .expect("merge_handlers called after the handler registry was shared")
            .merge(more);
    }

    /// Marks the agent stopped exactly once; subsequent calls are a no-op.
    pub fn stop(&self, reason: Option<AgentError>) {
        if self.stopped_rx.borrow().is_some() || self.state() == AgentState::Stopped {
            log::debug!("stop() called on an already-stopped agent, ignoring");
            return;
        }
        self.set_state(AgentState::Stopping);
        let _ = self.stopped_tx.send(reason.map(Arc::new));
        self.set_state(AgentState::Stopped);
    }

    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.set_state(AgentState::Connecting);
        let connection = Connection::connect(
            &self.config.management_url,
            ConnectionProperties::default(),
        )
        .await
        .map_err(AgentError::ConnectFailed)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(AgentError::ConnectFailed)?;

        let queue_name = self.config.rpc_queue_name();
        let declare_opts = if self.config.durable {
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            }
        } else {
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            }
        };
        channel
            .queue_declare(&queue_name, declare_opts, FieldTable::default())
            .await
            .map_err(AgentError::Topology)?;

        let close_watchdog = Arc::clone(&self.management_watchdog);
        connection.on_error(move |_error| {
            close_watchdog.set_closed();
        });

        self.connection = Some(connection);
        self.channel = Some(channel);
        self.rpc_queue_name = Some(queue_name);

        let stopped_tx = Rc::clone(&self.stopped_tx);
        self.management_watchdog.start(Rc::new(move |info| {
            let stopped_tx = Rc::clone(&stopped_tx);
            let connection_name = info.connection_name;
            let timeout = info.timeout;
            Box::pin(async move {
                let _ = stopped_tx.send(Some(Arc::new(AgentError::ReconnectTimeout {
                    connection: connection_name,
                    timeout,
                })));
            })
        }));
        self.management_watchdog.set_established();
        spawn_rpc_consumer(
            self.channel()?.clone(),
            self.rpc_queue_name().to_string(),
            self.config.token.clone(),
            Rc::clone(&self.handlers),
            Rc::clone(&self.correlations),
        );
        self.set_state(AgentState::Ready);
        Ok(())
    }

    pub fn channel(&self) -> Result<&Channel, AgentError> {
        self.channel
            .as_ref()
            .ok_or(AgentError::NotConnected("management channel"))
    }

    pub fn rpc_queue_name(&self) -> &str {
        self.rpc_queue_name
            .as_deref()
            .expect("rpc_queue_name read before connect()")
    }

    /// Sends a management-style RPC request and awaits its single reply.
    /// Serializes `arguments` plus the `function` tag as the JSON body,
    /// assigns a correlation ID and a `reply_to` of this agent's RPC queue,
    /// and removes the correlation entry on timeout as well as on delivery.
    ///
    /// A thin wrapper over [`Agent::rpc_raw`] with no callback and
    /// `cleanup_on_response=true`, which always resolves exactly one reply.
    pub async fn rpc(
        &self,
        exchange: &str,
        routing_key: &str,
        function: &str,
        arguments: Map<String, Value>,
        timeout: Timedelta,
    ) -> Result<Value, AgentError> {
        let reply = self
            .rpc_raw(exchange, routing_key, function, arguments, timeout, None, true)
            .await?;
        Ok(reply.expect("rpc_raw with no callback always resolves a reply"))
    }

    /// Sends a management-style RPC request whose replies are handed to
    /// `callback` instead of resolved as a single future, mirroring the
    /// original `_rpc(function, response_callback, ..., cleanup_on_response)`.
    /// Returns once the request is published; unlike [`Agent::rpc`] it does
    /// not wait for a reply itself.
    pub async fn rpc_with_callback(
        &self,
        exchange: &str,
        routing_key: &str,
        function: &str,
        arguments: Map<String, Value>,
        timeout: Timedelta,
        callback: RpcCallback,
        cleanup_on_response: bool,
    ) -> Result<(), AgentError> {
        self.rpc_raw(
            exchange,
            routing_key,
            function,
            arguments,
            timeout,
            Some(callback),
            cleanup_on_response,
        )
        .await
        .map(|_| ())
    }

    /// The shared primitive behind [`Agent::rpc`] and
    /// [`Agent::rpc_with_callback`]. With no `callback`, registers a
    /// single-shot future and returns its reply. With a `callback`, registers
    /// it under `cleanup_on_response` and returns as soon as the request is
    /// published. Rejects `cleanup_on_response=false` with no `callback`,
    /// since such an entry would never be consumed.
    async fn rpc_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        function: &str,
        mut arguments: Map<String, Value>,
        timeout: Timedelta,
        callback: Option<RpcCallback>,
        cleanup_on_response: bool,
    ) -> Result<Option<Value>, AgentError> {
        if callback.is_none() && !cleanup_on_response {
            return Err(AgentError::RpcCallbackRequired(function.to_string()));
        }

        let channel = self.channel()?;
        let correlation_id = format!(
            "metricq-rpc-rs-{}-{}",
            self.config.token,
            uuid::Uuid::new_v4().simple()
        );
        arguments.insert("function".to_string(), Value::String(function.to_string()));
        let body = serde_json::to_vec(&Value::Object(arguments))
            .map_err(AgentError::MalformedEnvelope)?;

        let rx = match callback {
            None => {
                let (tx, rx) = oneshot::channel();
                self.correlations
                    .borrow_mut()
                    .insert(correlation_id.clone(), CorrelationEntry::Future(tx));
                Some(rx)
            }
            Some(callback) => {
                self.correlations.borrow_mut().insert(
                    correlation_id.clone(),
                    CorrelationEntry::Callback {
                        callback,
                        cleanup_on_response,
                    },
                );
                None
            }
        };

        let properties = BasicProperties::default()
            .with_app_id(self.config.token.clone().into())
            .with_content_type("application/json".into())
            .with_correlation_id(correlation_id.clone().into())
            .with_reply_to(self.rpc_queue_name().to_string().into());

        let publish_result = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await;
        if let Err(e) = publish_result {
            self.correlations.borrow_mut().remove(&correlation_id);
            return Err(AgentError::RpcRequestError(function.to_string(), e));
        }

        match rx {
            Some(rx) => match tokio::time::timeout(timeout.as_duration(), rx).await {
                Ok(Ok(reply)) => {
                    if let Some(message) = reply.get("error").and_then(Value::as_str) {
                        return Err(AgentError::RpcError {
                            function: function.to_string(),
                            message: message.to_string(),
                        });
                    }
                    Ok(Some(reply))
                }
                Ok(Err(_canceled)) => Err(AgentError::AgentStopped(
                    self.stopped_rx.borrow().clone(),
                )),
                Err(_elapsed) => {
                    self.correlations.borrow_mut().remove(&correlation_id);
                    Err(AgentError::Timeout(function.to_string()))
                }
            },
            None => {
                // Callback path: the request is fire-and-forget from here, but
                // the entry still expires after `timeout`, the way the
                // original schedules `event_loop.call_later(timeout, cleanup)`
                // regardless of `cleanup_on_response`.
                let correlations = Rc::clone(&self.correlations);
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(timeout.as_duration()).await;
                    correlations.borrow_mut().remove(&correlation_id);
                });
                Ok(None)
            }
        }
    }

    /// Registers signal handlers for `SIGINT`/`SIGTERM` and drives `connect`,
    /// then awaits `stopped()`. `SIGINT` stops cleanly; any other caught
    /// signal stops with [`AgentError::ReceivedSignal`].
    pub async fn run(&mut self) -> Result<(), AgentError> {
        self.connect().await?;

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut stopped = self.stopped();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("received SIGINT, stopping");
                self.stop(None);
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, stopping");
                self.stop(Some(AgentError::ReceivedSignal("SIGTERM")));
            }
            _ = stopped.changed() => {}
        }

        match self.stopped_rx.borrow().clone() {
            Some(cause) => Err(AgentError::AgentStopped(Some(cause))),
            None => Ok(()),
        }
    }
}

/// What an inbound response delivery resolves to, resolved while holding the
/// correlation table's borrow so the entry can be removed or reinserted in
/// one step before the handler itself runs.
enum ResponseAction {
    Future(oneshot::Sender<Value>),
    Callback(RpcCallback),
}

/// Spawns the task that consumes `queue` (the agent's own RPC queue) and
/// classifies/dispatches every delivery, the way `data_client.rs`'s
/// `spawn_reconnect_loop` spawns its own free-standing background task
/// instead of borrowing `&self`. Runs until the channel closes.
fn spawn_rpc_consumer(
    channel: Channel,
    queue: String,
    token: String,
    handlers: Rc<HandlerRegistry>,
    correlations: CorrelationMap,
) {
    tokio::task::spawn_local(async move {
        let consumer_tag = format!("{token}-rpc-consumer");
        let mut consumer = match channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                log::error!("{}", AgentError::Topology(e));
                return;
            }
        };

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    log::error!("rpc consumer error: {e}");
                    break;
                }
            };
            let reply = handle_delivery(&delivery, &channel, &token, &handlers, &correlations).await;
            match reply {
                Ok(()) => {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(e) => {
                    log::warn!("rpc handler failed, requeuing delivery: {e}");
                    let _ = delivery
                        .reject(BasicRejectOptions { requeue: true })
                        .await;
                }
            }
        }
    });
}

async fn handle_delivery(
    delivery: &lapin::message::Delivery,
    channel: &Channel,
    token: &str,
    handlers: &HandlerRegistry,
    correlations: &CorrelationMap,
) -> Result<(), AgentError> {
    let classified = classify(delivery)?;
    match classified {
        InboundRpc::Request { function, args } => {
            let reply_to = delivery.properties.reply_to().clone();
            let correlation_id = delivery.properties.correlation_id().clone();
            let result = handlers.dispatch(&function, args).await;
            let body = match result {
                Ok(value) => value.unwrap_or(Value::Object(Map::new())),
                Err(e) => {
                    let mut error_body = Map::new();
                    error_body.insert("error".to_string(), Value::String(e.to_string()));
                    Value::Object(error_body)
                }
            };
            if let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) {
                let bytes = serde_json::to_vec(&body).map_err(AgentError::MalformedEnvelope)?;
                let properties = BasicProperties::default()
                    .with_app_id(token.to_string().into())
                    .with_content_type("application/json".into())
                    .with_correlation_id(correlation_id);
                if let Err(e) = channel
                    .basic_publish(
                        "",
                        reply_to.as_str(),
                        BasicPublishOptions::default(),
                        &bytes,
                        properties,
                    )
                    .await
                {
                    log::error!("{}", AgentError::RpcReplyError(function, e));
                }
            }
            Ok(())
        }
        InboundRpc::Response { correlation_id, body } => {
            let action = {
                let mut correlations = correlations.borrow_mut();
                match correlations.remove(&correlation_id) {
                    Some(CorrelationEntry::Future(tx)) => Some(ResponseAction::Future(tx)),
                    Some(CorrelationEntry::Callback { callback, cleanup_on_response }) => {
                        if !cleanup_on_response {
                            correlations.insert(
                                correlation_id.clone(),
                                CorrelationEntry::Callback {
                                    callback: Rc::clone(&callback),
                                    cleanup_on_response,
                                },
                            );
                        }
                        Some(ResponseAction::Callback(callback))
                    }
                    None => None,
                }
            };
            match action {
                Some(ResponseAction::Future(tx)) => {
                    let _ = tx.send(body);
                }
                Some(ResponseAction::Callback(callback)) => callback(body).await,
                None => {
                    log::debug!(
                        "dropping rpc response with unknown correlation id {correlation_id:?}"
                    );
                }
            }
            Ok(())
        }
    }
}

fn classify(delivery: &lapin::message::Delivery) -> Result<InboundRpc, AgentError> {
    let body: Value =
        serde_json::from_slice(&delivery.data).map_err(AgentError::MalformedEnvelope)?;
    let mut object = match body {
        Value::Object(map) => map,
        _ => {
            return Err(AgentError::InvalidRpcEnvelope(
                "rpc body must be a JSON object".to_string(),
            ))
        }
    };

    if let Some(Value::String(function)) = object.remove("function") {
        let from_token = delivery
            .properties
            .app_id()
            .clone()
            .map(|s| s.to_string());
        Ok(InboundRpc::Request {
            function,
            args: RpcArgs {
                from_token,
                arguments: object,
            },
        })
    } else {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AgentError::InvalidRpcEnvelope("rpc response missing correlation_id".to_string())
            })?;
        Ok(InboundRpc::Response {
            correlation_id,
            body: Value::Object(object),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn new_agent() -> Agent {
        let config = AgentConfig::new("amqp://localhost", "test-agent");
        Agent::new(config, HandlerRegistry::new())
    }

    #[test]
    fn starts_in_init_state() {
        let agent = new_agent();
        assert_eq!(agent.state(), AgentState::Init);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_notifies_once() {
        let agent = new_agent();
        let mut stopped = agent.stopped();
        agent.stop(None);
        agent.stop(Some(AgentError::Timeout("ignored".into())));

        stopped.changed().await.unwrap();
        assert!(stopped.borrow().is_none());
        assert_eq!(agent.state(), AgentState::Stopped);
    }
}
