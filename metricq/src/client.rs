//! `Client`: an `Agent` wired to the management exchange/broadcast topology,
//! answering `discover` and exposing the `get_metrics` management RPC.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use serde_json::{Map, Value};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::rpc::{handler, HandlerRegistry, RpcArgs};
use crate::time::{Timedelta, Timestamp};

pub const MANAGEMENT_EXCHANGE: &str = "metricq.management";
pub const MANAGEMENT_BROADCAST_EXCHANGE: &str = "metricq.broadcast";

/// The result of `get_metrics`: either a bare name list, or a `{name:
/// metadata}` map, selected by whether the caller asked for metadata.
///
/// Modeled as an enum rather than leaking `serde_json::Value` at the call
/// site, the same way the teacher wraps a raw untyped id in `TypedMetricId<T>`.
#[derive(Debug, Clone, PartialEq)]
pub enum GetMetricsResult {
    Names(Vec<String>),
    WithMetadata(HashMap<String, Value>),
}

#[derive(Debug, Clone, Default)]
pub struct GetMetricsFilter {
    pub selector: Option<Vec<String>>,
    pub historic: Option<bool>,
    pub timeout: Option<Timedelta>,
    pub prefix: Option<String>,
    pub infix: Option<String>,
    pub limit: Option<usize>,
}

/// Builds the `discover`/`config` handlers shared by every role that extends
/// `Client`. Roles call this to seed their own registry before adding
/// role-specific tags, the registry-builder equivalent of inheriting
/// `Client`'s handlers.
pub fn base_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let starting_time = Timestamp::now();
    registry.register(
        "discover",
        handler(move |_args: RpcArgs| async move {
            let now = Timestamp::now();
            let mut reply = Map::new();
            reply.insert("alive".to_string(), Value::Bool(true));
            reply.insert(
                "uptime".to_string(),
                Value::from((now - starting_time).ns()),
            );
            reply.insert("time".to_string(), Value::from(now.posix_ns()));
            Ok(Some(Value::Object(reply)))
        }),
    );
    registry
}

pub struct Client {
    pub(crate) agent: Agent,
}

impl Deref for Client {
    type Target = Agent;
    fn deref(&self) -> &Agent {
        &self.agent
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }
}

impl Client {
    pub fn new(config: AgentConfig, handlers: HandlerRegistry) -> Self {
        Client {
            agent: Agent::new(config, handlers),
        }
    }

    pub fn name(&self) -> String {
        format!("client-{}", self.agent.token())
    }

    /// Connects the underlying agent, then declares and binds the
    /// management-plane topology before starting RPC consume.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.agent.connect().await?;
        let channel = self.agent.channel()?;

        channel
            .exchange_declare(
                MANAGEMENT_BROADCAST_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;
        channel
            .exchange_declare(
                MANAGEMENT_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;

        channel
            .queue_bind(
                self.agent.rpc_queue_name(),
                MANAGEMENT_BROADCAST_EXCHANGE,
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(AgentError::Topology)?;

        Ok(())
    }

    /// Issues a management-plane RPC: waits for the management connection to
    /// be up, then publishes to `metricq.management` with `routing_key =
    /// function`.
    pub async fn rpc(&self, function: &str, arguments: Map<String, Value>) -> Result<Value, AgentError> {
        log::debug!("waiting for management connection to be reestablished...");
        self.agent.management_watchdog().established().await;
        self.agent
            .rpc(
                MANAGEMENT_EXCHANGE,
                function,
                function,
                arguments,
                self.agent.config.rpc_timeout,
            )
            .await
            .map_err(|err| match err {
                AgentError::RpcRequestError(function, cause) => {
                    AgentError::ManagementRpcPublishError(function, cause)
                }
                other => other,
            })
    }

    pub async fn get_metrics(&self, filter: GetMetricsFilter, metadata: bool) -> Result<GetMetricsResult, AgentError> {
        let mut arguments = Map::new();
        arguments.insert(
            "format".to_string(),
            Value::String(if metadata { "object" } else { "array" }.to_string()),
        );
        if let Some(selector) = filter.selector {
            arguments.insert("selector".to_string(), Value::from(selector));
        }
        if let Some(timeout) = filter.timeout {
            arguments.insert("timeout".to_string(), Value::from(timeout.s()));
        }
        if let Some(historic) = filter.historic {
            arguments.insert("historic".to_string(), Value::Bool(historic));
        }
        if let Some(prefix) = filter.prefix {
            arguments.insert("prefix".to_string(), Value::String(prefix));
        }
        if let Some(infix) = filter.infix {
            arguments.insert("infix".to_string(), Value::String(infix));
        }
        if let Some(limit) = filter.limit {
            arguments.insert("limit".to_string(), Value::from(limit));
        }

        let reply = self.rpc("get_metrics", arguments).await?;
        let metrics = reply
            .get("metrics")
            .cloned()
            .ok_or_else(|| AgentError::InvalidRpcEnvelope("get_metrics reply missing 'metrics'".to_string()))?;

        if metadata {
            let map: HashMap<String, Value> = serde_json::from_value(metrics)
                .map_err(AgentError::MalformedEnvelope)?;
            Ok(GetMetricsResult::WithMetadata(map))
        } else {
            let names: Vec<String> = serde_json::from_value(metrics)
                .map_err(AgentError::MalformedEnvelope)?;
            Ok(GetMetricsResult::Names(names))
        }
    }
}
