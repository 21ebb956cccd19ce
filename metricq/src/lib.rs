//! Runtime for MetricQ distributed time-series agents.
//!
//! Four cooperating roles share one [`agent::Agent`] runtime: [`client::Client`]
//! (management-plane only), [`source::Source`] (emits metric values),
//! [`sink::Sink`] (subscribes to metric values) and [`history::HistoryClient`]
//! (requests stored time-series). Every role composes the layer below it
//! instead of inheriting from it — see `rpc::HandlerRegistry::merge` for the
//! registry-builder that replaces the original class hierarchy.

pub mod agent;
pub mod chunk;
pub mod client;
pub mod config;
pub mod data_client;
pub mod error;
pub mod history;
pub mod rpc;
pub mod sink;
pub mod source;
pub mod synchronous_source;
pub mod time;
pub mod watchdog;

pub use agent::{Agent, AgentState};
pub use client::{Client, GetMetricsFilter, GetMetricsResult};
pub use config::{AgentConfig, DataClientConfig};
pub use data_client::DataClient;
pub use error::{AgentError, AgentResult};
pub use history::{HistoryClient, HistoryRequestType, HistoryResponseMeta, HistoryResult};
pub use sink::{OnData, Sink, SubscribeArgs};
pub use source::{IntervalSource, Source, SourceMetric, UpdateSource};
pub use synchronous_source::SynchronousSource;
pub use time::{TimeAggregate, Timedelta, TimeValue, Timestamp};
