//! Error taxonomy for the agent runtime.
//!
//! One flat enum per the error kinds a caller actually needs to branch on,
//! mirroring `alumet`'s `WatchError`/`PipelineError`: a `#[source]` chain
//! instead of a single boxed cause, and no attempt to unify unrelated
//! failures into one "it broke" variant.

use std::sync::Arc;

use thiserror::Error;

use crate::time::Timedelta;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The initial connection to the broker failed.
    #[error("failed to connect to the broker")]
    ConnectFailed(#[source] lapin::Error),

    /// A connection watchdog elapsed its timeout without observing `established`.
    #[error("failed to reestablish {connection} after {timeout}")]
    ReconnectTimeout {
        connection: &'static str,
        timeout: Timedelta,
    },

    /// An inbound RPC named a tag with no registered handler.
    #[error("no handler registered for rpc {0:?}")]
    UnknownRpc(String),

    /// More than one handler for the same tag returned a non-empty value.
    #[error("more than one handler for rpc {0:?} returned a value")]
    AmbiguousRpcReturn(String),

    /// The remote side replied with `{"error": ...}`.
    #[error("rpc {function:?} failed on the remote side: {message}")]
    RpcError { function: String, message: String },

    /// Publishing or otherwise sending an outbound RPC request failed locally.
    #[error("failed to send rpc request {0:?}")]
    RpcRequestError(String, #[source] lapin::Error),

    /// Publishing a reply to an inbound RPC request failed locally.
    #[error("failed to publish rpc reply for {0:?}")]
    RpcReplyError(String, #[source] lapin::Error),

    /// `rpc_with_callback` was called with `cleanup_on_response=false` and no
    /// callback: such an entry would never be consumed.
    #[error("rpc {0:?} requires a callback when cleanup_on_response is false")]
    RpcCallbackRequired(String),

    /// Publishing a management-plane RPC failed locally (management
    /// connection down, channel invalid, ...), distinct from a general
    /// `RpcRequestError` because it is raised before a correlation id is
    /// even recorded.
    #[error("failed to publish management rpc {0:?}")]
    ManagementRpcPublishError(String, #[source] lapin::Error),

    /// An outbound RPC was not answered within its timeout.
    #[error("rpc {0:?} timed out")]
    Timeout(String),

    /// A source tried to publish a data chunk while the data channel was unusable.
    #[error("failed to send chunk for metric {0:?}")]
    MetricSendError(String, #[source] lapin::Error),

    /// A sink's post-reconnect resubscribe failed.
    #[error("failed to resubscribe after reconnect")]
    SinkResubscribeError(#[source] Box<AgentError>),

    /// Opening a second (data or history) connection failed.
    #[error("failed to establish {0} connection")]
    DataConnectFailed(&'static str, #[source] lapin::Error),

    /// The `dataServerAddress`/`historyServerAddress` handed back by the
    /// manager could not be parsed, or the management URL's credentials
    /// could not be spliced onto it.
    #[error("invalid server address {0:?}")]
    InvalidServerAddress(String, #[source] url::ParseError),

    /// A history request timed out or the response queue was torn down
    /// before a reply arrived.
    #[error("history request for {0:?} timed out")]
    HistoryTimeout(String),

    /// A `SynchronousSource`'s dedicated thread failed to become ready, or
    /// its underlying `Source` stop failed, within the caller's timeout.
    #[error("synchronous source {0}")]
    SynchronousSourceError(String),

    /// The agent stopped, optionally because of an underlying cause. Holds
    /// an `Arc` rather than a `Box` because the same cause is observed by
    /// every `stopped()` awaiter, not just the one that triggered the stop.
    #[error("agent stopped{}", .0.as_ref().map(|cause| format!(": {cause}")).unwrap_or_default())]
    AgentStopped(Option<Arc<AgentError>>),

    /// The agent was stopped by a caught signal other than `SIGINT`.
    #[error("received signal {0}")]
    ReceivedSignal(&'static str),

    /// The RPC body could not be parsed as JSON.
    #[error("malformed rpc envelope")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// The RPC body parsed as JSON but violated the envelope shape (not an
    /// object, missing `correlation_id`, ...).
    #[error("invalid rpc envelope: {0}")]
    InvalidRpcEnvelope(String),

    /// A `DataChunk`/`HistoryResponse` violated its length or mode invariant.
    #[error("malformed wire message: {0}")]
    MalformedChunk(String),

    /// Declaring an exchange, queue, or binding failed.
    #[error("broker topology setup failed")]
    Topology(#[source] lapin::Error),

    /// An operation needing an open channel was attempted before `connect()`.
    #[error("{0} used before the agent was connected")]
    NotConnected(&'static str),
}

pub type AgentResult<T> = Result<T, AgentError>;
