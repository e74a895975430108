pub mod bolt;
pub mod http2;

use crate::protocol::ProtocolName;
use crate::upstream::Host;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_common::error::TrellisError;
use trellis_common::headers::HeaderBag;
use trellis_common::logs::get_trace_id;
use trellis_common::TrellisResult;

/// Why a stream stopped before completing its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    ConnectionFailed,
    ConnectionTermination,
    LocalReset,
    RemoteReset,
    Overflow,
}

/// Flags recorded on the access-log path for synthesized failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    UpstreamConnectionFailure,
    UpstreamConnectionTermination,
    UpstreamLocalReset,
    UpstreamRemoteReset,
    UpstreamOverflow,
    UpstreamRequestTimeout,
    NoHealthyUpstream,
    NoRouteFound,
    DownstreamConnectionTermination,
}

pub fn reset_reason_to_response_flag(reason: StreamResetReason) -> ResponseFlag {
    match reason {
        StreamResetReason::ConnectionFailed => ResponseFlag::UpstreamConnectionFailure,
        StreamResetReason::ConnectionTermination => ResponseFlag::UpstreamConnectionTermination,
        StreamResetReason::LocalReset => ResponseFlag::UpstreamLocalReset,
        StreamResetReason::RemoteReset => ResponseFlag::UpstreamRemoteReset,
        StreamResetReason::Overflow => ResponseFlag::UpstreamOverflow,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Server,
    Client,
}

/// Immutable creation context of a stream: identity for logging, tracing
/// and sub-protocol selection, plus a filter-visible escape hatch.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub conn_id: u64,
    pub stream_id: u64,
    pub trace_id: String,
    pub protocol: ProtocolName,
    pub sub_protocol: u8,
    pub extra: HashMap<String, String>,
}

impl StreamContext {
    pub fn new(conn_id: u64, stream_id: u64, protocol: ProtocolName) -> Self {
        StreamContext {
            conn_id,
            stream_id,
            trace_id: get_trace_id(),
            protocol,
            sub_protocol: 0,
            extra: HashMap::new(),
        }
    }
}

/// Pre-allocates the per-stream context each dispatch cycle so buffers and
/// spans hang off a stable identity; rotated after every successful frame.
pub struct ContextManager {
    conn_id: u64,
    protocol: ProtocolName,
    seq: u64,
    current: StreamContext,
}

impl ContextManager {
    pub fn new(conn_id: u64, protocol: ProtocolName) -> Self {
        ContextManager {
            conn_id,
            protocol,
            seq: 0,
            current: StreamContext::new(conn_id, 0, protocol),
        }
    }

    pub fn get(&self) -> StreamContext {
        self.current.clone()
    }

    pub fn next(&mut self) {
        self.seq += 1;
        self.current = StreamContext::new(self.conn_id, self.seq, self.protocol);
    }
}

/// Outbound half of a stream. Calls arrive in header, body, trailer order;
/// the first call with `end_stream` flushes the exchange.
#[async_trait]
pub trait StreamSender: Send + Sync {
    async fn append_headers(&self, headers: HeaderBag, end_stream: bool) -> TrellisResult<()>;
    async fn append_data(&self, data: Bytes, end_stream: bool) -> TrellisResult<()>;
    async fn append_trailers(&self, trailers: HeaderBag) -> TrellisResult<()>;

    /// Abandons the exchange; the terminal signal propagates to the peer
    /// where the protocol supports it.
    fn reset_stream(&self, reason: StreamResetReason);
}

/// Inbound half: invoked at most once with the terminal exchange, or at
/// most once with a reset; never both, never after reset.
#[async_trait]
pub trait StreamReceiveListener: Send + Sync {
    async fn on_receive(
        &self,
        ctx: &StreamContext,
        headers: HeaderBag,
        data: Option<Bytes>,
        trailers: Option<HeaderBag>,
    );

    async fn on_decode_error(&self, ctx: &StreamContext, err: &TrellisError);

    fn on_reset(&self, reason: StreamResetReason);
}

/// Installed by the proxy on a server stream connection; produces the
/// receiver for each freshly detected stream. `sender` is `None` for
/// oneway requests.
pub trait ServerStreamConnectionEventListener: Send + Sync {
    fn new_stream_detect(
        &self,
        ctx: StreamContext,
        sender: Option<Arc<dyn StreamSender>>,
    ) -> Arc<dyn StreamReceiveListener>;
}

/// Lifecycle hook the connection pool attaches to upstream streams for
/// failure accounting.
pub trait StreamEventListener: Send + Sync {
    fn on_reset_stream(&self, reason: StreamResetReason);
    fn on_destroy_stream(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    Overflow,
    ConnectionFailure,
}

/// Where the pool's active client stands for a given sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolReadiness {
    Connected,
    /// A dial is in flight; worth waiting for.
    Connecting,
    /// No client (never initialized, or evicted after a failed dial).
    Failed,
}

/// Callback surface of `ConnectionPool::new_stream`.
pub trait PoolEventListener: Send + Sync {
    fn on_ready(&self, sender: Arc<dyn StreamSender>, host: Arc<Host>);
    fn on_failure(&self, reason: PoolFailureReason, host: Arc<Host>);
}

/// Per upstream-host pool of stream connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn protocol(&self) -> ProtocolName;

    /// Idempotent; kicks the dial state machine and reports whether the
    /// client for the context's sub-protocol is already connected. Never
    /// blocks on the dial itself.
    async fn check_and_init(&self, ctx: &StreamContext) -> bool;

    /// Pure observation, never triggers a dial.
    fn readiness(&self, ctx: &StreamContext) -> PoolReadiness;

    async fn new_stream(
        &self,
        ctx: &StreamContext,
        receiver: Option<Arc<dyn StreamReceiveListener>>,
        listener: Arc<dyn PoolEventListener>,
    );

    /// Close every active client's transport.
    async fn close(&self);

    /// Stop keep-alives and let in-flight requests drain.
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reason_flag_table() {
        assert_eq!(
            reset_reason_to_response_flag(StreamResetReason::ConnectionFailed),
            ResponseFlag::UpstreamConnectionFailure
        );
        assert_eq!(
            reset_reason_to_response_flag(StreamResetReason::Overflow),
            ResponseFlag::UpstreamOverflow
        );
    }

    #[test]
    fn context_manager_rotates_identity() {
        let mut cm = ContextManager::new(3, ProtocolName::Bolt);
        let first = cm.get();
        cm.next();
        let second = cm.get();
        assert_eq!(first.conn_id, second.conn_id);
        assert_ne!(first.stream_id, second.stream_id);
        assert_ne!(first.trace_id, second.trace_id);
    }
}
