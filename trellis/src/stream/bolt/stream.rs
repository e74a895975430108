use crate::buffer::IoBuffer;
use crate::network::{Connection, ConnectionEvent, ConnectionEventListener, FilterStatus, ReadFilter};
use crate::protocol::bolt::{
    status_from_http, status_to_http, BoltCodec, BoltCommand, CMD_TYPE_REQUEST_ONEWAY,
    REQUEST_TIMEOUT_NONE,
};
use crate::protocol::ProtocolName;
use crate::stream::{
    ContextManager, ServerStreamConnectionEventListener, StreamContext, StreamDirection,
    StreamEventListener, StreamReceiveListener, StreamResetReason, StreamSender,
};
use crate::sync::WorkerPool;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error};
use trellis_common::error::TrellisError;
use trellis_common::headers::{
    HeaderBag, HEADER_GLOBAL_TIMEOUT, HEADER_HOST, HEADER_METHOD, HEADER_PATH,
    HEADER_QUERYSTRING, HEADER_STATUS,
};
use trellis_common::TrellisResult;

use super::keepalive::BoltKeepAlive;

const STATE_OPEN: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_RESET: u8 = 2;

/// The codec-aware view of one Bolt transport connection. A server flavor
/// dispatches fresh request-ids into proxy streams; the client flavor is
/// bidirectional enough to carry heartbeats both ways.
pub struct BoltStreamConnection {
    this: Weak<BoltStreamConnection>,
    conn: Arc<Connection>,
    context_manager: Mutex<ContextManager>,
    client_streams: RwLock<HashMap<u32, Arc<BoltStream>>>,
    server_streams: RwLock<HashMap<u32, Arc<BoltStream>>>,
    server_callbacks: Option<Arc<dyn ServerStreamConnectionEventListener>>,
    worker_pool: Option<Arc<WorkerPool>>,
    curr_stream_id: AtomicU32,
    keepalive: Mutex<Option<Arc<BoltKeepAlive>>>,
}

impl BoltStreamConnection {
    pub fn new_server(
        conn: Arc<Connection>,
        callbacks: Arc<dyn ServerStreamConnectionEventListener>,
        worker_pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        let sc = Arc::new_cyclic(|this| BoltStreamConnection {
            this: this.clone(),
            context_manager: Mutex::new(ContextManager::new(conn.id(), ProtocolName::Bolt)),
            conn,
            client_streams: RwLock::new(HashMap::new()),
            server_streams: RwLock::new(HashMap::new()),
            server_callbacks: Some(callbacks),
            worker_pool: Some(worker_pool),
            curr_stream_id: AtomicU32::new(0),
            keepalive: Mutex::new(None),
        });
        sc.start();
        sc
    }

    pub fn new_client(conn: Arc<Connection>) -> Arc<Self> {
        let sc = Arc::new_cyclic(|this| BoltStreamConnection {
            this: this.clone(),
            context_manager: Mutex::new(ContextManager::new(conn.id(), ProtocolName::Bolt)),
            conn,
            client_streams: RwLock::new(HashMap::new()),
            server_streams: RwLock::new(HashMap::new()),
            server_callbacks: None,
            worker_pool: None,
            curr_stream_id: AtomicU32::new(0),
            keepalive: Mutex::new(None),
        });
        sc.start();
        sc
    }

    fn start(&self) {
        self.conn
            .add_event_listener(Arc::new(CloseListener(self.this.clone())));
        if let Some(sc) = self.this.upgrade() {
            self.conn
                .clone()
                .start_read_loop(Arc::new(DispatchFilter(sc)));
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn set_keepalive(&self, keepalive: Arc<BoltKeepAlive>) {
        *self.keepalive.lock().unwrap() = Some(keepalive);
    }

    pub fn next_stream_id(&self) -> u32 {
        self.curr_stream_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn active_streams(&self) -> usize {
        self.client_streams.read().unwrap().len() + self.server_streams.read().unwrap().len()
    }

    /// Decodes every complete frame in the buffer; a partial tail stays put
    /// until the read loop re-enters with more bytes.
    pub async fn dispatch(&self, buf: &mut IoBuffer) {
        loop {
            let ctx = self.context_manager.lock().unwrap().get();
            match BoltCodec::decode(buf) {
                Ok(None) => break,
                Ok(Some(cmd)) => {
                    self.handle_command(ctx, cmd).await;
                    self.context_manager.lock().unwrap().next();
                }
                Err(err) => {
                    self.handle_error(ctx, err).await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&self, mut ctx: StreamContext, cmd: BoltCommand) {
        ctx.sub_protocol = cmd.protocol_code;

        // Heartbeats never leave the stream layer.
        if cmd.is_heartbeat() {
            if cmd.is_request() {
                debug!("conn {} heartbeat, requestId = {}", self.conn.id(), cmd.request_id);
                let ack = BoltCodec::encode(&BoltCommand::new_heartbeat_ack(cmd.request_id));
                let _ = self.conn.write(ack.into_inner().freeze());
            } else {
                let keepalive = self.keepalive.lock().unwrap().clone();
                if let Some(keepalive) = keepalive {
                    keepalive.handle_ack(cmd.request_id);
                }
            }
            return;
        }

        if cmd.is_request() {
            self.on_new_stream_detect(ctx, cmd);
        } else {
            self.on_stream_recv(ctx, cmd).await;
        }
    }

    fn on_new_stream_detect(&self, mut ctx: StreamContext, cmd: BoltCommand) {
        let Some(callbacks) = &self.server_callbacks else {
            debug!("conn {} dropped request frame on client connection", self.conn.id());
            return;
        };
        ctx.stream_id = cmd.request_id as u64;
        debug!(
            "conn {} new stream detect, requestId = {}",
            self.conn.id(),
            cmd.request_id
        );

        let oneway = cmd.is_oneway();
        let stream = Arc::new(BoltStream {
            id: cmd.request_id,
            direction: StreamDirection::Server,
            ctx: ctx.clone(),
            conn: self.this.clone(),
            receiver: Mutex::new(None),
            send_cmd: Mutex::new(None),
            state: AtomicU8::new(STATE_OPEN),
            event_listener: Mutex::new(None),
        });

        let sender: Option<Arc<dyn StreamSender>> = if oneway {
            None
        } else {
            Some(stream.clone())
        };
        let receiver = callbacks.new_stream_detect(ctx.clone(), sender);
        *stream.receiver.lock().unwrap() = Some(receiver.clone());
        if !oneway {
            self.server_streams
                .write()
                .unwrap()
                .insert(cmd.request_id, stream.clone());
        }

        let mut bag = cmd.headers;
        bag.set(HEADER_GLOBAL_TIMEOUT, cmd.timeout.to_string());
        if let Some(service) = bag.get("service").map(|s| s.to_owned()) {
            bag.set(HEADER_HOST, service);
        }
        if bag.get(HEADER_PATH).is_none() {
            bag.set(HEADER_PATH, "/");
        }
        let content = cmd.content;

        let task = async move {
            if stream.state.load(Ordering::Acquire) != STATE_OPEN && !oneway {
                return;
            }
            let data = if content.is_empty() { None } else { Some(content) };
            receiver.on_receive(&stream.ctx, bag, data, None).await;
        };
        match &self.worker_pool {
            Some(pool) => pool.spawn(task),
            None => {
                tokio::spawn(task);
            }
        }
    }

    async fn on_stream_recv(&self, _ctx: StreamContext, cmd: BoltCommand) {
        let stream = self
            .client_streams
            .write()
            .unwrap()
            .remove(&cmd.request_id);
        let Some(stream) = stream else {
            debug!(
                "conn {} no client stream for response, requestId = {}",
                self.conn.id(),
                cmd.request_id
            );
            return;
        };
        if !stream.transition(STATE_OPEN, STATE_DONE) {
            return;
        }
        debug!(
            "conn {} receive response, requestId = {}",
            self.conn.id(),
            cmd.request_id
        );

        let mut bag = cmd.headers;
        bag.set(HEADER_STATUS, status_to_http(cmd.status).to_string());
        let data = if cmd.content.is_empty() {
            None
        } else {
            Some(cmd.content)
        };
        let receiver = stream.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.on_receive(&stream.ctx, bag, data, None).await;
        }
        stream.fire_destroy();
    }

    async fn handle_error(&self, ctx: StreamContext, err: TrellisError) {
        match &err {
            TrellisError::Deserialize { request_id, .. } if *request_id > 0 => {
                error!("conn {} deserialize error: {}", self.conn.id(), err);
                if let Some(callbacks) = &self.server_callbacks {
                    // Valid request-id: answer with an exception response on
                    // this stream, the connection survives.
                    let mut sctx = ctx;
                    sctx.stream_id = *request_id as u64;
                    let stream = Arc::new(BoltStream {
                        id: *request_id,
                        direction: StreamDirection::Server,
                        ctx: sctx.clone(),
                        conn: self.this.clone(),
                        receiver: Mutex::new(None),
                        send_cmd: Mutex::new(None),
                        state: AtomicU8::new(STATE_OPEN),
                        event_listener: Mutex::new(None),
                    });
                    let receiver = callbacks.new_stream_detect(sctx.clone(), Some(stream.clone()));
                    *stream.receiver.lock().unwrap() = Some(receiver.clone());
                    self.server_streams
                        .write()
                        .unwrap()
                        .insert(*request_id, stream.clone());
                    receiver.on_decode_error(&sctx, &err).await;
                } else {
                    let stream = self.client_streams.write().unwrap().remove(request_id);
                    if let Some(stream) = stream {
                        if stream.transition(STATE_OPEN, STATE_DONE) {
                            let receiver = stream.receiver.lock().unwrap().clone();
                            if let Some(receiver) = receiver {
                                receiver.on_decode_error(&stream.ctx, &err).await;
                            }
                            stream.fire_destroy();
                        }
                    }
                }
            }
            _ => {
                // Protocol violation corrupts codec state: drop the transport.
                error!(
                    "conn {} codec error, closing: {}",
                    self.conn.id(),
                    err
                );
                self.conn.close(ConnectionEvent::LocalClose);
            }
        }
    }

    /// Opens an upstream request stream. Oneway callers pass no receiver and
    /// the stream is never tracked for a reply.
    pub fn new_stream(
        &self,
        ctx: &StreamContext,
        receiver: Option<Arc<dyn StreamReceiveListener>>,
    ) -> Arc<BoltStream> {
        let id = self.next_stream_id();
        let mut sctx = ctx.clone();
        sctx.stream_id = id as u64;
        let track = receiver.is_some();
        let stream = Arc::new(BoltStream {
            id,
            direction: StreamDirection::Client,
            ctx: sctx,
            conn: self.this.clone(),
            receiver: Mutex::new(receiver),
            send_cmd: Mutex::new(None),
            state: AtomicU8::new(STATE_OPEN),
            event_listener: Mutex::new(None),
        });
        if track {
            self.client_streams
                .write()
                .unwrap()
                .insert(id, stream.clone());
        }
        stream
    }

    /// Resets every in-flight stream; used when the transport dies.
    pub fn reset_all(&self, reason: StreamResetReason) {
        let client: Vec<Arc<BoltStream>> = self
            .client_streams
            .write()
            .unwrap()
            .drain()
            .map(|(_, s)| s)
            .collect();
        let server: Vec<Arc<BoltStream>> = self
            .server_streams
            .write()
            .unwrap()
            .drain()
            .map(|(_, s)| s)
            .collect();
        for stream in client.into_iter().chain(server) {
            stream.reset(reason);
        }
    }

    fn remove_stream(&self, stream: &BoltStream) {
        match stream.direction {
            StreamDirection::Client => {
                self.client_streams.write().unwrap().remove(&stream.id);
            }
            StreamDirection::Server => {
                self.server_streams.write().unwrap().remove(&stream.id);
            }
        }
    }
}

struct DispatchFilter(Arc<BoltStreamConnection>);

#[async_trait]
impl ReadFilter for DispatchFilter {
    async fn on_data(&self, buf: &mut IoBuffer) -> FilterStatus {
        self.0.dispatch(buf).await;
        FilterStatus::Continue
    }
}

struct CloseListener(Weak<BoltStreamConnection>);

impl ConnectionEventListener for CloseListener {
    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() {
            if let Some(sc) = self.0.upgrade() {
                sc.reset_all(StreamResetReason::ConnectionTermination);
            }
        }
    }
}

/// One request/response exchange on a Bolt connection. Server streams are
/// owned by their parent's map; client streams are co-owned by the caller
/// that opened them until reply or reset.
pub struct BoltStream {
    id: u32,
    direction: StreamDirection,
    ctx: StreamContext,
    conn: Weak<BoltStreamConnection>,
    receiver: Mutex<Option<Arc<dyn StreamReceiveListener>>>,
    send_cmd: Mutex<Option<BoltCommand>>,
    state: AtomicU8,
    event_listener: Mutex<Option<Arc<dyn StreamEventListener>>>,
}

impl BoltStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    pub fn set_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        *self.event_listener.lock().unwrap() = Some(listener);
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn fire_destroy(&self) {
        let listener = self.event_listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_destroy_stream();
        }
    }

    /// Terminal failure path; at most one terminal signal ever reaches the
    /// receiver.
    pub fn reset(&self, reason: StreamResetReason) {
        if !self.transition(STATE_OPEN, STATE_RESET) {
            return;
        }
        if let Some(sc) = self.conn.upgrade() {
            sc.remove_stream(self);
        }
        let listener = self.event_listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_reset_stream(reason);
            listener.on_destroy_stream();
        }
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.on_reset(reason);
        }
    }

    async fn end_stream(&self) -> TrellisResult<()> {
        let cmd = self.send_cmd.lock().unwrap().take();
        let Some(mut cmd) = cmd else {
            return Ok(());
        };
        cmd.request_id = self.id;

        let Some(sc) = self.conn.upgrade() else {
            self.reset(StreamResetReason::ConnectionFailed);
            return Err(TrellisError::ConnectionClosed);
        };
        let encoded = BoltCodec::encode(&cmd);
        debug!(
            "conn {} send {:?}, requestId = {}",
            sc.conn.id(),
            self.direction,
            self.id
        );
        match sc.conn.write(encoded.into_inner().freeze()) {
            Ok(()) => {
                if self.direction == StreamDirection::Server {
                    if self.transition(STATE_OPEN, STATE_DONE) {
                        sc.remove_stream(self);
                    }
                }
                Ok(())
            }
            Err(err) => {
                let reason = match err {
                    TrellisError::ConnectionClosed => StreamResetReason::ConnectionFailed,
                    _ => StreamResetReason::LocalReset,
                };
                self.reset(reason);
                Err(TrellisError::ConnectionClosed)
            }
        }
    }

    fn build_request(&self, mut bag: HeaderBag) -> BoltCommand {
        let timeout = bag
            .del(HEADER_GLOBAL_TIMEOUT)
            .and_then(|t| t.parse::<i32>().ok())
            .unwrap_or(REQUEST_TIMEOUT_NONE);
        for key in [
            HEADER_METHOD,
            HEADER_HOST,
            HEADER_PATH,
            HEADER_QUERYSTRING,
            HEADER_STATUS,
        ] {
            bag.del(key);
        }
        let mut cmd = BoltCommand::new_rpc_request(0, bag, Bytes::new(), timeout);
        // No receiver means no reply is expected: the request stays oneway
        // on the upstream wire.
        if self.receiver.lock().unwrap().is_none() {
            cmd.cmd_type = CMD_TYPE_REQUEST_ONEWAY;
        }
        cmd
    }

    fn build_response(mut bag: HeaderBag) -> BoltCommand {
        let status = bag
            .del(HEADER_STATUS)
            .and_then(|s| s.parse::<u32>().ok())
            .map(status_from_http)
            .unwrap_or(crate::protocol::bolt::STATUS_SERVER_EXCEPTION);
        for key in [
            HEADER_METHOD,
            HEADER_HOST,
            HEADER_PATH,
            HEADER_QUERYSTRING,
            HEADER_GLOBAL_TIMEOUT,
        ] {
            bag.del(key);
        }
        BoltCommand::new_rpc_response(0, status, bag, Bytes::new())
    }
}

#[async_trait]
impl StreamSender for BoltStream {
    async fn append_headers(&self, headers: HeaderBag, end_stream: bool) -> TrellisResult<()> {
        let cmd = match self.direction {
            StreamDirection::Client => self.build_request(headers),
            StreamDirection::Server => Self::build_response(headers),
        };
        *self.send_cmd.lock().unwrap() = Some(cmd);
        if end_stream {
            self.end_stream().await
        } else {
            Ok(())
        }
    }

    async fn append_data(&self, data: Bytes, end_stream: bool) -> TrellisResult<()> {
        if let Some(cmd) = self.send_cmd.lock().unwrap().as_mut() {
            cmd.content = data;
        }
        if end_stream {
            self.end_stream().await
        } else {
            Ok(())
        }
    }

    async fn append_trailers(&self, _trailers: HeaderBag) -> TrellisResult<()> {
        self.end_stream().await
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        self.reset(reason);
    }
}
