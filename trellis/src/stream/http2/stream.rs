use crate::network::{ConnectionEvent, RewindIo};
use crate::protocol::ProtocolName;
use crate::stream::{
    ContextManager, ServerStreamConnectionEventListener, StreamContext, StreamEventListener,
    StreamReceiveListener, StreamResetReason, StreamSender,
};
use crate::sync::WorkerPool;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error};
use trellis_common::error::TrellisError;
use trellis_common::headers::{
    HeaderBag, HEADER_GLOBAL_TIMEOUT, HEADER_HOST, HEADER_METHOD, HEADER_PATH,
    HEADER_QUERYSTRING, HEADER_STATUS,
};
use trellis_common::TrellisResult;

const STATE_OPEN: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_RESET: u8 = 2;

// The RFC 7540 default windows are too small for a proxy in the middle.
const CONN_WINDOW: u32 = 1024 * 1024;
const STREAM_WINDOW: u32 = 1024 * 1024;
const MAX_CONCURRENT_STREAMS: u32 = 200;

fn server_builder() -> h2::server::Builder {
    let mut builder = h2::server::Builder::default();
    builder
        .initial_window_size(STREAM_WINDOW)
        .initial_connection_window_size(CONN_WINDOW)
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS);
    builder
}

fn client_builder() -> h2::client::Builder {
    let mut builder = h2::client::Builder::default();
    builder
        .initial_window_size(STREAM_WINDOW)
        .initial_connection_window_size(CONN_WINDOW);
    builder
}

fn header_keys_to_strip() -> [&'static str; 6] {
    [
        HEADER_METHOD,
        HEADER_HOST,
        HEADER_PATH,
        HEADER_QUERYSTRING,
        HEADER_STATUS,
        HEADER_GLOBAL_TIMEOUT,
    ]
}

fn bag_to_header_map(bag: &HeaderBag) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in bag.iter() {
        if header_keys_to_strip().contains(&k.as_str()) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(k.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(v) else {
            continue;
        };
        map.insert(name, value);
    }
    map
}

/// Runs the server side of one HTTP/2 connection: handshake over the
/// replayed preface, then one proxy stream per accepted request. Returns
/// when the peer goes away; the caller fans the termination out to the
/// still-active streams.
pub async fn serve_server_connection(
    io: RewindIo,
    conn_id: u64,
    callbacks: Arc<dyn ServerStreamConnectionEventListener>,
    worker_pool: Arc<WorkerPool>,
) -> crate::Result<()> {
    let mut connection = server_builder().handshake::<_, Bytes>(io).await?;
    let mut cm = ContextManager::new(conn_id, ProtocolName::Http2);
    debug!("conn {} new http2 server stream connection", conn_id);

    while let Some(result) = connection.accept().await {
        let (request, respond) = match result {
            Ok(pair) => pair,
            Err(e) => {
                debug!("conn {} http2 accept error: {}", conn_id, e);
                break;
            }
        };
        let ctx = cm.get();
        cm.next();

        let sender = Arc::new(Http2ServerStream {
            inner: Mutex::new(ServerSendState {
                respond: Some(respond),
                send_stream: None,
                headers: None,
            }),
            state: AtomicU8::new(STATE_OPEN),
        });
        let receiver = callbacks.new_stream_detect(ctx.clone(), Some(sender));

        worker_pool.spawn(async move {
            let (parts, mut body) = request.into_parts();
            let mut bag = HeaderBag::from(&parts.headers);
            bag.set(HEADER_METHOD, parts.method.as_str());
            bag.set(HEADER_PATH, parts.uri.path());
            if let Some(query) = parts.uri.query() {
                bag.set(HEADER_QUERYSTRING, query);
            }
            if let Some(authority) = parts.uri.authority() {
                bag.set(HEADER_HOST, authority.as_str());
            } else if let Some(host) = bag.get("host").map(|h| h.to_owned()) {
                bag.set(HEADER_HOST, host);
            }

            let mut data = BytesMut::new();
            while let Some(chunk) = body.data().await {
                match chunk {
                    Ok(bytes) => {
                        let _ = body.flow_control().release_capacity(bytes.len());
                        data.extend_from_slice(&bytes);
                    }
                    Err(e) => {
                        debug!("http2 request body error: {}", e);
                        receiver.on_reset(StreamResetReason::RemoteReset);
                        return;
                    }
                }
            }
            let trailers = match body.trailers().await {
                Ok(trailers) => trailers.map(|t| HeaderBag::from(&t)),
                Err(_) => None,
            };
            let data = if data.is_empty() {
                None
            } else {
                Some(data.freeze())
            };
            receiver.on_receive(&ctx, bag, data, trailers).await;
        });
    }
    Ok(())
}

struct ServerSendState {
    respond: Option<h2::server::SendResponse<Bytes>>,
    send_stream: Option<h2::SendStream<Bytes>>,
    headers: Option<HeaderBag>,
}

/// Downstream response sender for one HTTP/2 server stream.
pub struct Http2ServerStream {
    inner: Mutex<ServerSendState>,
    state: AtomicU8,
}

impl Http2ServerStream {
    fn build_response(bag: &HeaderBag) -> Response<()> {
        let status = bag
            .get(HEADER_STATUS)
            .and_then(|s| s.parse::<u16>().ok())
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::OK);
        let mut response = Response::builder().status(status).body(()).unwrap();
        *response.headers_mut() = bag_to_header_map(bag);
        response
    }

    fn send_headers(&self, headers: &HeaderBag, end_stream: bool) -> TrellisResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut respond) = inner.respond.take() else {
            return Err(TrellisError::Other("response already sent".into()));
        };
        let response = Self::build_response(headers);
        match respond.send_response(response, end_stream) {
            Ok(send_stream) => {
                if end_stream {
                    self.state.store(STATE_DONE, Ordering::Release);
                } else {
                    inner.send_stream = Some(send_stream);
                }
                Ok(())
            }
            Err(e) => {
                self.state.store(STATE_RESET, Ordering::Release);
                Err(TrellisError::Other(format!("send response: {}", e)))
            }
        }
    }
}

#[async_trait]
impl StreamSender for Http2ServerStream {
    async fn append_headers(&self, headers: HeaderBag, end_stream: bool) -> TrellisResult<()> {
        if end_stream {
            self.send_headers(&headers, true)
        } else {
            self.inner.lock().unwrap().headers = Some(headers);
            Ok(())
        }
    }

    async fn append_data(&self, data: Bytes, end_stream: bool) -> TrellisResult<()> {
        {
            let headers = self.inner.lock().unwrap().headers.take();
            if let Some(headers) = headers {
                self.send_headers(&headers, false)?;
            }
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(send_stream) = inner.send_stream.as_mut() else {
            return Err(TrellisError::Other("no open send stream".into()));
        };
        send_stream
            .send_data(data, end_stream)
            .map_err(|e| TrellisError::Other(format!("send data: {}", e)))?;
        if end_stream {
            self.state.store(STATE_DONE, Ordering::Release);
        }
        Ok(())
    }

    async fn append_trailers(&self, trailers: HeaderBag) -> TrellisResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(send_stream) = inner.send_stream.as_mut() else {
            return Err(TrellisError::Other("no open send stream".into()));
        };
        send_stream
            .send_trailers(bag_to_header_map(&trailers))
            .map_err(|e| TrellisError::Other(format!("send trailers: {}", e)))?;
        self.state.store(STATE_DONE, Ordering::Release);
        Ok(())
    }

    fn reset_stream(&self, _reason: StreamResetReason) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_RESET, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(send_stream) = inner.send_stream.as_mut() {
            send_stream.send_reset(h2::Reason::CANCEL);
        } else if let Some(respond) = inner.respond.as_mut() {
            respond.send_reset(h2::Reason::CANCEL);
        }
    }
}

/// Client (egress) side of one HTTP/2 connection; hands out request
/// streams over a shared multiplexed transport.
pub struct Http2ClientStreamConnection {
    this: std::sync::Weak<Http2ClientStreamConnection>,
    conn_id: u64,
    send_request: Mutex<Option<h2::client::SendRequest<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl Http2ClientStreamConnection {
    /// Dials and handshakes; `on_closed` fires once when the connection
    /// task ends for any reason.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        on_closed: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<Self>, ConnectionEvent> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(ConnectionEvent::ConnectTimeout),
            Ok(Err(e)) => {
                debug!("http2 connect {} failed: {}", addr, e);
                return Err(ConnectionEvent::ConnectFailed);
            }
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);
        let (send_request, connection) = client_builder()
            .handshake::<_, Bytes>(stream)
            .await
            .map_err(|e| {
                debug!("http2 handshake {} failed: {}", addr, e);
                ConnectionEvent::ConnectFailed
            })?;

        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http2 client connection error: {}", e);
            }
            closed_flag.store(true, Ordering::Release);
            on_closed();
        });

        Ok(Arc::new_cyclic(|this| Http2ClientStreamConnection {
            this: this.clone(),
            conn_id: crate::network::alloc_conn_id(),
            send_request: Mutex::new(Some(send_request)),
            closed,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn new_stream(
        &self,
        ctx: &StreamContext,
        receiver: Option<Arc<dyn StreamReceiveListener>>,
    ) -> Arc<Http2ClientStream> {
        let conn = self.this.upgrade().expect("client connection alive");
        Arc::new_cyclic(|this| Http2ClientStream {
            this: this.clone(),
            ctx: ctx.clone(),
            conn,
            send_stream: Mutex::new(None),
            receiver: Mutex::new(receiver),
            event_listener: Mutex::new(None),
            state: AtomicU8::new(STATE_OPEN),
        })
    }
}

/// One upstream HTTP/2 exchange.
pub struct Http2ClientStream {
    this: std::sync::Weak<Http2ClientStream>,
    ctx: StreamContext,
    conn: Arc<Http2ClientStreamConnection>,
    send_stream: Mutex<Option<h2::SendStream<Bytes>>>,
    receiver: Mutex<Option<Arc<dyn StreamReceiveListener>>>,
    event_listener: Mutex<Option<Arc<dyn StreamEventListener>>>,
    state: AtomicU8,
}

impl Http2ClientStream {
    pub fn set_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        *self.event_listener.lock().unwrap() = Some(listener);
    }

    fn build_request(bag: &HeaderBag) -> Request<()> {
        let method = bag.get(HEADER_METHOD).unwrap_or("GET");
        let path = bag.get(HEADER_PATH).unwrap_or("/");
        let authority = bag.get(HEADER_HOST).unwrap_or("localhost");
        // The scheme/authority pseudo headers come from an absolute URI.
        let uri = match bag.get(HEADER_QUERYSTRING) {
            Some(query) => format!("http://{}{}?{}", authority, path, query),
            None => format!("http://{}{}", authority, path),
        };
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap_or_else(|_| {
                Request::builder()
                    .method("GET")
                    .uri("http://localhost/")
                    .body(())
                    .unwrap()
            });
        request.headers_mut().extend(bag_to_header_map(bag));
        request
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

    fn reset(&self, reason: StreamResetReason) {
        if !self.transition(STATE_OPEN, STATE_RESET) {
            return;
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

    fn spawn_response_task(self: Arc<Self>, response: h2::client::ResponseFuture) {
        let this = self;
        tokio::spawn(async move {
            match response.await {
                Ok(response) => {
                    let (parts, mut body) = response.into_parts();
                    let mut bag = HeaderBag::from(&parts.headers);
                    bag.set(HEADER_STATUS, parts.status.as_u16().to_string());

                    let mut data = BytesMut::new();
                    while let Some(chunk) = body.data().await {
                        match chunk {
                            Ok(bytes) => {
                                let _ = body.flow_control().release_capacity(bytes.len());
                                data.extend_from_slice(&bytes);
                            }
                            Err(e) => {
                                debug!("http2 response body error: {}", e);
                                this.reset(StreamResetReason::RemoteReset);
                                return;
                            }
                        }
                    }
                    let trailers = match body.trailers().await {
                        Ok(trailers) => trailers.map(|t| HeaderBag::from(&t)),
                        Err(_) => None,
                    };
                    if !this.transition(STATE_OPEN, STATE_DONE) {
                        return;
                    }
                    this.fire_destroy();
                    let data = if data.is_empty() {
                        None
                    } else {
                        Some(data.freeze())
                    };
                    let receiver = this.receiver.lock().unwrap().clone();
                    if let Some(receiver) = receiver {
                        receiver.on_receive(&this.ctx, bag, data, trailers).await;
                    }
                }
                Err(e) => {
                    error!("http2 response error: {}", e);
                    let reason = if this.conn.is_closed() || e.is_io() || e.is_go_away() {
                        StreamResetReason::ConnectionTermination
                    } else {
                        StreamResetReason::RemoteReset
                    };
                    this.reset(reason);
                }
            }
        });
    }
}

#[async_trait]
impl StreamSender for Http2ClientStream {
    async fn append_headers(&self, headers: HeaderBag, end_stream: bool) -> TrellisResult<()> {
        // SendRequest handles are cheap clones over one multiplexed
        // transport; concurrent streams each ready their own.
        let send_request = self.conn.send_request.lock().unwrap().clone();
        let Some(send_request) = send_request else {
            return Err(TrellisError::ConnectionClosed);
        };
        let mut ready = match send_request.ready().await {
            Ok(ready) => ready,
            Err(e) => {
                debug!("conn {} not ready: {}", self.conn.conn_id, e);
                return Err(TrellisError::ConnectionClosed);
            }
        };
        let request = Self::build_request(&headers);
        let result = ready.send_request(request, end_stream);

        match result {
            Ok((response, send_stream)) => {
                *self.send_stream.lock().unwrap() = Some(send_stream);
                if let Some(this) = self.this.upgrade() {
                    this.spawn_response_task(response);
                }
                Ok(())
            }
            Err(e) => {
                self.reset(StreamResetReason::LocalReset);
                Err(TrellisError::Other(format!("send request: {}", e)))
            }
        }
    }

    async fn append_data(&self, data: Bytes, end_stream: bool) -> TrellisResult<()> {
        let mut send_stream = self.send_stream.lock().unwrap();
        let Some(stream) = send_stream.as_mut() else {
            return Err(TrellisError::Other("no open send stream".into()));
        };
        stream
            .send_data(data, end_stream)
            .map_err(|e| TrellisError::Other(format!("send data: {}", e)))
    }

    async fn append_trailers(&self, trailers: HeaderBag) -> TrellisResult<()> {
        let mut send_stream = self.send_stream.lock().unwrap();
        let Some(stream) = send_stream.as_mut() else {
            return Err(TrellisError::Other("no open send stream".into()));
        };
        stream
            .send_trailers(bag_to_header_map(&trailers))
            .map_err(|e| TrellisError::Other(format!("send trailers: {}", e)))
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        if let Some(stream) = self.send_stream.lock().unwrap().as_mut() {
            stream.send_reset(h2::Reason::CANCEL);
        }
        self.reset(reason);
    }
}
