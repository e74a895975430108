use super::filters::{FilterChainContext, StreamFilter, StreamFilterStatus};
use super::ProxyShared;
use crate::router::{Route, RouteAction};
use crate::stream::{
    reset_reason_to_response_flag, PoolEventListener, PoolFailureReason, ResponseFlag,
    StreamContext, StreamReceiveListener, StreamResetReason, StreamSender,
};
use crate::upstream::loadbalancer::LbContext;
use crate::upstream::{ClusterSnapshot, Host};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use trellis_common::error::TrellisError;
use trellis_common::headers::{HeaderBag, HEADER_GLOBAL_TIMEOUT, HEADER_STATUS};

const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_READY_POLL: Duration = Duration::from_millis(10);

/// One in-flight request/response exchange through the proxy: decode filter
/// chain, route match, pool selection, upstream forwarding with retries and
/// timeouts, response forwarding.
pub struct DownStream {
    ctx: StreamContext,
    shared: Arc<ProxyShared>,
    /// Downstream response sender; `None` for oneway requests.
    sender: Option<Arc<dyn StreamSender>>,
    filters: Vec<Arc<dyn StreamFilter>>,
    filter_ctx: Mutex<FilterChainContext>,
    reset_flag: AtomicBool,
    reset_watch: watch::Sender<bool>,
    finished: AtomicBool,
    response_flag: Mutex<Option<ResponseFlag>>,
}

enum UpstreamEvent {
    Ready {
        sender: Arc<dyn StreamSender>,
    },
    Failure {
        reason: PoolFailureReason,
        host: Arc<Host>,
    },
    Response {
        headers: HeaderBag,
        data: Option<Bytes>,
        trailers: Option<HeaderBag>,
    },
    Reset(StreamResetReason),
    DecodeError,
}

/// Per-attempt bridge: pool callbacks and the upstream stream's receiver
/// both feed the downstream task's event queue.
struct UpstreamRequest {
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl PoolEventListener for UpstreamRequest {
    fn on_ready(&self, sender: Arc<dyn StreamSender>, _host: Arc<Host>) {
        let _ = self.tx.send(UpstreamEvent::Ready { sender });
    }

    fn on_failure(&self, reason: PoolFailureReason, host: Arc<Host>) {
        let _ = self.tx.send(UpstreamEvent::Failure { reason, host });
    }
}

#[async_trait]
impl StreamReceiveListener for UpstreamRequest {
    async fn on_receive(
        &self,
        _ctx: &StreamContext,
        headers: HeaderBag,
        data: Option<Bytes>,
        trailers: Option<HeaderBag>,
    ) {
        let _ = self.tx.send(UpstreamEvent::Response {
            headers,
            data,
            trailers,
        });
    }

    async fn on_decode_error(&self, _ctx: &StreamContext, _err: &TrellisError) {
        let _ = self.tx.send(UpstreamEvent::DecodeError);
    }

    fn on_reset(&self, reason: StreamResetReason) {
        let _ = self.tx.send(UpstreamEvent::Reset(reason));
    }
}

enum AttemptOutcome {
    /// Terminal: a response (real or synthesized) went downstream.
    Done,
    /// The attempt failed in a way the retry policy may absorb.
    Retry(StreamResetReason),
    /// Terminal failure, no retry.
    Fail(StreamResetReason),
    /// Downstream went away mid-attempt.
    Cancelled,
}

impl DownStream {
    pub fn new(
        ctx: StreamContext,
        shared: Arc<ProxyShared>,
        sender: Option<Arc<dyn StreamSender>>,
        filters: Vec<Arc<dyn StreamFilter>>,
    ) -> Arc<Self> {
        Arc::new(DownStream {
            ctx,
            shared,
            sender,
            filters,
            filter_ctx: Mutex::new(FilterChainContext::default()),
            reset_flag: AtomicBool::new(false),
            reset_watch: watch::channel(false).0,
            finished: AtomicBool::new(false),
            response_flag: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    fn is_reset(&self) -> bool {
        self.reset_flag.load(Ordering::Acquire)
    }

    fn set_flag(&self, flag: ResponseFlag) {
        self.response_flag.lock().unwrap().get_or_insert(flag);
    }

    /// Marks the exchange complete exactly once and releases bookkeeping.
    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stats.downstream_request_active.dec();
        self.shared.remove_stream(self);
        let flag = *self.response_flag.lock().unwrap();
        if let Some(flag) = flag {
            info!(
                trace_id = %self.ctx.trace_id,
                response_flag = ?flag,
                "request finished with flag"
            );
        }
    }

    async fn process(&self, mut headers: HeaderBag, mut data: Option<Bytes>, trailers: Option<HeaderBag>) {
        // Decode-side filter chain; a Stop with a hijack status
        // short-circuits the upstream entirely.
        for filter in &self.filters {
            let status = {
                let mut fctx = self.filter_ctx.lock().unwrap();
                filter.on_receive(&mut fctx, &mut headers, data.as_mut())
            };
            if status == StreamFilterStatus::Stop {
                let (status, body) = {
                    let fctx = self.filter_ctx.lock().unwrap();
                    (fctx.hijack_status.unwrap_or(500), fctx.hijack_body.clone())
                };
                self.send_hijack_reply(status, body).await;
                return;
            }
        }

        let Some(wrapper) = &self.shared.router_wrapper else {
            self.set_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(404, None).await;
            return;
        };
        let routers = wrapper.routers();
        let Some(route) = routers.match_route(&headers) else {
            self.set_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(404, None).await;
            return;
        };
        if let Some(direct) = route.direct_response() {
            self.send_hijack_reply(direct.status, direct.body.clone()).await;
            return;
        }
        let Some(action) = route.action() else {
            self.set_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(404, None).await;
            return;
        };

        route.apply_request_mutations(&mut headers);

        let cluster_name = action.pick_cluster();
        let Some(snapshot) = self.shared.cluster_manager.get_cluster_snapshot(&cluster_name)
        else {
            debug!("cluster {} not found", cluster_name);
            self.set_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(404, None).await;
            return;
        };

        // Route timeout, overridable by the global-timeout request header.
        let timeout = headers
            .get(HEADER_GLOBAL_TIMEOUT)
            .and_then(|t| t.parse::<i64>().ok())
            .filter(|t| *t > 0)
            .map(|t| Duration::from_millis(t as u64))
            .or(action.timeout)
            .unwrap_or(DEFAULT_GLOBAL_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let retries = match action.retry_policy {
            Some(policy) if policy.retry_on => policy.num_retries,
            _ => 0,
        };
        let max_attempts = 1 + retries;

        let mut excluded: Vec<String> = Vec::new();
        let mut last_reason = StreamResetReason::ConnectionFailed;
        for attempt in 0..max_attempts {
            if self.is_reset() {
                self.finish();
                return;
            }
            let resource_manager = snapshot.info.resource_manager();
            if attempt > 0 {
                if !resource_manager.retries.can_create() {
                    self.set_flag(ResponseFlag::UpstreamOverflow);
                    self.send_hijack_reply(503, None).await;
                    return;
                }
                resource_manager.retries.increase();
                snapshot.info.stats().upstream_request_retry.inc();
            }

            let outcome = self
                .try_upstream(
                    &snapshot,
                    &route,
                    action,
                    &headers,
                    &data,
                    &trailers,
                    deadline,
                    attempt + 1 < max_attempts,
                    &mut excluded,
                )
                .await;
            if attempt > 0 {
                resource_manager.retries.decrease();
            }

            match outcome {
                AttemptOutcome::Done => return,
                AttemptOutcome::Cancelled => {
                    self.finish();
                    return;
                }
                AttemptOutcome::Retry(reason) => {
                    last_reason = reason;
                }
                AttemptOutcome::Fail(reason) => {
                    self.send_reset_response(reason).await;
                    return;
                }
            }
        }
        self.send_reset_response(last_reason).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_upstream(
        &self,
        snapshot: &ClusterSnapshot,
        route: &Arc<Route>,
        action: &RouteAction,
        headers: &HeaderBag,
        data: &Option<Bytes>,
        trailers: &Option<HeaderBag>,
        deadline: Instant,
        retry_allowed: bool,
        excluded: &mut Vec<String>,
    ) -> AttemptOutcome {
        let lb_ctx = LbContext {
            metadata: action.metadata_match.clone(),
            excluded: excluded.clone(),
        };
        let Some(host) = snapshot.choose_host(&lb_ctx) else {
            self.set_flag(ResponseFlag::NoHealthyUpstream);
            self.send_hijack_reply(503, None).await;
            return AttemptOutcome::Done;
        };
        debug!(
            trace_id = %self.ctx.trace_id,
            "choose host {} in cluster {}",
            host.address(),
            snapshot.info.name()
        );

        let pool = self
            .shared
            .cluster_manager
            .conn_pool_for_host(&host, self.ctx.protocol);

        // The pool never blocks its caller: trigger the dial once, then
        // watch its outcome until the connect window closes. An evicted
        // client means the dial failed, no point waiting further.
        let connect_deadline =
            deadline.min(Instant::now() + snapshot.info.connect_timeout() + POOL_READY_POLL);
        if !pool.check_and_init(&self.ctx).await {
            loop {
                match pool.readiness(&self.ctx) {
                    crate::stream::PoolReadiness::Connected => break,
                    crate::stream::PoolReadiness::Failed => break,
                    crate::stream::PoolReadiness::Connecting => {
                        if Instant::now() >= connect_deadline || self.is_reset() {
                            break;
                        }
                        tokio::time::sleep(POOL_READY_POLL).await;
                    }
                }
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let upstream_request = Arc::new(UpstreamRequest { tx });
        let receiver: Option<Arc<dyn StreamReceiveListener>> = if self.sender.is_some() {
            Some(upstream_request.clone())
        } else {
            None
        };
        pool.new_stream(&self.ctx, receiver, upstream_request).await;

        let per_try = action.retry_policy.and_then(|p| p.per_try_timeout);
        let attempt_deadline = per_try
            .map(|d| (Instant::now() + d).min(deadline))
            .unwrap_or(deadline);
        let per_try_fires_first = attempt_deadline < deadline;

        let mut reset_rx = self.reset_watch.subscribe();
        if self.is_reset() {
            return AttemptOutcome::Cancelled;
        }
        let mut upstream_sender: Option<Arc<dyn StreamSender>> = None;
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = reset_rx.changed() => {
                    if let Some(sender) = &upstream_sender {
                        sender.reset_stream(StreamResetReason::LocalReset);
                    }
                    return AttemptOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(attempt_deadline.into()) => {
                    host.stats().upstream_request_timeout.inc();
                    snapshot.info.stats().upstream_request_timeout.inc();
                    if let Some(sender) = &upstream_sender {
                        sender.reset_stream(StreamResetReason::LocalReset);
                    }
                    if per_try_fires_first && retry_allowed {
                        excluded.push(host.address().to_owned());
                        return AttemptOutcome::Retry(StreamResetReason::LocalReset);
                    }
                    self.set_flag(ResponseFlag::UpstreamRequestTimeout);
                    self.send_hijack_reply(504, None).await;
                    return AttemptOutcome::Done;
                }
            };

            let Some(event) = event else {
                return AttemptOutcome::Fail(StreamResetReason::LocalReset);
            };
            match event {
                UpstreamEvent::Ready { sender } => {
                    upstream_sender = Some(sender.clone());
                    let end_on_headers = data.is_none() && trailers.is_none();
                    if sender
                        .append_headers(headers.clone(), end_on_headers)
                        .await
                        .is_err()
                    {
                        excluded.push(host.address().to_owned());
                        return AttemptOutcome::Retry(StreamResetReason::ConnectionFailed);
                    }
                    if let Some(body) = data {
                        if sender
                            .append_data(body.clone(), trailers.is_none())
                            .await
                            .is_err()
                        {
                            excluded.push(host.address().to_owned());
                            return AttemptOutcome::Retry(StreamResetReason::ConnectionFailed);
                        }
                    }
                    if let Some(t) = trailers {
                        let _ = sender.append_trailers(t.clone()).await;
                    }
                    if self.sender.is_none() {
                        // Oneway: nothing more to wait for.
                        self.finish();
                        return AttemptOutcome::Done;
                    }
                }
                UpstreamEvent::Failure { reason, host } => match reason {
                    PoolFailureReason::ConnectionFailure => {
                        excluded.push(host.address().to_owned());
                        return AttemptOutcome::Retry(StreamResetReason::ConnectionFailed);
                    }
                    PoolFailureReason::Overflow => {
                        return AttemptOutcome::Fail(StreamResetReason::Overflow);
                    }
                },
                UpstreamEvent::Response {
                    headers: response_headers,
                    data: response_data,
                    trailers: response_trailers,
                } => {
                    self.send_response(route, response_headers, response_data, response_trailers)
                        .await;
                    return AttemptOutcome::Done;
                }
                UpstreamEvent::Reset(reason) => match reason {
                    StreamResetReason::ConnectionFailed
                    | StreamResetReason::ConnectionTermination => {
                        excluded.push(host.address().to_owned());
                        return AttemptOutcome::Retry(reason);
                    }
                    other => return AttemptOutcome::Fail(other),
                },
                UpstreamEvent::DecodeError => {
                    self.set_flag(ResponseFlag::UpstreamRemoteReset);
                    self.send_hijack_reply(502, None).await;
                    return AttemptOutcome::Done;
                }
            }
        }
    }

    async fn send_response(
        &self,
        route: &Arc<Route>,
        mut headers: HeaderBag,
        mut data: Option<Bytes>,
        trailers: Option<HeaderBag>,
    ) {
        for filter in &self.filters {
            let status = {
                let mut fctx = self.filter_ctx.lock().unwrap();
                filter.on_send(&mut fctx, &mut headers, data.as_mut())
            };
            if status == StreamFilterStatus::Stop {
                let (status, body) = {
                    let fctx = self.filter_ctx.lock().unwrap();
                    (fctx.hijack_status.unwrap_or(500), fctx.hijack_body.clone())
                };
                self.send_hijack_reply(status, body).await;
                return;
            }
        }
        route.apply_response_mutations(&mut headers);

        let Some(sender) = &self.sender else {
            self.finish();
            return;
        };
        let end_on_headers = data.is_none() && trailers.is_none();
        if sender.append_headers(headers, end_on_headers).await.is_ok() {
            if let Some(body) = data {
                let _ = sender.append_data(body, trailers.is_none()).await;
            }
            if let Some(t) = trailers {
                let _ = sender.append_trailers(t).await;
            }
        }
        self.finish();
    }

    /// Emits a synthesized response without upstream contact.
    async fn send_hijack_reply(&self, status: u32, body: Option<String>) {
        if let Some(sender) = &self.sender {
            let mut headers = HeaderBag::new();
            headers.set(HEADER_STATUS, status.to_string());
            match body {
                Some(body) if !body.is_empty() => {
                    if sender.append_headers(headers, false).await.is_ok() {
                        let _ = sender.append_data(Bytes::from(body), true).await;
                    }
                }
                _ => {
                    let _ = sender.append_headers(headers, true).await;
                }
            }
        }
        self.finish();
    }

    /// Terminal upstream failure: status mapped from the failure class,
    /// response flag recorded for the access log.
    async fn send_reset_response(&self, reason: StreamResetReason) {
        self.set_flag(reset_reason_to_response_flag(reason));
        let status = match reason {
            StreamResetReason::Overflow => 503,
            _ => 502,
        };
        self.send_hijack_reply(status, None).await;
    }
}

#[async_trait]
impl StreamReceiveListener for DownStream {
    async fn on_receive(
        &self,
        _ctx: &StreamContext,
        headers: HeaderBag,
        data: Option<Bytes>,
        trailers: Option<HeaderBag>,
    ) {
        self.process(headers, data, trailers).await;
    }

    async fn on_decode_error(&self, _ctx: &StreamContext, err: &TrellisError) {
        debug!("downstream decode error: {}", err);
        self.send_hijack_reply(400, None).await;
    }

    fn on_reset(&self, reason: StreamResetReason) {
        if self.reset_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(trace_id = %self.ctx.trace_id, "downstream reset: {:?}", reason);
        if reason == StreamResetReason::ConnectionTermination {
            self.set_flag(ResponseFlag::DownstreamConnectionTermination);
        }
        self.shared.stats.downstream_request_reset.inc();
        let _ = self.reset_watch.send(true);
        self.finish();
    }
}
