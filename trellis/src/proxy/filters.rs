use crate::stream::StreamContext;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_common::headers::HeaderBag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFilterStatus {
    Continue,
    /// Short-circuits the chain. With `hijack_status` set the proxy emits
    /// that response directly and skips the upstream.
    Stop,
}

/// Mutable state shared along one stream's filter chain.
#[derive(Debug, Default)]
pub struct FilterChainContext {
    pub hijack_status: Option<u32>,
    pub hijack_body: Option<String>,
    /// Filter-private variables, confined to the owning stream's task.
    pub vars: HashMap<String, String>,
}

/// A stream filter sees the request on the decode path and the response on
/// the encode path; both run inside the stream's single task, so no state
/// needs locking.
pub trait StreamFilter: Send + Sync {
    fn on_receive(
        &self,
        _ctx: &mut FilterChainContext,
        _headers: &mut HeaderBag,
        _data: Option<&mut Bytes>,
    ) -> StreamFilterStatus {
        StreamFilterStatus::Continue
    }

    fn on_send(
        &self,
        _ctx: &mut FilterChainContext,
        _headers: &mut HeaderBag,
        _data: Option<&mut Bytes>,
    ) -> StreamFilterStatus {
        StreamFilterStatus::Continue
    }
}

/// Installed per listener; invoked once per detected stream.
pub trait StreamFilterChainFactory: Send + Sync {
    fn create_filters(&self, ctx: &StreamContext) -> Vec<Arc<dyn StreamFilter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hijacker;

    impl StreamFilter for Hijacker {
        fn on_receive(
            &self,
            ctx: &mut FilterChainContext,
            headers: &mut HeaderBag,
            _data: Option<&mut Bytes>,
        ) -> StreamFilterStatus {
            if headers.get("x-block").is_some() {
                ctx.hijack_status = Some(403);
                return StreamFilterStatus::Stop;
            }
            StreamFilterStatus::Continue
        }
    }

    #[test]
    fn filter_can_hijack() {
        let filter = Hijacker;
        let mut ctx = FilterChainContext::default();
        let mut headers = HeaderBag::new();
        headers.set("x-block", "1");
        let status = filter.on_receive(&mut ctx, &mut headers, None);
        assert_eq!(status, StreamFilterStatus::Stop);
        assert_eq!(ctx.hijack_status, Some(403));
    }
}
