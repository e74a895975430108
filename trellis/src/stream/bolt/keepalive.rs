use super::stream::BoltStreamConnection;
use crate::network::ConnectionEvent;
use crate::protocol::bolt::{BoltCodec, BoltCommand};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_KEEPALIVE_THRESHOLD: u32 = 3;

/// Heartbeats an idle upstream Bolt connection. Consecutive unanswered
/// heartbeats past the threshold close the transport, which evicts the
/// pool's active client.
pub struct BoltKeepAlive {
    this: Weak<BoltKeepAlive>,
    conn: Weak<BoltStreamConnection>,
    interval: Duration,
    threshold: u32,
    pending: Mutex<HashSet<u32>>,
    failures: AtomicU32,
    stopped: AtomicBool,
}

impl BoltKeepAlive {
    pub fn new(conn: &Arc<BoltStreamConnection>, interval: Duration, threshold: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| BoltKeepAlive {
            this: this.clone(),
            conn: Arc::downgrade(conn),
            interval,
            threshold,
            pending: Mutex::new(HashSet::new()),
            failures: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn start(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.interval).await;
                if this.stopped.load(Ordering::Acquire) {
                    return;
                }
                let Some(sc) = this.conn.upgrade() else {
                    return;
                };
                if sc.connection().is_closed() {
                    return;
                }
                this.send_heartbeat(sc);
            }
        });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn send_heartbeat(&self, sc: Arc<BoltStreamConnection>) {
        let id = sc.next_stream_id();
        self.pending.lock().unwrap().insert(id);
        debug!("conn {} send heartbeat, requestId = {}", sc.connection().id(), id);
        let frame = BoltCodec::encode(&BoltCommand::new_heartbeat(id));
        if sc.connection().write(frame.into_inner().freeze()).is_err() {
            self.on_miss(id, sc);
            return;
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(this.interval).await;
            if this.pending.lock().unwrap().remove(&id) {
                this.on_miss(id, sc);
            }
        });
    }

    fn on_miss(&self, id: u32, sc: Arc<BoltStreamConnection>) {
        self.pending.lock().unwrap().remove(&id);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "conn {} heartbeat miss, requestId = {}, consecutive = {}",
            sc.connection().id(),
            id,
            failures
        );
        if failures >= self.threshold && !self.stopped.load(Ordering::Acquire) {
            sc.connection().close(ConnectionEvent::LocalClose);
        }
    }

    /// Acks refresh the timer by clearing the consecutive-miss count.
    pub fn handle_ack(&self, id: u32) {
        if self.pending.lock().unwrap().remove(&id) {
            self.failures.store(0, Ordering::Release);
        }
    }
}
