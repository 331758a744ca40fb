//! Keep-alive pings for the main connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_mtproto::{PendingRpcOperation, RpcLayer};
use tokio::task::JoinHandle;

/// `ping_delay_disconnect#f3427b8c ping_id:long disconnect_delay:int`
const PING_DELAY_DISCONNECT: u32 = 0xf3427b8c;

fn build_ping_request(ping_id: u64, disconnect_delay: i32) -> Vec<u8> {
    let mut request = Vec::with_capacity(16);
    request.extend(PING_DELAY_DISCONNECT.to_le_bytes());
    request.extend(ping_id.to_le_bytes());
    request.extend(disconnect_delay.to_le_bytes());
    request
}

type PingFailedCallback = Box<dyn Fn() + Send + Sync>;

struct PingInner {
    rpc_layer:         Arc<dyn RpcLayer>,
    interval:          Duration,
    failure_threshold: u32,
    active:            AtomicBool,
    task:              Mutex<Option<JoinHandle<()>>>,
    ping_failed:       Mutex<Vec<PingFailedCallback>>,
    ping_sequence:     AtomicU64,
}

/// Periodic liveness probe over the main connection's RPC layer.
///
/// While active, sends `ping_delay_disconnect` every interval; when the
/// configured number of consecutive pings goes unanswered, the
/// `ping_failed` callbacks fire. The owner decides the policy; the
/// controller today only logs.
#[derive(Clone)]
pub struct PingOperation {
    inner: Arc<PingInner>,
}

impl PingOperation {
    pub fn new(rpc_layer: Arc<dyn RpcLayer>, interval: Duration, failure_threshold: u32) -> Self {
        Self {
            inner: Arc::new(PingInner {
                rpc_layer,
                interval,
                failure_threshold: failure_threshold.max(1),
                active: AtomicBool::new(false),
                task: Mutex::new(None),
                ping_failed: Mutex::new(Vec::new()),
                ping_sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn on_ping_failed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.ping_failed.lock().unwrap().push(Box::new(callback));
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn ensure_active(&self) {
        if self.inner.active.swap(true, Ordering::Relaxed) {
            return;
        }
        log::debug!("[ping] keep-alive activated");
        let handle = tokio::spawn(run_ping_loop(Arc::downgrade(&self.inner)));
        *self.inner.task.lock().unwrap() = Some(handle);
    }

    pub fn ensure_inactive(&self) {
        if !self.inner.active.swap(false, Ordering::Relaxed) {
            return;
        }
        log::debug!("[ping] keep-alive deactivated");
        if let Some(task) = self.inner.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_ping_loop(inner: Weak<PingInner>) {
    let (interval, threshold) = match inner.upgrade() {
        Some(inner) => (inner.interval, inner.failure_threshold),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending: Option<Arc<PendingRpcOperation>> = None;
    let mut failures = 0u32;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        if !inner.active.load(Ordering::Relaxed) {
            return;
        }
        if let Some(operation) = pending.take() {
            if operation.is_finished() {
                failures = 0;
            } else {
                failures += 1;
                log::warn!("[ping] ping went unanswered ({failures} in a row)");
                if failures >= threshold {
                    for callback in inner.ping_failed.lock().unwrap().iter() {
                        callback();
                    }
                    failures = 0;
                }
            }
        }
        let ping_id = inner.ping_sequence.fetch_add(1, Ordering::Relaxed);
        let disconnect_delay = (inner.interval.as_secs() as i32).max(1) * 2;
        let operation = PendingRpcOperation::new(build_ping_request(ping_id, disconnect_delay));
        inner.rpc_layer.send_rpc(Arc::clone(&operation));
        pending = Some(operation);
    }
}
