//! Timer service backing `scheduleTimeoutEvent` / `clearTimeoutEvent`.
//!
//! Each scheduled timeout gets a monotonically increasing id (starting at
//! 1) and a sleep task that sends the id over the fired-event channel. The
//! registry keeps the id until the guest deregisters it; the driver uses
//! that to repeat `resume` for timeouts the guest failed to acknowledge.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Scheduled-timeout registry. Lives inside the shared host data; the
/// receiving half of `tx` is pumped by the driver's run loop.
#[derive(Debug)]
pub(crate) struct TimerRegistry {
    next_id: i32,
    active: BTreeMap<i32, JoinHandle<()>>,
    tx: UnboundedSender<i32>,
}

impl TimerRegistry {
    pub(crate) fn new(tx: UnboundedSender<i32>) -> Self {
        TimerRegistry {
            next_id: 1,
            active: BTreeMap::new(),
            tx,
        }
    }

    /// Register a timeout `delay_ms` from now. The sleep runs one extra
    /// millisecond: common host timers are allowed to fire marginally
    /// early, and the guest treats an early wake-up as a missed event.
    pub(crate) fn schedule(&mut self, delay_ms: i64) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        let tx = self.tx.clone();
        let delay = Duration::from_millis(delay_ms.max(0) as u64 + 1);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The driver may already be gone; a dead channel is fine.
            let _ = tx.send(id);
        });
        self.active.insert(id, handle);
        id
    }

    /// Cancel a timeout and forget its id. Clearing an id that already
    /// fired (or never existed) is a no-op.
    pub(crate) fn clear(&mut self, id: i32) {
        if let Some(handle) = self.active.remove(&id) {
            handle.abort();
        }
    }

    /// Whether the guest still has `id` registered.
    pub(crate) fn contains(&self, id: i32) -> bool {
        self.active.contains_key(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
