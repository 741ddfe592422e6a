//! Tokio-backed [`TimerScheduler`].
//!
//! Each armed timer is one spawned sleep. On expiry the task posts an
//! [`Expiry`] to the owning actor, which passes it through
//! [`TokioTimers::take_expired`] before acting on it. Rescheduling bumps the
//! timer's generation, so an expiry that was already in flight when the timer
//! was re-armed or cancelled is recognised and ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::protocols::TimerScheduler;
use crate::sar::TimerId;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub timer: TimerId,
    generation: u64,
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct TokioTimers {
    expiry_tx: mpsc::UnboundedSender<Expiry>,
    pending: Mutex<HashMap<TimerId, Pending>>,
    next_generation: AtomicU64,
}

impl TokioTimers {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let timers = Self {
            expiry_tx,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        };
        (timers, expiry_rx)
    }

    /// Accept an expiry if it belongs to the timer's current arming.
    pub fn take_expired(&self, expiry: Expiry) -> Option<TimerId> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(&expiry.timer) {
            Some(p) if p.generation == expiry.generation => {
                pending.remove(&expiry.timer);
                Some(expiry.timer)
            }
            _ => {
                trace!(timer = ?expiry.timer, "ignoring superseded timer expiry");
                None
            }
        }
    }

    /// Number of timers currently armed.
    pub fn armed(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl TimerScheduler for TokioTimers {
    fn reschedule(&self, timer: TimerId, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tx = self.expiry_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Expiry { timer, generation });
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.insert(timer, Pending { generation, task }) {
            previous.task.abort();
        }
    }

    fn abort(&self, timer: TimerId) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.remove(&timer) {
            previous.task.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, p) in pending.drain() {
            p.task.abort();
        }
    }
}
