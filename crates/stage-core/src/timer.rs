//! Stage timers.
//!
//! A timer is a detached ticking task that posts `Timer` items onto the
//! owning stage's mailbox — the callback itself always runs on the stage
//! loop. Cancellation aborts the ticking task and unregisters the id; ticks
//! already sitting in the mailbox are skipped by the active-id check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::event_loop::{StageMessage, TimerCallback};
use crate::sender::SenderCore;

pub(crate) fn spawn_repeating(
    core: Arc<SenderCore>,
    timer_id: u64,
    initial_delay: Duration,
    period: Duration,
    callback: TimerCallback,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let task_core = Arc::clone(&core);
    let task = tokio::spawn(async move {
        // Wait for the id to be registered before the first tick can race a
        // cancellation.
        if ready_rx.await.is_err() {
            return;
        }
        tokio::time::sleep(initial_delay).await;
        loop {
            if !task_core.has_timer(timer_id) {
                return;
            }
            let Some(handle) = task_core.handle() else {
                return;
            };
            if !handle.post(StageMessage::Timer { timer_id, callback: Arc::clone(&callback) }) {
                return;
            }
            tokio::time::sleep(period).await;
        }
    });
    core.track_timer(timer_id, task.abort_handle());
    let _ = ready_tx.send(());
}

pub(crate) fn spawn_counted(
    core: Arc<SenderCore>,
    timer_id: u64,
    initial_delay: Duration,
    count: u32,
    period: Duration,
    callback: TimerCallback,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let task_core = Arc::clone(&core);
    let task = tokio::spawn(async move {
        if ready_rx.await.is_err() {
            return;
        }
        tokio::time::sleep(initial_delay).await;
        for remaining in (0..count).rev() {
            if !task_core.has_timer(timer_id) {
                return;
            }
            let Some(handle) = task_core.handle() else {
                return;
            };
            let posted = if remaining == 0 {
                // Final tick: unregister first, then deliver as a plain
                // closure so the active-id check cannot swallow it.
                task_core.drop_timer(timer_id);
                let callback = Arc::clone(&callback);
                handle.post(StageMessage::Async(Box::new(move |stage| callback(stage))))
            } else {
                handle.post(StageMessage::Timer { timer_id, callback: Arc::clone(&callback) })
            };
            if !posted {
                return;
            }
            if remaining > 0 {
                tokio::time::sleep(period).await;
            }
        }
    });
    core.track_timer(timer_id, task.abort_handle());
    let _ = ready_tx.send(());
}
