//! # Command Recovery
//!
//! A command posted with a timeout is armed in the [`Watchdog`]. When the
//! deadline passes while the command is still queued, the slot moves to
//! `Timeout` and its SMID is handed to the recovery worker, which resets the
//! target the command was addressed to. The reset makes the IOC terminate the
//! stuck command, so the original completes through the normal reply path.
//!
//! Cancellation never un-posts a request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::dispatch::{Dispatcher, SubmitMode};
use crate::mpi::{TaskMgmtRequest, TASK_TARGET_RESET};
use crate::pool::{CommandPool, SlotState};
use crate::{HbaError, HbaResult};

// =============================================================================
// Watchdog
// =============================================================================

struct WatchdogShared {
    deadlines: Mutex<BTreeMap<u16, Instant>>,
    stop: AtomicBool,
}

/// Per-command deadline timer
pub struct Watchdog {
    shared: Arc<WatchdogShared>,
    pool: Arc<CommandPool>,
    tick: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(pool: Arc<CommandPool>, tick: Duration) -> Self {
        Self {
            shared: Arc::new(WatchdogShared {
                deadlines: Mutex::new(BTreeMap::new()),
                stop: AtomicBool::new(false),
            }),
            pool,
            tick,
            handle: Mutex::new(None),
        }
    }

    /// Starts the timer thread. `on_expire` runs on it for every slot that
    /// timed out or is due for another recovery attempt.
    pub fn start<F>(&self, name: &str, mut on_expire: F) -> HbaResult<()>
    where
        F: FnMut(u16) + Send + 'static,
    {
        let shared = self.shared.clone();
        let pool = self.pool.clone();
        let tick = self.tick;

        let handle = thread::Builder::new()
            .name(format!("{}-watchdog", name))
            .spawn(move || {
                while !shared.stop.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    for smid in Self::expired(&shared, Instant::now()) {
                        if pool.transition(smid, SlotState::Queued, SlotState::Timeout)
                            || pool.state(smid) == SlotState::Timeout
                        {
                            on_expire(smid);
                        }
                    }
                }
            })
            .map_err(|e| {
                log::warn!("{}: unable to start watchdog: {}", name, e);
                HbaError::NoMemory
            })?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn expired(shared: &WatchdogShared, now: Instant) -> Vec<u16> {
        let mut deadlines = shared.deadlines.lock();
        let expired: Vec<u16> = deadlines
            .iter()
            .filter(|(_, when)| **when <= now)
            .map(|(smid, _)| *smid)
            .collect();
        for smid in &expired {
            deadlines.remove(smid);
        }
        expired
    }

    /// Arms a deadline for a slot about to be posted
    pub fn arm(&self, smid: u16, timeout: Duration) {
        self.shared
            .deadlines
            .lock()
            .insert(smid, Instant::now() + timeout);
    }

    /// Cancels a slot's deadline
    pub fn disarm(&self, smid: u16) {
        self.shared.deadlines.lock().remove(&smid);
    }

    /// Schedules another recovery attempt one tick from now
    pub fn retry(&self, smid: u16) {
        self.arm(smid, self.tick);
    }

    /// Number of armed deadlines
    pub fn armed(&self) -> usize {
        self.shared.deadlines.lock().len()
    }

    /// Stops and joins the timer thread
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.shared.deadlines.lock().clear();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Recovery Worker
// =============================================================================

/// Target reset escalation for timed-out commands
pub struct Recovery {
    name: String,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<CommandPool>,
    watchdog: Arc<Watchdog>,
}

impl Recovery {
    pub fn new(
        name: &str,
        dispatcher: Arc<Dispatcher>,
        pool: Arc<CommandPool>,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            name: name.to_string(),
            dispatcher,
            pool,
            watchdog,
        }
    }

    /// Resets the target of a timed-out slot
    pub fn handle(&self, smid: u16) {
        if self.pool.state(smid) != SlotState::Timeout {
            return;
        }

        let Some(mut cmd) = self.pool.acquire() else {
            log::debug!("{}: no slot for target reset, retrying", self.name);
            self.watchdog.retry(smid);
            return;
        };

        let dev_handle = self.pool.dev_handle(smid);
        log::warn!(
            "{}: smid {} timed out, resetting target {:#06x}",
            self.name,
            smid,
            dev_handle
        );
        cmd.encode(&TaskMgmtRequest {
            dev_handle,
            task_type: TASK_TARGET_RESET,
            ..Default::default()
        });

        if let Err(e) = self.dispatcher.submit(cmd, SubmitMode::Wait) {
            log::warn!("{}: target reset for {:#06x} failed: {}", self.name, dev_handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use std::sync::mpsc::channel;

    #[test]
    fn test_expiry_moves_queued_to_timeout() {
        let dma = HostDma::new();
        let pool = CommandPool::new(&dma, 4, 64).unwrap();
        let watchdog = Watchdog::new(pool.clone(), Duration::from_millis(1));
        let (tx, rx) = channel();
        watchdog
            .start("wd-test", move |smid| {
                let _ = tx.send(smid);
            })
            .unwrap();

        let cmd = pool.acquire().unwrap();
        pool.set_state(cmd.smid(), SlotState::Queued);
        watchdog.arm(cmd.smid(), Duration::from_millis(5));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(cmd.smid()));
        assert_eq!(pool.state(cmd.smid()), SlotState::Timeout);
        assert_eq!(watchdog.armed(), 0);

        watchdog.retry(cmd.smid());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(cmd.smid()));
        watchdog.stop();
    }

    #[test]
    fn test_completed_slot_is_not_reported() {
        let dma = HostDma::new();
        let pool = CommandPool::new(&dma, 4, 64).unwrap();
        let watchdog = Watchdog::new(pool.clone(), Duration::from_millis(1));
        let (tx, rx) = channel();
        watchdog
            .start("wd-done", move |smid| {
                let _ = tx.send(smid);
            })
            .unwrap();

        // still Ready: never posted, so never timed out
        let cmd = pool.acquire().unwrap();
        watchdog.arm(cmd.smid(), Duration::from_millis(1));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let other = pool.acquire().unwrap();
        pool.set_state(other.smid(), SlotState::Queued);
        watchdog.arm(other.smid(), Duration::from_secs(60));
        watchdog.disarm(other.smid());
        assert_eq!(watchdog.armed(), 0);
        watchdog.stop();
    }
}
