//! Rod motor with status monitoring.
//!
//! [`MotorDriver`] composes a raw [`MotorOutput`] with a status monitor. All
//! transitions go through the driver's entry points, which hold a lock across
//! the hardware call and the status update, and publish the new status to
//! every subscriber exactly once per real transition. A reversal always
//! passes through Stopped.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{MotorOutput, MotorStatus};
use crate::events::Shutdown;

pub struct MotorDriver {
    output: Arc<dyn MotorOutput>,
    transition_lock: Mutex<()>,
    status: watch::Sender<MotorStatus>,
    transitions: AtomicU64,
}

impl MotorDriver {
    pub fn new(output: Arc<dyn MotorOutput>) -> Self {
        let (status, _rx) = watch::channel(MotorStatus::Stopped);
        Self {
            output,
            transition_lock: Mutex::new(()),
            status,
            transitions: AtomicU64::new(0),
        }
    }

    /// Raise the rod. Returns `true` if the status changed.
    pub fn forward(&self) -> bool {
        self.transition(MotorStatus::MovingUp)
    }

    /// Lower the rod.
    pub fn backward(&self) -> bool {
        self.transition(MotorStatus::MovingDown)
    }

    pub fn stop(&self) -> bool {
        self.transition(MotorStatus::Stopped)
    }

    pub fn current_status(&self) -> MotorStatus {
        *self.status.borrow()
    }

    /// Number of real status transitions since construction.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<MotorStatus> {
        self.status.subscribe()
    }

    /// Wait for the next status change, the timeout, or shutdown, whichever
    /// comes first. Returns whether the status changed and the status now.
    pub async fn wait_for_status_change(
        &self,
        shutdown: &Shutdown,
        timeout: Duration,
    ) -> (bool, MotorStatus) {
        let mut rx = self.status.subscribe();
        let before = *rx.borrow_and_update();

        tokio::select! {
            _ = rx.changed() => {}
            _ = shutdown.wait() => {}
            _ = tokio::time::sleep(timeout) => {}
        }

        let now = self.current_status();
        (now != before, now)
    }

    fn transition(&self, target: MotorStatus) -> bool {
        let _guard = self.transition_lock.lock();

        let current = *self.status.borrow();
        let reversing = current != target
            && current != MotorStatus::Stopped
            && target != MotorStatus::Stopped;
        if reversing {
            self.output.halt();
            self.publish(MotorStatus::Stopped);
        }

        match target {
            MotorStatus::MovingUp => self.output.drive_up(),
            MotorStatus::MovingDown => self.output.drive_down(),
            MotorStatus::Stopped => self.output.halt(),
        }
        self.publish(target)
    }

    fn publish(&self, target: MotorStatus) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if *status == target {
                false
            } else {
                *status = target;
                true
            }
        });
        if changed {
            self.transitions.fetch_add(1, Ordering::AcqRel);
        }
        changed
    }
}

impl std::fmt::Debug for MotorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorDriver")
            .field("status", &self.current_status())
            .field("transitions", &self.transitions())
            .finish()
    }
}
