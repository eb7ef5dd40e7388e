//! Fault injection for crash-consistency testing
//!
//! Every step of a durability protocol announces itself by name through
//! [`FaultInjector::check`]. Tests arm one of those names; when the step is
//! reached the pool "loses power":
//!
//! - the media image freezes (later flushes and fences never reach it)
//! - the operation returns [`Error::SimulatedCrash`] with the point's name
//!
//! The frozen media image is what a restarted process would see. Recording
//! mode lists every point an operation passes through, so a test can first
//! run an operation cleanly and then crash it at each recorded step.
//!
//! Fence failure injection is separate: it makes `fence` report
//! [`Error::Durability`] without freezing media, either from now on or
//! after a number of fences have succeeded.

use nvbench_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct Armed {
    point: String,
    skip: usize,
}

/// Named crash points and fence failures
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<Option<Armed>>,
    crashed: AtomicBool,
    fail_fences: AtomicBool,
    fences_left: Mutex<Option<usize>>,
    recording: AtomicBool,
    seen: Mutex<Vec<&'static str>>,
}

impl FaultInjector {
    /// Injector with nothing armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Crash the next time `point` is reached
    pub fn arm(&self, point: &str) {
        self.arm_nth(point, 0);
    }

    /// Crash at the `skip + 1`th time `point` is reached
    pub fn arm_nth(&self, point: &str, skip: usize) {
        *self.armed.lock() = Some(Armed {
            point: point.to_string(),
            skip,
        });
    }

    /// Clear any armed crash point
    pub fn disarm(&self) {
        *self.armed.lock() = None;
    }

    /// Make every subsequent fence fail (or stop failing)
    pub fn fail_fences(&self, fail: bool) {
        *self.fences_left.lock() = None;
        self.fail_fences.store(fail, Ordering::SeqCst);
    }

    /// Let `successes` more fences complete, then fail every fence after
    pub fn fail_fences_after(&self, successes: usize) {
        self.fail_fences.store(false, Ordering::SeqCst);
        *self.fences_left.lock() = Some(successes);
    }

    /// Account for one fence; false if it must fail
    pub(crate) fn admit_fence(&self) -> bool {
        if self.fences_fail() {
            return false;
        }
        let mut left = self.fences_left.lock();
        match left.as_mut() {
            None => true,
            Some(0) => {
                *left = None;
                self.fail_fences.store(true, Ordering::SeqCst);
                false
            }
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    /// True while fence failure injection is on
    pub fn fences_fail(&self) -> bool {
        self.fail_fences.load(Ordering::SeqCst)
    }

    /// True once an armed point has fired
    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Start recording the points reached, discarding earlier records
    pub fn start_recording(&self) {
        self.seen.lock().clear();
        self.recording.store(true, Ordering::SeqCst);
    }

    /// Stop recording and return the points reached, in order
    pub fn stop_recording(&self) -> Vec<&'static str> {
        self.recording.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.seen.lock())
    }

    /// Announce that `point` was reached
    ///
    /// # Errors
    ///
    /// [`Error::SimulatedCrash`] if `point` is armed, or if the pool has
    /// already crashed.
    pub fn check(&self, point: &'static str) -> Result<()> {
        if self.crashed() {
            return Err(Error::SimulatedCrash(point));
        }
        if self.recording.load(Ordering::Relaxed) {
            self.seen.lock().push(point);
        }
        let mut armed = self.armed.lock();
        let fire = match armed.as_mut() {
            Some(a) if a.point == point => {
                if a.skip == 0 {
                    true
                } else {
                    a.skip -= 1;
                    false
                }
            }
            _ => false,
        };
        if fire {
            *armed = None;
            self.crashed.store(true, Ordering::SeqCst);
            tracing::warn!(point, "simulated crash");
            return Err(Error::SimulatedCrash(point));
        }
        Ok(())
    }
}
