//! Provisioning progress reporting.
//!
//! Download and install progress is published through a
//! [`tokio::sync::watch`] channel: observers always see the latest value and
//! never a stale backlog. The reporter enforces what observers may assume:
//!
//! - fractions stay in `[0, 1]`
//! - within a phase, a published fraction never decreases
//! - once the install phase starts, download values are ignored
//! - a completed phase publishes exactly `1.0`

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Download,
    Install,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProvisionProgress {
    pub phase: ProgressPhase,
    pub fraction: f64,
}

impl ProvisionProgress {
    pub const fn start() -> Self {
        Self {
            phase: ProgressPhase::Download,
            fraction: 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == ProgressPhase::Install && self.fraction >= 1.0
    }
}

/// Publishing side of the progress channel.
///
/// Callbacks from the acquirer and the backend may arrive on any task, so the
/// last published value sits behind a mutex and is compared before sending.
pub struct ProgressReporter {
    tx: watch::Sender<ProvisionProgress>,
    last: Mutex<ProvisionProgress>,
}

impl ProgressReporter {
    pub fn new() -> (Self, watch::Receiver<ProvisionProgress>) {
        let (tx, rx) = watch::channel(ProvisionProgress::start());
        let reporter = Self {
            tx,
            last: Mutex::new(ProvisionProgress::start()),
        };
        (reporter, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ProvisionProgress> {
        self.tx.subscribe()
    }

    /// Report a raw fraction for `phase`; out-of-order values are dropped.
    pub fn report(&self, phase: ProgressPhase, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);

        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = ProvisionProgress { phase, fraction };

        let advances = match phase.cmp(&last.phase) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => fraction > last.fraction,
            std::cmp::Ordering::Greater => true,
        };
        if !advances {
            return;
        }

        *last = next;
        self.tx.send_replace(next);
    }

    /// Mark `phase` as finished.
    pub fn complete(&self, phase: ProgressPhase) {
        self.report(phase, 1.0);
    }

    /// Start over for a new provisioning attempt.
    pub fn reset(&self) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = ProvisionProgress::start();
        self.tx.send_replace(*last);
    }

    pub fn current(&self) -> ProvisionProgress {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_are_clamped() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.report(ProgressPhase::Download, 1.7);
        assert_eq!(rx.borrow().fraction, 1.0);

        reporter.report(ProgressPhase::Install, -0.5);
        let current = *rx.borrow();
        assert_eq!(current.phase, ProgressPhase::Install);
        assert_eq!(current.fraction, 0.0);
    }

    #[test]
    fn regressions_within_a_phase_are_dropped() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.report(ProgressPhase::Download, 0.4);
        reporter.report(ProgressPhase::Download, 0.2);
        assert_eq!(rx.borrow().fraction, 0.4);
    }

    #[test]
    fn install_phase_never_falls_back_to_download() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.report(ProgressPhase::Install, 0.1);
        reporter.report(ProgressPhase::Download, 0.9);
        assert_eq!(*rx.borrow(), ProvisionProgress {
            phase: ProgressPhase::Install,
            fraction: 0.1,
        });
    }

    #[test]
    fn complete_publishes_exactly_one() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.report(ProgressPhase::Install, 0.999);
        reporter.complete(ProgressPhase::Install);
        assert!(rx.borrow().is_complete());
        assert_eq!(rx.borrow().fraction, 1.0);
    }

    #[test]
    fn nan_is_ignored() {
        let (reporter, _rx) = ProgressReporter::new();
        reporter.report(ProgressPhase::Download, 0.3);
        reporter.report(ProgressPhase::Download, f64::NAN);
        assert_eq!(reporter.current().fraction, 0.3);
    }

    #[test]
    fn reset_returns_to_download_start() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.complete(ProgressPhase::Install);
        reporter.reset();
        assert_eq!(*rx.borrow(), ProvisionProgress::start());
    }
}
