// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Support for VM time.
//!
//! VM time is a monotonic nanosecond timeline that advances only while the
//! guest runs. The host's clock implements [`VmTimeSource`]; a device holds a
//! [`VmTimeAccess`], which pairs the clock with the device's one-shot timeout
//! slot.
//!
//! The timeout slot is cooperative: the device records the instant it next
//! wants to run, and the embedder's timer subsystem reads that instant back
//! (via [`VmTimeAccess::timeout`]) after every device entry point, invoking
//! the device's expiry hook once VM time reaches it.

#![warn(missing_docs)]

use std::sync::Arc;

/// An instant on the VM's monotonic clock, in nanoseconds since VM boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VmTime(i64);

impl VmTime {
    /// VM boot.
    pub const ZERO: Self = Self(0);

    /// Converts from a time in nanoseconds.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Gets the time from VM boot in nanoseconds.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Returns whether `self` is strictly after `t`.
    pub const fn is_after(self, t: Self) -> bool {
        self.0 > t.0
    }
}

/// The host's virtual clock. Monotonic: successive calls to
/// [`now`](Self::now) never go backwards.
pub trait VmTimeSource: Send + Sync {
    /// Returns the current VM time.
    fn now(&self) -> VmTime;
}

/// A device's handle to VM time: the clock, plus the device's single one-shot
/// timeout.
pub struct VmTimeAccess {
    source: Arc<dyn VmTimeSource>,
    timeout: Option<VmTime>,
}

impl VmTimeAccess {
    /// Returns a new access object backed by `source`, with no timeout
    /// pending.
    pub fn new(source: Arc<dyn VmTimeSource>) -> Self {
        Self {
            source,
            timeout: None,
        }
    }

    /// Returns the current VM time.
    pub fn now(&self) -> VmTime {
        self.source.now()
    }

    /// Arms the timeout, replacing any pending one.
    pub fn set_timeout(&mut self, time: VmTime) {
        self.timeout = Some(time);
    }

    /// Clears the pending timeout, if any.
    pub fn cancel_timeout(&mut self) {
        self.timeout = None;
    }

    /// Returns the pending timeout.
    ///
    /// The embedder's timer subsystem calls the owning device's expiry hook
    /// once [`now`](Self::now) reaches this instant.
    pub fn timeout(&self) -> Option<VmTime> {
        self.timeout
    }
}

#[allow(missing_docs)] // self explanatory struct/functions
pub mod test_helpers {
    use super::VmTime;
    use super::VmTimeSource;
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub struct TestVmClock {
        now: Mutex<VmTime>,
    }

    impl TestVmClock {
        pub fn new_arc() -> Arc<TestVmClock> {
            Arc::new(TestVmClock {
                now: Mutex::new(VmTime::ZERO),
            })
        }

        pub fn set(&self, time: VmTime) {
            let mut now = self.now.lock();
            assert!(!now.is_after(time), "test clock moved backwards");
            *now = time;
        }

        pub fn advance(&self, nanos: i64) {
            let mut now = self.now.lock();
            *now = VmTime::from_nanos(now.as_nanos() + nanos);
        }
    }

    impl VmTimeSource for TestVmClock {
        fn now(&self) -> VmTime {
            *self.now.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::TestVmClock;
    use super::VmTime;
    use super::VmTimeAccess;

    #[test]
    fn timeout_slot() {
        let clock = TestVmClock::new_arc();
        let mut access = VmTimeAccess::new(clock.clone());
        assert_eq!(access.timeout(), None);

        access.set_timeout(VmTime::from_nanos(100));
        assert_eq!(access.timeout(), Some(VmTime::from_nanos(100)));

        // A new deadline replaces the pending one.
        access.set_timeout(VmTime::from_nanos(50));
        assert_eq!(access.timeout(), Some(VmTime::from_nanos(50)));

        access.cancel_timeout();
        assert_eq!(access.timeout(), None);
    }

    #[test]
    fn test_clock_advances() {
        let clock = TestVmClock::new_arc();
        let access = VmTimeAccess::new(clock.clone());
        assert_eq!(access.now(), VmTime::ZERO);
        clock.advance(123);
        assert_eq!(access.now(), VmTime::from_nanos(123));
        assert!(access.now().is_after(VmTime::ZERO));
    }
}
