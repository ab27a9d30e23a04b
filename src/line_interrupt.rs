// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure to support line interrupts.

#![warn(missing_docs)]

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

/// Implemented by interrupt controllers that accept level-sensitive line
/// state changes.
///
/// Devices are expected to use [`LineInterrupt`], which decouples IRQ
/// numbers and controller wiring from concrete device implementations.
pub trait LineSetTarget: Send + Sync {
    /// Set an interrupt line state.
    fn set_irq(&self, vector: u32, high: bool);
}

/// A line interrupt, representing a (virtually) physical wire between a
/// device and an interrupt controller.
///
/// The line is level-sensitive: the device asserts the current level on
/// every state change of interest, and deduplicating repeated assertions of
/// the same level is the interrupt controller's job.
pub struct LineInterrupt {
    debug_label: Cow<'static, str>,
    target: Option<(Arc<dyn LineSetTarget>, u32)>,
    is_high: Mutex<bool>,
}

impl Debug for LineInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineInterrupt")
            .field("debug_label", &self.debug_label)
            .field("vector", &self.target.as_ref().map(|(_, vector)| *vector))
            .field("is_high", &*self.is_high.lock())
            .finish()
    }
}

impl LineInterrupt {
    /// Creates a line that is not attached to any target.
    ///
    /// This is useful for testing purposes.
    pub fn detached() -> Self {
        Self {
            debug_label: "detached".into(),
            target: None,
            is_high: Mutex::new(false),
        }
    }

    /// Creates a new line interrupt routed to `vector` on the provided
    /// target.
    pub fn new_with_target(
        debug_label: impl Into<Cow<'static, str>>,
        target: Arc<dyn LineSetTarget>,
        vector: u32,
    ) -> Self {
        Self {
            debug_label: debug_label.into(),
            target: Some((target, vector)),
            is_high: Mutex::new(false),
        }
    }

    /// Sets the line level high or low.
    pub fn set_level(&self, high: bool) {
        *self.is_high.lock() = high;
        match &self.target {
            Some((target, vector)) => target.set_irq(*vector, high),
            None => {
                if high {
                    tracing::warn!(
                        label = %self.debug_label,
                        "LineInterrupt not hooked up to any target!"
                    );
                }
            }
        }
    }
}

impl Drop for LineInterrupt {
    fn drop(&mut self) {
        // Deassert the line so the controller does not see a stuck level
        // after the device goes away.
        self.set_level(false);
    }
}

#[allow(missing_docs)] // self explanatory struct/functions
pub mod test_helpers {
    use super::LineSetTarget;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    pub struct TestLineInterruptTarget {
        state: Mutex<BTreeMap<u32, LineState>>,
    }

    #[derive(Default)]
    struct LineState {
        is_high: bool,
        rising_edges: u64,
    }

    impl TestLineInterruptTarget {
        pub fn new_arc() -> Arc<TestLineInterruptTarget> {
            Arc::new(TestLineInterruptTarget {
                state: Default::default(),
            })
        }

        pub fn is_high(&self, vector: u32) -> bool {
            self.state.lock().get(&vector).is_some_and(|s| s.is_high)
        }

        /// Number of low-to-high transitions observed on `vector`.
        pub fn rising_edges(&self, vector: u32) -> u64 {
            self.state
                .lock()
                .get(&vector)
                .map_or(0, |s| s.rising_edges)
        }
    }

    impl LineSetTarget for TestLineInterruptTarget {
        fn set_irq(&self, vector: u32, high: bool) {
            let mut state = self.state.lock();
            let state = state.entry(vector).or_default();
            if high && !state.is_high {
                state.rising_edges += 1;
            }
            state.is_high = high;
        }
    }
}
