// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The counter time model: pure functions from elapsed virtual time to
//! counter value, output level, and next output transition, for each of the
//! six 8254 operating modes.
//!
//! Everything here is a function of the programmed count and the number of
//! reference-clock ticks elapsed since the count was loaded. All mutation
//! lives in the register interface and the IRQ scheduler in
//! [`pit`](crate::pit).

use crate::vmtime::VmTime;

/// The PIT reference clock frequency, in Hz.
pub const PIT_FREQ: u64 = 1_193_182;

pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Computes `value * mul / div` with a 128-bit intermediate, so the product
/// cannot overflow for any representable VM time.
pub(crate) fn muldiv64(value: u64, mul: u64, div: u64) -> u64 {
    (value as u128 * mul as u128 / div as u128) as u64
}

/// Returns the number of PIT ticks elapsed between `count_load_time` and
/// `now`.
///
/// Callers keep `now >= count_load_time`; a misbehaving clock clamps to
/// zero rather than underflowing.
pub(crate) fn elapsed_ticks(count_load_time: VmTime, now: VmTime) -> u64 {
    let nanos = (now.as_nanos() - count_load_time.as_nanos()).max(0) as u64;
    muldiv64(nanos, PIT_FREQ, NANOS_PER_SEC)
}

/// Converts a tick index (relative to the load instant) to nanoseconds.
pub(crate) fn ticks_to_nanos(ticks: u64) -> u64 {
    muldiv64(ticks, NANOS_PER_SEC, PIT_FREQ)
}

/// Operating mode of a counter, per the control word's mode field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Mode 0: interrupt on terminal count.
    TerminalCount = 0,
    /// Mode 1: hardware-retriggerable one-shot.
    HardwareOneShot = 1,
    /// Mode 2: rate generator.
    RateGenerator = 2,
    /// Mode 3: square wave generator.
    SquareWave = 3,
    /// Mode 4: software-triggered strobe.
    SoftwareStrobe = 4,
    /// Mode 5: hardware-triggered strobe.
    HardwareStrobe = 5,
}

impl From<u8> for Mode {
    fn from(v: u8) -> Self {
        // Modes 6 and 7 alias 2 and 3 on real silicon.
        match v & 7 {
            0 => Mode::TerminalCount,
            1 => Mode::HardwareOneShot,
            2 | 6 => Mode::RateGenerator,
            3 | 7 => Mode::SquareWave,
            4 => Mode::SoftwareStrobe,
            5 => Mode::HardwareStrobe,
            _ => unreachable!(),
        }
    }
}

impl Mode {
    /// Returns true for modes where a gate rising edge restarts counting.
    ///
    /// Modes 0 and 4 record the gate level but counting is unaffected.
    pub(crate) fn gate_reloads_count(&self) -> bool {
        match self {
            Mode::HardwareOneShot
            | Mode::RateGenerator
            | Mode::SquareWave
            | Mode::HardwareStrobe => true,
            Mode::TerminalCount | Mode::SoftwareStrobe => false,
        }
    }

    /// Counter value `d` ticks after a load of `count`.
    ///
    /// The result can be 65536 (a full period remaining in modes 2 and 3);
    /// byte extraction truncates it to zero exactly as the 16-bit counting
    /// element would read.
    pub(crate) fn count_after(&self, count: u32, d: u64) -> u32 {
        let count = count as u64;
        match self {
            Mode::TerminalCount
            | Mode::HardwareOneShot
            | Mode::SoftwareStrobe
            | Mode::HardwareStrobe => (count.wrapping_sub(d) & 0xffff) as u32,
            Mode::RateGenerator => (count - d % count) as u32,
            // Coarse for odd counts; kept for compatibility.
            Mode::SquareWave => (count - (2 * d) % count) as u32,
        }
    }

    /// Output line level `d` ticks after a load of `count`.
    pub(crate) fn out_after(&self, count: u32, d: u64) -> bool {
        let count = count as u64;
        match self {
            Mode::TerminalCount => d >= count,
            Mode::HardwareOneShot => d < count,
            Mode::RateGenerator => d % count == 0 && d != 0,
            Mode::SquareWave => d % count < (count + 1) / 2,
            Mode::SoftwareStrobe | Mode::HardwareStrobe => d == count,
        }
    }

    /// Tick index (relative to the load instant) of the next output
    /// transition strictly after `d`, or `None` if the output never changes
    /// again.
    pub(crate) fn next_transition_after(&self, count: u32, d: u64) -> Option<u64> {
        let count = count as u64;
        match self {
            Mode::TerminalCount | Mode::HardwareOneShot => (d < count).then_some(count),
            Mode::RateGenerator => {
                let base = d / count * count;
                if d - base == 0 && d != 0 {
                    Some(base + count)
                } else {
                    Some(base + count + 1)
                }
            }
            Mode::SquareWave => {
                let base = d / count * count;
                let high_len = (count + 1) / 2;
                if d - base < high_len {
                    Some(base + high_len)
                } else {
                    Some(base + count)
                }
            }
            Mode::SoftwareStrobe | Mode::HardwareStrobe => {
                if d < count {
                    Some(count)
                } else if d == count {
                    Some(count + 1)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [Mode; 6] = [
        Mode::TerminalCount,
        Mode::HardwareOneShot,
        Mode::RateGenerator,
        Mode::SquareWave,
        Mode::SoftwareStrobe,
        Mode::HardwareStrobe,
    ];

    const COUNTS: [u32; 8] = [2, 3, 5, 7, 100, 1000, 65535, 65536];

    // Enough ticks to cover several periods without making the exhaustive
    // sweeps slow for the largest counts.
    fn tick_sweep(count: u32) -> impl Iterator<Item = u64> {
        let count = count as u64;
        (0..=8).flat_map(move |k| {
            let base = k * count / 2;
            base..base + 3
        })
    }

    #[test]
    fn counter_value_stays_in_range() {
        for mode in ALL_MODES {
            for &count in &COUNTS {
                for d in tick_sweep(count) {
                    let value = mode.count_after(count, d);
                    match mode {
                        Mode::RateGenerator | Mode::SquareWave => {
                            assert!(
                                (1..=count).contains(&value),
                                "{mode:?} count={count} d={d} value={value}"
                            );
                        }
                        _ => {
                            assert!(value <= 0xffff, "{mode:?} count={count} d={d} value={value}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn periodic_modes_repeat_exactly() {
        for mode in [Mode::RateGenerator, Mode::SquareWave] {
            for &count in &COUNTS {
                for d in tick_sweep(count) {
                    assert_eq!(
                        mode.out_after(count, d),
                        mode.out_after(count, d + count as u64),
                        "{mode:?} count={count} d={d}"
                    );
                    assert_eq!(
                        mode.count_after(count, d),
                        mode.count_after(count, d + count as u64),
                        "{mode:?} count={count} d={d}"
                    );
                }
            }
        }
    }

    #[test]
    fn next_transition_is_strictly_future_and_flips_out() {
        for mode in ALL_MODES {
            for &count in &COUNTS {
                for d in tick_sweep(count) {
                    let Some(t) = mode.next_transition_after(count, d) else {
                        // Only the one-shot modes go quiet.
                        assert!(matches!(
                            mode,
                            Mode::TerminalCount
                                | Mode::HardwareOneShot
                                | Mode::SoftwareStrobe
                                | Mode::HardwareStrobe
                        ));
                        continue;
                    };
                    assert!(t > d, "{mode:?} count={count} d={d} t={t}");
                    assert_ne!(
                        mode.out_after(count, t),
                        mode.out_after(count, t - 1),
                        "{mode:?} count={count} d={d} t={t}"
                    );
                }
            }
        }
    }

    #[test]
    fn one_shot_modes_go_quiet() {
        for mode in [Mode::TerminalCount, Mode::HardwareOneShot] {
            assert_eq!(mode.next_transition_after(100, 100), None);
            assert_eq!(mode.next_transition_after(100, 5000), None);
        }
        for mode in [Mode::SoftwareStrobe, Mode::HardwareStrobe] {
            // The strobe pulse is one tick wide, so there is one more
            // transition at count + 1.
            assert_eq!(mode.next_transition_after(100, 100), Some(101));
            assert_eq!(mode.next_transition_after(100, 101), None);
        }
    }

    #[test]
    fn mode_aliases_fold() {
        assert_eq!(Mode::from(6), Mode::RateGenerator);
        assert_eq!(Mode::from(7), Mode::SquareWave);
        // Callers pass raw bytes; only the low three bits matter.
        assert_eq!(Mode::from(0x0a), Mode::RateGenerator);
    }

    #[test]
    fn muldiv_does_not_overflow() {
        let v = i64::MAX as u64;
        assert_eq!(
            muldiv64(v, PIT_FREQ, NANOS_PER_SEC),
            (v as u128 * PIT_FREQ as u128 / NANOS_PER_SEC as u128) as u64
        );
    }

    #[test]
    fn elapsed_ticks_rounds_down_and_clamps() {
        let t0 = VmTime::from_nanos(1000);
        // One tick is ~838ns.
        assert_eq!(elapsed_ticks(t0, VmTime::from_nanos(1000 + 838)), 0);
        assert_eq!(elapsed_ticks(t0, VmTime::from_nanos(1000 + 839)), 1);
        assert_eq!(
            elapsed_ticks(t0, VmTime::from_nanos(1000 + 1_000_000_000)),
            PIT_FREQ
        );
        // A clock that went backwards reads as no elapsed time.
        assert_eq!(elapsed_ticks(t0, VmTime::ZERO), 0);
    }
}
