// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Intel 8253/8254 programmable interval timer (PIT) emulation.
//!
//! The PIT is three 16-bit down counters clocked at 1.193182 MHz. Rather
//! than ticking the counters, this implementation computes each counter
//! value and output level in closed form from the virtual clock whenever the
//! guest looks, and keeps a one-shot timeout armed at the next predicted
//! output transition of channel 0, whose output drives a level-sensitive
//! interrupt line (IRQ0 on a PC).
//!
//! Counting is binary only. The BCD control bit is decoded and persisted but
//! does not affect counting, and the gate input does not pause counting in
//! modes 0 and 4.

use crate::counter::elapsed_ticks;
use crate::counter::ticks_to_nanos;
use crate::counter::Mode;
use crate::line_interrupt::LineInterrupt;
use crate::pio::IoError;
use crate::pio::IoResult;
use crate::pio::PortIoIntercept;
use crate::vmtime::VmTime;
use crate::vmtime::VmTimeAccess;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use std::ops::RangeInclusive;

#[rustfmt::skip]
#[bitfield(u8)]
struct ControlWord {
    #[bits(1)] bcd: bool,
    #[bits(3)] mode: u8,
    #[bits(2)] rw: u8,
    #[bits(2)] select: u8,
}

#[rustfmt::skip]
#[bitfield(u8)]
struct StatusWord {
    #[bits(1)] bcd: bool,
    #[bits(3)] mode: u8,
    #[bits(2)] rw: u8,
    #[bits(1)] null: bool, // not modeled; always reads 0
    #[bits(1)] out: bool,
}

/// Control write with both select bits set. The latch bits are active low.
#[rustfmt::skip]
#[bitfield(u8)]
struct ReadBackCommand {
    #[bits(1)] reserved: bool,
    #[bits(1)] counter0: bool,
    #[bits(1)] counter1: bool,
    #[bits(1)] counter2: bool,
    #[bits(1)] status_n: bool,
    #[bits(1)] count_n: bool,
    #[bits(2)] one: u8,
}

/// How a counter value crosses the 8-bit data bus, per the control
/// word's rw field. NONE is the power-on state, before any control word
/// has been written; accesses in that state take the LSB path.
#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RwMode {
    NONE = 0,
    LSB = 1,
    MSB = 2,
    WORD = 3,
}

/// Byte-sequencer state for counter reads and writes. WORD0/WORD1 are
/// the two halves of a 16-bit transfer.
#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RwState {
    NONE = 0,
    LSB = 1,
    MSB = 2,
    WORD0 = 3,
    WORD1 = 4,
}

/// State of one counter.
#[derive(Debug, Copy, Clone)]
struct Channel {
    /// Programmed initial count, 1..=65536. A written count of 0 loads as
    /// 65536, the maximum period.
    count: u32,
    latched_count: u16,
    /// Access mode the pending counter latch is consumed with; NONE when no
    /// latch is pending.
    count_latched: RwMode,
    status_latched: bool,
    status: u8,
    read_state: RwState,
    write_state: RwState,
    /// LSB held between the two halves of a 16-bit write.
    write_latch: u8,
    rw_mode: RwMode,
    mode: Mode,
    bcd: bool,
    gate: bool,
    count_load_time: VmTime,
    /// Next instant the output changes level. Tracked here for channel 0,
    /// which owns the armed timeout; never scheduled for channels 1 and 2.
    next_transition_time: Option<VmTime>,
}

impl Channel {
    fn new() -> Self {
        Self {
            count: 0,
            latched_count: 0,
            count_latched: RwMode::NONE,
            status_latched: false,
            status: 0,
            read_state: RwState::NONE,
            write_state: RwState::NONE,
            write_latch: 0,
            rw_mode: RwMode::NONE,
            mode: Mode::TerminalCount,
            bcd: false,
            gate: false,
            count_load_time: VmTime::ZERO,
            next_transition_time: None,
        }
    }

    fn ticks(&self, now: VmTime) -> u64 {
        elapsed_ticks(self.count_load_time, now)
    }

    /// Counter value at `now`. Can be 65536; byte extraction truncates it to
    /// zero, as reading the real counting element would.
    fn current_count(&self, now: VmTime) -> u32 {
        self.mode.count_after(self.count, self.ticks(now))
    }

    /// Output line level at `now`.
    fn out(&self, now: VmTime) -> bool {
        self.mode.out_after(self.count, self.ticks(now))
    }

    /// Instant of the next output transition strictly after `now`, or `None`
    /// if the output never changes again.
    fn next_transition(&self, now: VmTime) -> Option<VmTime> {
        let ticks = self.mode.next_transition_after(self.count, self.ticks(now))?;
        let time = VmTime::from_nanos(
            self.count_load_time.as_nanos() + ticks_to_nanos(ticks) as i64,
        );
        // Tick-to-nanosecond rounding can land the result at or before
        // `now`; nudge it forward so the timeout always makes progress.
        Some(if time.is_after(now) {
            time
        } else {
            VmTime::from_nanos(now.as_nanos() + 1)
        })
    }

    /// Snapshots the counter for a latched read. A second latch while one is
    /// pending is ignored.
    fn latch_count(&mut self, now: VmTime) {
        if self.count_latched == RwMode::NONE {
            self.latched_count = self.current_count(now) as u16;
            self.count_latched = self.rw_mode;
        }
    }

    /// Latches the status byte for a read-back command. Ignored while a
    /// previous status byte is unread.
    fn latch_status(&mut self, now: VmTime) {
        if !self.status_latched {
            self.status = StatusWord::new()
                .with_out(self.out(now))
                .with_rw(self.rw_mode.0 & 3)
                .with_mode(self.mode as u8)
                .with_bcd(self.bcd)
                .into();
            self.status_latched = true;
        }
    }

    /// Reads one byte from the counter port: a latched status byte first,
    /// then any latched count, then the live counter.
    fn read(&mut self, now: VmTime) -> u8 {
        if self.status_latched {
            self.status_latched = false;
            return self.status;
        }
        if self.count_latched != RwMode::NONE {
            return match self.count_latched {
                RwMode::MSB => {
                    self.count_latched = RwMode::NONE;
                    (self.latched_count >> 8) as u8
                }
                RwMode::WORD => {
                    self.count_latched = RwMode::MSB;
                    self.latched_count as u8
                }
                _ => {
                    self.count_latched = RwMode::NONE;
                    self.latched_count as u8
                }
            };
        }
        match self.read_state {
            RwState::MSB => (self.current_count(now) >> 8) as u8,
            RwState::WORD0 => {
                self.read_state = RwState::WORD1;
                self.current_count(now) as u8
            }
            RwState::WORD1 => {
                self.read_state = RwState::WORD0;
                (self.current_count(now) >> 8) as u8
            }
            _ => self.current_count(now) as u8,
        }
    }

    /// Accepts one byte on the counter port, returning the raw 16-bit count
    /// when the write completes a load. The first half of a WORD write is
    /// held back and does not reload the counter.
    fn write(&mut self, value: u8) -> Option<u16> {
        match self.write_state {
            RwState::MSB => Some((value as u16) << 8),
            RwState::WORD0 => {
                self.write_latch = value;
                self.write_state = RwState::WORD1;
                None
            }
            RwState::WORD1 => {
                self.write_state = RwState::WORD0;
                Some((value as u16) << 8 | self.write_latch as u16)
            }
            _ => Some(value as u16),
        }
    }
}

/// An Intel 8253/8254 programmable interval timer.
pub struct Pit {
    // Static configuration
    iobase: u16,
    io_region: [(&'static str, RangeInclusive<u16>); 1],

    // Runtime glue
    interrupt: LineInterrupt,
    vmtime: VmTimeAccess,

    // Volatile state
    channels: [Channel; 3],
}

impl Pit {
    /// Returns a new PIT in its reset state, decoding the four ports at
    /// `iobase` and driving `interrupt` from channel 0's output.
    pub fn new(iobase: u16, interrupt: LineInterrupt, vmtime: VmTimeAccess) -> Self {
        let mut pit = Self {
            iobase,
            io_region: [("pit", iobase..=iobase + 3)],
            interrupt,
            vmtime,
            channels: [Channel::new(); 3],
        };
        pit.reset();
        pit
    }

    /// Resets every channel to its power-on state: mode 3, gate high on
    /// channels 0 and 1, and a full 65536-tick period loaded.
    pub fn reset(&mut self) {
        for index in 0..self.channels.len() {
            let mut channel = Channel::new();
            channel.mode = Mode::SquareWave;
            channel.gate = index != 2;
            self.channels[index] = channel;
            self.load_count(index, 0);
        }
    }

    /// The armed timeout for channel 0's next output transition, if any.
    ///
    /// The embedder's timer subsystem calls [`handle_timer`](Self::handle_timer)
    /// once VM time reaches this instant.
    pub fn timer_deadline(&self) -> Option<VmTime> {
        self.vmtime.timeout()
    }

    /// Host-timer expiry hook.
    ///
    /// The scheduler pass runs at the previously predicted transition
    /// instant rather than at "now", which keeps long-term phase stable
    /// under host scheduling jitter.
    pub fn handle_timer(&mut self) {
        if let Some(time) = self.channels[0].next_transition_time {
            self.update_irq_timer(time);
        }
    }

    /// Sets a channel's gate input. A rising edge restarts counting in
    /// modes 1, 2, 3, and 5; modes 0 and 4 record the level only.
    pub fn set_gate(&mut self, channel: usize, level: bool) {
        let now = self.vmtime.now();
        let s = &mut self.channels[channel];
        let reload = !s.gate && level && s.mode.gate_reloads_count();
        if reload {
            s.count_load_time = now;
        }
        s.gate = level;
        if reload && channel == 0 {
            self.update_irq_timer(now);
        }
    }

    /// Returns a channel's gate level.
    pub fn gate(&self, channel: usize) -> bool {
        self.channels[channel].gate
    }

    /// Returns a channel's programmed initial count. A guest-written count
    /// of 0 is observed as 65536.
    pub fn initial_count(&self, channel: usize) -> u32 {
        self.channels[channel].count
    }

    /// Returns a channel's operating mode.
    pub fn mode(&self, channel: usize) -> Mode {
        self.channels[channel].mode
    }

    /// Returns a channel's current output level.
    pub fn out(&self, channel: usize) -> bool {
        self.channels[channel].out(self.vmtime.now())
    }

    /// Stops channel 0's timer while the HPET operates in legacy-replacement
    /// mode.
    pub fn hpet_disable(&mut self) {
        self.vmtime.cancel_timeout();
    }

    /// Hands channel 0 back from the HPET: mode 3, gate high, a full period
    /// loaded, and the timer armed for the next predicted edge.
    pub fn hpet_enable(&mut self) {
        let s = &mut self.channels[0];
        s.mode = Mode::SquareWave;
        s.gate = true;
        self.load_count(0, 0);
    }

    fn load_count(&mut self, index: usize, raw: u16) {
        let now = self.vmtime.now();
        let s = &mut self.channels[index];
        s.count = if raw == 0 { 0x10000 } else { raw.into() };
        s.count_load_time = now;
        debug_assert!((1..=0x10000).contains(&s.count));
        if index == 0 {
            self.update_irq_timer(now);
        }
    }

    /// One scheduler pass over channel 0: asserts the interrupt line to the
    /// current output level, records the next transition, and keeps the
    /// one-shot timeout armed at it (or cancelled when the output is done
    /// changing).
    fn update_irq_timer(&mut self, current_time: VmTime) {
        let expire = self.channels[0].next_transition(current_time);
        let level = self.channels[0].out(current_time);
        self.interrupt.set_level(level);
        self.channels[0].next_transition_time = expire;
        match expire {
            Some(time) => self.vmtime.set_timeout(time),
            None => self.vmtime.cancel_timeout(),
        }
    }

    fn control_write(&mut self, value: u8) {
        let control = ControlWord(value);
        match control.select() {
            i @ 0..=2 => {
                let channel = i as usize;
                tracing::trace!(channel, ?control, "control write");
                if control.rw() == 0 {
                    let now = self.vmtime.now();
                    self.channels[channel].latch_count(now);
                } else {
                    let s = &mut self.channels[channel];
                    s.rw_mode = RwMode(control.rw());
                    s.read_state = RwState(control.rw());
                    s.write_state = RwState(control.rw());
                    s.mode = Mode::from(control.mode());
                    s.bcd = control.bcd();
                    debug_assert!(matches!(
                        s.rw_mode,
                        RwMode::LSB | RwMode::MSB | RwMode::WORD
                    ));
                    debug_assert!(matches!(
                        s.read_state,
                        RwState::LSB | RwState::MSB | RwState::WORD0
                    ));
                    debug_assert!(matches!(
                        s.write_state,
                        RwState::LSB | RwState::MSB | RwState::WORD0
                    ));
                    // The IRQ schedule is refreshed when the new count
                    // loads, not here.
                }
            }
            3 => {
                let command = ReadBackCommand(value);
                tracing::trace!(?command, "read back");
                let now = self.vmtime.now();
                for (channel, selected) in
                    [command.counter0(), command.counter1(), command.counter2()]
                        .into_iter()
                        .enumerate()
                {
                    if !selected {
                        continue;
                    }
                    let s = &mut self.channels[channel];
                    if !command.count_n() {
                        s.latch_count(now);
                    }
                    if !command.status_n() {
                        s.latch_status(now);
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}

impl PortIoIntercept for Pit {
    fn io_read(&mut self, io_port: u16, data: &mut [u8]) -> IoResult {
        if data.len() != 1 {
            return IoResult::Err(IoError::InvalidAccessSize);
        }
        match io_port.checked_sub(self.iobase) {
            Some(offset @ 0..=2) => {
                let now = self.vmtime.now();
                data[0] = self.channels[offset as usize].read(now);
            }
            Some(3) => {
                tracing::warn!("reading from write-only command register!");
                data[0] = !0;
            }
            _ => return IoResult::Err(IoError::InvalidRegister),
        }
        IoResult::Ok
    }

    fn io_write(&mut self, io_port: u16, data: &[u8]) -> IoResult {
        let &[b] = data else {
            return IoResult::Err(IoError::InvalidAccessSize);
        };
        match io_port.checked_sub(self.iobase) {
            Some(offset @ 0..=2) => {
                if let Some(raw) = self.channels[offset as usize].write(b) {
                    self.load_count(offset as usize, raw);
                }
            }
            Some(3) => self.control_write(b),
            _ => return IoResult::Err(IoError::InvalidRegister),
        }
        IoResult::Ok
    }

    fn get_static_regions(&mut self) -> &[(&str, RangeInclusive<u16>)] {
        &self.io_region
    }
}

pub mod save_restore {
    //! Saved state for the PIT.

    use super::*;
    use crate::save_restore::RestoreError;
    use crate::save_restore::SaveError;
    use crate::save_restore::SaveRestore;
    use thiserror::Error;

    pub mod state {
        //! Saved state types. These are decoupled from the runtime types so
        //! that runtime refactors cannot silently change the persisted
        //! layout.

        /// Saved state of one channel.
        #[derive(Debug, Clone)]
        pub struct SavedChannel {
            pub count: u32,
            pub latched_count: u16,
            pub count_latched: u8,
            pub status_latched: u8,
            pub status: u8,
            pub read_state: u8,
            pub write_state: u8,
            pub write_latch: u8,
            pub rw_mode: u8,
            pub mode: u8,
            pub bcd: u8,
            pub gate: u8,
            /// Nanoseconds of VM time.
            pub count_load_time: i64,
            /// Next predicted output transition; meaningful for channel 0.
            pub next_transition_time: Option<i64>,
        }

        /// Legacy channel layout, without a per-channel transition time.
        #[derive(Debug, Clone)]
        pub struct SavedChannelV1 {
            pub count: u32,
            pub latched_count: u16,
            pub count_latched: u8,
            pub status_latched: u8,
            pub status: u8,
            pub read_state: u8,
            pub write_state: u8,
            pub write_latch: u8,
            pub rw_mode: u8,
            pub mode: u8,
            pub bcd: u8,
            pub gate: u8,
            /// Nanoseconds of VM time.
            pub count_load_time: i64,
        }

        /// The legacy format serialized a transition time and a timer
        /// deadline for channel 0 only.
        #[derive(Debug, Clone)]
        pub struct SavedStateV1 {
            pub channels: [SavedChannelV1; 3],
            pub next_transition_time: Option<i64>,
            pub timer_deadline: Option<i64>,
        }

        #[derive(Debug, Clone)]
        pub struct SavedStateV2 {
            pub channels: [SavedChannel; 3],
            /// Channel 0's armed timer deadline, if the output was still
            /// changing at save time.
            pub timer_deadline: Option<i64>,
        }

        /// Versioned saved state. New saves are always [`SavedState::V2`];
        /// restore accepts both.
        #[derive(Debug, Clone)]
        pub enum SavedState {
            V1(SavedStateV1),
            V2(SavedStateV2),
        }
    }

    #[derive(Debug, Error)]
    enum PitRestoreError {
        #[error("count {0:#x} out of range")]
        CountOutOfRange(u32),
        #[error("count load time is after current time")]
        CountLoadTimeInFuture,
    }

    impl SaveRestore for Pit {
        type SavedState = state::SavedState;

        fn save(&mut self) -> Result<Self::SavedState, SaveError> {
            let channels = self.channels.map(|channel| {
                let Channel {
                    count,
                    latched_count,
                    count_latched,
                    status_latched,
                    status,
                    read_state,
                    write_state,
                    write_latch,
                    rw_mode,
                    mode,
                    bcd,
                    gate,
                    count_load_time,
                    next_transition_time,
                } = channel;

                state::SavedChannel {
                    count,
                    latched_count,
                    count_latched: count_latched.0,
                    status_latched: status_latched as u8,
                    status,
                    read_state: read_state.0,
                    write_state: write_state.0,
                    write_latch,
                    rw_mode: rw_mode.0,
                    mode: mode as u8,
                    bcd: bcd as u8,
                    gate: gate as u8,
                    count_load_time: count_load_time.as_nanos(),
                    next_transition_time: next_transition_time.map(VmTime::as_nanos),
                }
            });

            Ok(state::SavedState::V2(state::SavedStateV2 {
                channels,
                timer_deadline: self.vmtime.timeout().map(VmTime::as_nanos),
            }))
        }

        fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError> {
            let (channels, timer_deadline) = match state {
                state::SavedState::V2(state::SavedStateV2 {
                    channels,
                    timer_deadline,
                }) => (channels, timer_deadline),
                state::SavedState::V1(state::SavedStateV1 {
                    channels,
                    next_transition_time,
                    timer_deadline,
                }) => {
                    // The legacy format tracked a transition time for
                    // channel 0 only; channels 1 and 2 are rebuilt without
                    // one, which is consistent with them never owning the
                    // timer.
                    let [c0, c1, c2] = channels;
                    let upgrade = |c: state::SavedChannelV1, next_transition_time| {
                        let state::SavedChannelV1 {
                            count,
                            latched_count,
                            count_latched,
                            status_latched,
                            status,
                            read_state,
                            write_state,
                            write_latch,
                            rw_mode,
                            mode,
                            bcd,
                            gate,
                            count_load_time,
                        } = c;
                        state::SavedChannel {
                            count,
                            latched_count,
                            count_latched,
                            status_latched,
                            status,
                            read_state,
                            write_state,
                            write_latch,
                            rw_mode,
                            mode,
                            bcd,
                            gate,
                            count_load_time,
                            next_transition_time,
                        }
                    };
                    (
                        [
                            upgrade(c0, next_transition_time),
                            upgrade(c1, None),
                            upgrade(c2, None),
                        ],
                        timer_deadline,
                    )
                }
            };

            let now = self.vmtime.now();
            for (channel, saved) in self.channels.iter_mut().zip(channels) {
                let state::SavedChannel {
                    count,
                    latched_count,
                    count_latched,
                    status_latched,
                    status,
                    read_state,
                    write_state,
                    write_latch,
                    rw_mode,
                    mode,
                    bcd,
                    gate,
                    count_load_time,
                    next_transition_time,
                } = saved;

                if !(1..=0x10000).contains(&count) {
                    return Err(RestoreError::InvalidSavedState(
                        PitRestoreError::CountOutOfRange(count).into(),
                    ));
                }
                let count_load_time = VmTime::from_nanos(count_load_time);
                if count_load_time.is_after(now) {
                    return Err(RestoreError::InvalidSavedState(
                        PitRestoreError::CountLoadTimeInFuture.into(),
                    ));
                }

                *channel = Channel {
                    count,
                    latched_count,
                    count_latched: RwMode(count_latched & 3),
                    status_latched: status_latched != 0,
                    status,
                    read_state: RwState(read_state),
                    write_state: RwState(write_state),
                    write_latch,
                    rw_mode: RwMode(rw_mode & 3),
                    mode: Mode::from(mode),
                    bcd: bcd & 1 != 0,
                    gate: gate != 0,
                    count_load_time,
                    next_transition_time: next_transition_time.map(VmTime::from_nanos),
                };
            }

            match timer_deadline {
                Some(deadline) => self.vmtime.set_timeout(VmTime::from_nanos(deadline)),
                None => self.vmtime.cancel_timeout(),
            }
            // Re-assert the line to the restored output level.
            self.interrupt.set_level(self.channels[0].out(now));

            Ok(())
        }
    }
}
