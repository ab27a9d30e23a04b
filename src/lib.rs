// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Intel 8253/8254 programmable interval timer (PIT) emulation, as found on
//! PC (and PC compatible) platforms.
//!
//! The device itself lives in [`pit`]. Its collaborators are kept behind
//! small seams so the core can be embedded in different virtual machine
//! monitors: the host virtual clock behind [`vmtime::VmTimeSource`], the
//! interrupt controller behind [`line_interrupt::LineSetTarget`], the IO
//! port dispatch fabric behind [`pio::PortIoIntercept`], and saved-state
//! encoding behind the types in [`pit::save_restore`].

#![forbid(unsafe_code)]

pub mod counter;
pub mod line_interrupt;
pub mod pio;
pub mod pit;
pub mod save_restore;
pub mod vmtime;
