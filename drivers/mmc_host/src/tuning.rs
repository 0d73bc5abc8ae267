// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Sample clock delay tuning.

use log::{info, warn};

use crate::{
    config::SpeedMode,
    error::{HostError, HostResult},
    host::{EngineState, HostContext},
    ios::{BusWidth, TimingMode},
    regs::{MAX_DELAY_STEP, Reg, RegisterBus, WIDTH_1BIT},
    request::{MMC_SEND_TUNING_BLOCK, MMC_SEND_TUNING_BLOCK_HS200},
};

/// Tuning block returned by SD cards on a 4-bit bus.
pub const TUNING_BLOCK_4BIT: [u8; 64] = [
    0xff, 0x0f, 0xff, 0x00, 0xff, 0xcc, 0xc3, 0xcc, //
    0xc3, 0x3c, 0xcc, 0xff, 0xfe, 0xff, 0xfe, 0xef, //
    0xff, 0xdf, 0xff, 0xdd, 0xff, 0xfb, 0xff, 0xfb, //
    0xbf, 0xff, 0x7f, 0xff, 0x77, 0xf7, 0xbd, 0xef, //
    0xff, 0xf0, 0xff, 0xf0, 0x0f, 0xfc, 0xcc, 0x3c, //
    0xcc, 0x33, 0xcc, 0xcf, 0xff, 0xef, 0xff, 0xee, //
    0xff, 0xfd, 0xff, 0xfd, 0xdf, 0xff, 0xbf, 0xff, //
    0xbb, 0xff, 0xf7, 0xff, 0xf7, 0x7f, 0x7b, 0xde, //
];

/// Tuning block returned by eMMC devices on an 8-bit bus.
pub const TUNING_BLOCK_8BIT: [u8; 128] = [
    0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, //
    0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc, 0xcc, //
    0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, 0xff, //
    0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee, 0xff, //
    0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, 0xdd, //
    0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff, 0xbb, //
    0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, 0xff, //
    0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee, 0xff, //
    0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, //
    0x00, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc, //
    0xcc, 0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, //
    0xff, 0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee, //
    0xff, 0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, //
    0xdd, 0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff, //
    0xbb, 0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, //
    0xff, 0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee, //
];

/// Highest card clock used after falling back to legacy timing.
const LEGACY_MAX_HZ: u32 = 25_000_000;

/// Reference pattern for a bus width.
pub fn tuning_pattern(width: BusWidth) -> &'static [u8] {
    match width {
        BusWidth::Eight => &TUNING_BLOCK_8BIT,
        _ => &TUNING_BLOCK_4BIT,
    }
}

/// Issues tuning block reads on behalf of the tuning sweep.
///
/// Implemented by the card protocol layer, usually by submitting a single
/// block read of `opcode` and waiting for its completion.
pub trait TuningIo {
    fn read_tuning_block(&mut self, opcode: u8, buf: &mut [u8]) -> HostResult;
}

/// A contiguous run of passing delay steps.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PassWindow {
    pub start: usize,
    pub len: usize,
}

impl PassWindow {
    /// Middle step of the run (the lower one for even lengths).
    pub fn midpoint(&self) -> usize {
        self.start + (self.len - 1) / 2
    }
}

/// Finds the longest run of `true`; the earliest one wins a tie.
pub fn best_window(pass: &[bool]) -> Option<PassWindow> {
    let mut best: Option<PassWindow> = None;
    let mut run_start = None;
    for (i, ok) in pass.iter().copied().chain(core::iter::once(false)).enumerate() {
        match (ok, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let len = i - start;
                if best.is_none_or(|b| len > b.len) {
                    best = Some(PassWindow { start, len });
                }
                run_start = None;
            }
            _ => {}
        }
    }
    best
}

impl<B: RegisterBus> HostContext<B> {
    /// Sweeps the sample delay and keeps the middle of the widest window
    /// that reads the tuning pattern back intact.
    ///
    /// The chosen step is stored in the clock delay table for the current
    /// speed mode. When no step passes the host falls back to 1-bit legacy
    /// timing and [`HostError::TuningFailed`] is returned.
    ///
    /// Only tuning block reads may be submitted while the sweep runs.
    pub fn tune(&self, io: &mut dyn TuningIo) -> HostResult<u8> {
        let _reserved = self.reserve(EngineState::Tuning)?;
        let (timing, width, speed) = {
            let st = self.state.lock();
            (st.ios.timing, st.ios.bus_width, st.clock.speed)
        };
        if !timing.needs_tuning() {
            return Err(HostError::Unsupported);
        }
        let opcode = match timing {
            TimingMode::MmcHs200 => MMC_SEND_TUNING_BLOCK_HS200,
            _ => MMC_SEND_TUNING_BLOCK,
        };
        let pattern = tuning_pattern(width);
        let mut block = [0u8; TUNING_BLOCK_8BIT.len()];
        let buf = &mut block[..pattern.len()];

        let mut pass = [false; MAX_DELAY_STEP as usize + 1];
        for (step, ok) in pass.iter_mut().enumerate() {
            self.write_sample_delay(step as u8);
            buf.fill(0);
            *ok = io.read_tuning_block(opcode, buf).is_ok() && *buf == *pattern;
        }

        let Some(window) = best_window(&pass) else {
            warn!("{}: tuning found no passing sample delay", self.config.name);
            self.fall_back_to_legacy(speed);
            return Err(HostError::TuningFailed);
        };
        let step = window.midpoint() as u8;
        self.write_sample_delay(step);
        {
            let mut st = self.state.lock();
            st.delays.set_sample(speed, step);
            st.clock.delay.sample = step;
        }
        info!(
            "{}: tuned {} sample delay to {} (window {}..{})",
            self.config.name,
            speed,
            step,
            window.start,
            window.start + window.len
        );
        Ok(step)
    }

    fn fall_back_to_legacy(&self, speed: SpeedMode) {
        let (delay, clock_hz) = {
            let mut st = self.state.lock();
            st.ios.bus_width = BusWidth::One;
            st.ios.timing = TimingMode::Legacy;
            st.ios.ddr = false;
            st.ios.clock_hz = st.ios.clock_hz.min(LEGACY_MAX_HZ);
            (st.delays.get(speed), st.ios.clock_hz)
        };
        self.write_sample_delay(delay.sample);
        self.bus.write(Reg::Width, WIDTH_1BIT);
        if let Err(err) = self.set_clock(clock_hz, false) {
            warn!("{}: legacy clock fallback failed: {}", self.config.name, err);
        }
    }
}
