// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Card clock control.

use log::{debug, error};

use crate::{
    config::{DelayPair, SpeedMode},
    error::{HostError, HostResult},
    host::HostContext,
    ios::BusWidth,
    regs::{Clkcr, CmdFlags, DelayCtrl, Gctrl, Reg, RegisterBus},
};

/// Fixed ratio between the module clock and the card clock.
pub const fn clock_ratio(ddr: bool) -> u64 {
    if ddr { 8 } else { 4 }
}

/// Clock state currently programmed into the controller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockProfile {
    /// Rate the module clock actually runs at.
    pub module_hz: u64,
    /// Resulting card clock; zero while gated.
    pub card_hz: u64,
    pub speed: SpeedMode,
    pub delay: DelayPair,
    pub ddr: bool,
    pub bus_width: BusWidth,
}

impl Default for ClockProfile {
    fn default() -> Self {
        Self {
            module_hz: 0,
            card_hz: 0,
            speed: SpeedMode::Ds400K,
            delay: DelayPair::default(),
            ddr: false,
            bus_width: BusWidth::One,
        }
    }
}

impl<B: RegisterBus> HostContext<B> {
    /// Reprograms the module clock for a card clock of `target_hz`.
    ///
    /// The card clock output stays gated while the module clock is
    /// reparented and rescaled. A zero target only gates the output.
    pub(crate) fn set_clock(&self, target_hz: u32, ddr: bool) -> HostResult {
        self.card_clock_enable(false)?;
        if target_hz == 0 {
            let mut st = self.state.lock();
            st.clock.card_hz = 0;
            st.clock.ddr = ddr;
            return Ok(());
        }

        let parent = if target_hz <= self.config.low_speed_hz {
            &self.config.low_speed_parent
        } else {
            &self.config.high_speed_parent
        };
        let clk = &self.platform.clock;
        clk.disable();
        clk.set_parent(parent)?;
        clk.set_rate(target_hz as u64 * clock_ratio(ddr))?;
        clk.enable()?;
        let module_hz = clk.rate();
        let card_hz = module_hz / clock_ratio(ddr);

        let (width, speed, delay) = {
            let st = self.state.lock();
            let width = st.ios.bus_width;
            let speed = SpeedMode::select(target_hz, ddr, width);
            (width, speed, st.delays.get(speed))
        };

        self.bus.modify(Reg::Clkcr, Clkcr::DIVIDER.bits(), 0);
        if ddr {
            self.bus.modify(Reg::Gctrl, 0, Gctrl::DDR_MODE.bits());
        } else {
            self.bus.modify(Reg::Gctrl, Gctrl::DDR_MODE.bits(), 0);
        }
        self.apply_delays(delay);
        self.card_clock_enable(true)?;

        debug!(
            "{}: card clock {} Hz (module {} Hz from {}, {} mode, delays {}/{})",
            self.config.name, card_hz, module_hz, parent, speed, delay.output, delay.sample
        );
        self.state.lock().clock = ClockProfile {
            module_hz,
            card_hz,
            speed,
            delay,
            ddr,
            bus_width: width,
        };
        Ok(())
    }

    /// Gates or ungates the card clock output.
    pub(crate) fn card_clock_enable(&self, on: bool) -> HostResult {
        if on {
            self.bus.modify(Reg::Clkcr, 0, Clkcr::CARD_CLK_ON.bits());
        } else {
            self.bus.modify(Reg::Clkcr, Clkcr::CARD_CLK_ON.bits(), 0);
        }
        self.update_clock()
    }

    /// Commits a card clock change with an update-clock-only command.
    pub(crate) fn update_clock(&self) -> HostResult {
        // DAT0 busy must not stall the update.
        self.bus.modify(Reg::Clkcr, 0, Clkcr::MASK_DATA0.bits());
        let cmd = CmdFlags::START | CmdFlags::UPCLK_ONLY | CmdFlags::WAIT_PRE_OVER;
        self.bus.write(Reg::Cmd, cmd.bits());

        let committed = self.poll(self.config.timings.clk_update_polls, || {
            self.bus.read(Reg::Cmd) & CmdFlags::START.bits() == 0
        });
        self.bus.modify(Reg::Clkcr, Clkcr::MASK_DATA0.bits(), 0);
        if !committed {
            error!("{}: update clock timed out", self.config.name);
            return Err(HostError::BusTimeout);
        }
        Ok(())
    }

    /// Writes the output/sample delay pair.
    pub(crate) fn apply_delays(&self, delay: DelayPair) {
        let output = delay.output as u32 & DelayCtrl::STEP.bits();
        self.bus.write(Reg::DrvDl, DelayCtrl::SW_ENABLE.bits() | output);
        self.write_sample_delay(delay.sample);
    }

    pub(crate) fn write_sample_delay(&self, step: u8) {
        let step = step as u32 & DelayCtrl::STEP.bits();
        self.bus.write(Reg::SampDl, DelayCtrl::SW_ENABLE.bits() | step);
    }
}

