// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Supply sequencing and signal voltage switching.

use log::{debug, info, warn};

use crate::{
    clock::ClockProfile,
    error::{HostError, HostResult},
    host::{EngineState, HostContext},
    ios::SignalVoltage,
    regs::{Reg, RegisterBus, StatusFlags},
};

const VDD_3V3_UV: u32 = 3_300_000;

/// All of DAT[3:0] read high and neither the card nor the data FSM holds
/// the bus.
fn lines_released(status: StatusFlags) -> bool {
    status.contains(StatusFlags::DAT_LEVELS) && !status.intersects(StatusFlags::LINES_BUSY)
}

impl<B: RegisterBus> HostContext<B> {
    /// Switches the signalling voltage.
    ///
    /// The 3.3V to 1.8V transition runs the UHS handshake: all data lines
    /// must be released (high) before the switch and driven after it,
    /// otherwise [`HostError::RetryLater`] is returned with the voltage left
    /// at 3.3V. Retrying is up to the caller.
    pub fn switch_voltage(&self, target: SignalVoltage) -> HostResult {
        if !self.caps.allows_voltage(target) {
            return Err(HostError::Unsupported);
        }
        let _reserved = self.reserve(EngineState::Reconfiguring)?;
        let current = self.state.lock().voltage;
        if current == target {
            return Ok(());
        }

        match target {
            SignalVoltage::Off => {
                if let Some(vqmmc) = &self.platform.vqmmc {
                    vqmmc.disable()?;
                }
                self.set_voltage_state(SignalVoltage::Off);
                Ok(())
            }
            SignalVoltage::V180 if current == SignalVoltage::V330 => self.uhs_switch(),
            _ => self.apply_signal_voltage(target),
        }
    }

    /// Current signalling voltage.
    pub fn voltage(&self) -> SignalVoltage {
        self.state.lock().voltage
    }

    fn uhs_switch(&self) -> HostResult {
        let vqmmc = self.platform.vqmmc.as_ref().ok_or(HostError::Unsupported)?;
        let timings = &self.config.timings;

        if !lines_released(self.status()) {
            debug!("{}: data lines not released, 1.8V switch deferred", self.config.name);
            return Err(HostError::RetryLater);
        }

        self.card_clock_enable(false)?;
        vqmmc.set_voltage_uv(1_800_000)?;
        self.platform.timer.delay(timings.switch_clock_gate);
        self.card_clock_enable(true)?;
        self.platform.timer.delay(timings.switch_line_settle);

        if !self.status().contains(StatusFlags::DAT_LEVELS) {
            warn!(
                "{}: card did not drive data lines after 1.8V switch",
                self.config.name
            );
            vqmmc.set_voltage_uv(VDD_3V3_UV)?;
            self.platform.timer.delay(timings.voltage_settle);
            return Err(HostError::RetryLater);
        }

        self.set_voltage_state(SignalVoltage::V180);
        Ok(())
    }

    fn apply_signal_voltage(&self, target: SignalVoltage) -> HostResult {
        if let (Some(vqmmc), Some(uv)) = (&self.platform.vqmmc, target.microvolts()) {
            vqmmc.set_voltage_uv(uv)?;
            vqmmc.enable()?;
            self.platform.timer.delay(self.config.timings.voltage_settle);
        }
        self.set_voltage_state(target);
        Ok(())
    }

    fn set_voltage_state(&self, voltage: SignalVoltage) {
        info!("{}: signal voltage {}", self.config.name, voltage);
        self.state.lock().voltage = voltage;
    }

    /// Powers the card supplies and brings the controller out of reset.
    pub(crate) fn power_up(&self) -> HostResult {
        if let Some(vmmc) = &self.platform.vmmc {
            vmmc.set_voltage_uv(VDD_3V3_UV)?;
            vmmc.enable()?;
        }
        if let Some(vqmmc) = &self.platform.vqmmc {
            vqmmc.set_voltage_uv(VDD_3V3_UV)?;
            vqmmc.enable()?;
        }
        self.platform.timer.delay(self.config.timings.voltage_settle);
        self.platform.pinctrl.select_state("default")?;
        self.platform.clock.enable()?;
        self.reset_controller()?;
        self.program_defaults();

        let mut st = self.state.lock();
        st.voltage = SignalVoltage::V330;
        st.powered = false;
        debug!("{}: power up", self.config.name);
        Ok(())
    }

    /// Masks the controller, gates every clock and drops the supplies.
    pub(crate) fn power_off(&self) -> HostResult {
        self.bus.write(Reg::Imask, 0);
        self.bus.write(Reg::Idie, 0);
        if let Err(err) = self.card_clock_enable(false) {
            warn!("{}: gating card clock on power off: {}", self.config.name, err);
        }
        self.platform.clock.disable();
        if let Some(vqmmc) = &self.platform.vqmmc {
            vqmmc.disable()?;
        }
        if let Some(vmmc) = &self.platform.vmmc {
            vmmc.disable()?;
        }
        self.platform.pinctrl.select_state("sleep")?;

        let mut st = self.state.lock();
        st.voltage = SignalVoltage::Off;
        st.powered = false;
        let bus_width = st.ios.bus_width;
        st.clock = ClockProfile {
            bus_width,
            ..ClockProfile::default()
        };
        debug!("{}: power off", self.config.name);
        Ok(())
    }
}
