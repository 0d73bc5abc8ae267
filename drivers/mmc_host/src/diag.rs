// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Diagnostics surface: host info, register dumps and error reports.

use alloc::vec::Vec;
use core::{fmt, sync::atomic::Ordering};

use log::{Level, error, log, warn};
use strum::IntoEnumIterator;

use crate::{
    config::{DelayPair, DetectMode, HostCaps, SpeedMode},
    error::{ErrorFlags, HostError, HostResult},
    host::{EngineState, HostContext},
    ios::{BusWidth, SignalVoltage},
    regs::{IdmaInt, IntFlags, Reg, RegisterBus, StatusFlags},
    request::Request,
};

/// Highest accepted debug level.
pub const MAX_DEBUG_LEVEL: u8 = 3;

/// Point-in-time summary of a host.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub reg_base: usize,
    pub desc_base: u64,
    pub module_hz: u64,
    pub card_hz: u64,
    pub speed: SpeedMode,
    pub delay: DelayPair,
    pub bus_width: BusWidth,
    pub ddr: bool,
    pub voltage: SignalVoltage,
    pub present: bool,
    pub detect_mode: DetectMode,
    pub read_only: bool,
    pub powered: bool,
    pub suspended: bool,
    pub engine: EngineState,
    pub caps: HostCaps,
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "register base: {:#x}", self.reg_base)?;
        writeln!(f, "descriptor base: {:#x}", self.desc_base)?;
        writeln!(f, "module clock: {} Hz", self.module_hz)?;
        writeln!(f, "card clock: {} Hz ({})", self.card_hz, self.speed)?;
        writeln!(
            f,
            "delay: output {} sample {}",
            self.delay.output, self.delay.sample
        )?;
        writeln!(f, "bus width: {}", self.bus_width.lines())?;
        writeln!(f, "ddr: {}", self.ddr)?;
        writeln!(f, "voltage: {}", self.voltage)?;
        writeln!(f, "present: {}", self.present)?;
        writeln!(f, "detect mode: {}", self.detect_mode)?;
        writeln!(f, "read only: {}", self.read_only)?;
        writeln!(f, "power: {}", if self.powered { "on" } else { "off" })?;
        writeln!(f, "suspended: {}", self.suspended)?;
        writeln!(f, "state: {}", self.engine)?;
        write!(f, "caps: {:?}", self.caps)
    }
}

/// Raw value of every named register.
#[derive(Debug, Clone)]
pub struct RegisterDump {
    pub base: usize,
    pub regs: Vec<(Reg, u32)>,
}

impl RegisterDump {
    pub fn get(&self, reg: Reg) -> Option<u32> {
        self.regs.iter().find(|(r, _)| *r == reg).map(|(_, v)| *v)
    }
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "registers at {:#x}:", self.base)?;
        for (reg, val) in &self.regs {
            writeln!(f, "  {:<7} [{:#05x}] = {:#010x}", reg.name(), reg.offset(), val)?;
        }
        Ok(())
    }
}

impl<B: RegisterBus> HostContext<B> {
    pub fn host_info(&self) -> HostInfo {
        let read_only = self.get_read_only();
        let st = self.state.lock();
        HostInfo {
            reg_base: self.bus.base(),
            desc_base: self.platform.dma.virt_to_bus(st.ring.vaddr()),
            module_hz: st.clock.module_hz,
            card_hz: st.clock.card_hz,
            speed: st.clock.speed,
            delay: st.clock.delay,
            bus_width: st.ios.bus_width,
            ddr: st.clock.ddr,
            voltage: st.voltage,
            present: st.detector.present(),
            detect_mode: st.detector.mode(),
            read_only,
            powered: st.powered,
            suspended: st.suspended,
            engine: st.engine,
            caps: self.caps,
        }
    }

    /// Reads every named register. Reads have no side effects.
    pub fn register_dump(&self) -> RegisterDump {
        RegisterDump {
            base: self.bus.base(),
            regs: Reg::iter().map(|reg| (reg, self.bus.read(reg))).collect(),
        }
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level.load(Ordering::Relaxed)
    }

    /// Sets the verbosity of error reports (0 to [`MAX_DEBUG_LEVEL`]).
    pub fn set_debug_level(&self, level: u8) -> HostResult {
        if level > MAX_DEBUG_LEVEL {
            return Err(HostError::Unsupported);
        }
        self.debug_level.store(level, Ordering::Relaxed);
        Ok(())
    }

    /// Dumps a failed request.
    ///
    /// The dump is produced for every error; the debug level only decides
    /// how much of it is logged above `debug`.
    pub(crate) fn report_error(&self, req: &Request, errors: ErrorFlags) {
        let name = &self.config.name;
        let level = self.debug_level();
        let cmd = &req.cmd;
        error!(
            "{}: CMD{} arg {:#x} failed: {} ({:#x})",
            name,
            cmd.opcode,
            cmd.arg,
            HostError::Protocol(errors),
            errors.bits()
        );
        if let Some(data) = &req.data {
            if level >= 1 {
                warn!(
                    "{}: {:?} {}x{} bytes in {} segments",
                    name,
                    data.direction,
                    data.block_count,
                    data.block_size,
                    data.segments.len()
                );
            }
        }

        let dump = self.register_dump();
        let int = IntFlags::from_bits_retain(dump.get(Reg::Rintr).unwrap_or(0));
        let idma = IdmaInt::from_bits_retain(dump.get(Reg::Idst).unwrap_or(0));
        let status = StatusFlags::from_bits_retain(dump.get(Reg::Status).unwrap_or(0));
        let snapshot = if level >= 2 { Level::Warn } else { Level::Debug };
        log!(snapshot, "{}: RINTR {:?} IDST {:?} STATUS {:?}", name, int, idma, status);
        for (reg, val) in &dump.regs {
            log!(snapshot, "{}:   {:<7} = {:#010x}", name, reg.name(), val);
        }
        if level >= 3 {
            let det = &self.config.detect;
            let cd = det.cd_pin.map(|pin| self.platform.gpio.read(pin));
            let wp = det.wp_pin.map(|pin| self.platform.gpio.read(pin));
            let st = self.state.lock();
            warn!(
                "{}: detect {} present {} cd {:?} wp {:?} voltage {} clock {} Hz",
                name,
                st.detector.mode(),
                st.detector.present(),
                cd,
                wp,
                st.voltage,
                st.clock.card_hz
            );
        }
    }
}
