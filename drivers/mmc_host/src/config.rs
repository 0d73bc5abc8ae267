// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Static configuration of one controller instance.

use alloc::{string::String, vec::Vec};
use core::time::Duration;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{HostError, HostResult},
    idma::{DESC_MAX_LEN, DMA_ALIGN},
    ios::{BusWidth, SignalVoltage, TimingMode},
    platform::{PinConfig, Pull},
    regs::MAX_DELAY_STEP,
};

/// Upper bound on the number of samples kept by the polled detector.
pub const MAX_POLL_SAMPLES: usize = 16;
/// Largest descriptor ring reserved at attach.
pub const MAX_DESCRIPTORS: usize = 4096;

bitflags::bitflags! {
    /// Host capabilities.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct HostCaps: u32 {
        const BUS_4BIT    = 1 << 0;
        const BUS_8BIT    = 1 << 1;
        const SD_HS       = 1 << 2;
        const MMC_HS      = 1 << 3;
        const UHS_SDR50   = 1 << 4;
        const UHS_SDR104  = 1 << 5;
        const UHS_DDR50   = 1 << 6;
        const MMC_DDR_3V3 = 1 << 7;
        const MMC_DDR_1V8 = 1 << 8;
        const MMC_HS200   = 1 << 9;
        /// DDR on an 8-bit bus.
        const DDR_8BIT    = 1 << 10;
        const SIGNAL_1V8  = 1 << 11;
        const SIGNAL_1V2  = 1 << 12;
        const HW_RESET    = 1 << 13;
        const SDIO_IRQ    = 1 << 14;

        /// Capabilities that need a switchable signalling regulator.
        const NEEDS_VQMMC = Self::UHS_SDR50.bits()
            | Self::UHS_SDR104.bits()
            | Self::UHS_DDR50.bits()
            | Self::MMC_DDR_1V8.bits()
            | Self::MMC_HS200.bits()
            | Self::SIGNAL_1V8.bits()
            | Self::SIGNAL_1V2.bits();
    }
}

impl HostCaps {
    /// Derives the capabilities the host actually honours.
    ///
    /// This is the only place capability gating happens: every later check
    /// consults the result instead of re-deriving it.
    pub fn effective(self, has_vqmmc: bool) -> Self {
        let mut caps = self;
        if !has_vqmmc {
            caps.remove(Self::NEEDS_VQMMC);
        }
        if !caps.contains(Self::BUS_8BIT) {
            caps.remove(Self::DDR_8BIT);
        }
        if !caps.intersects(Self::UHS_DDR50 | Self::MMC_DDR_3V3 | Self::MMC_DDR_1V8) {
            caps.remove(Self::DDR_8BIT);
        }
        caps
    }

    /// Returns true if the bus width is usable.
    pub fn allows_width(self, width: BusWidth) -> bool {
        match width {
            BusWidth::One => true,
            BusWidth::Four => self.contains(Self::BUS_4BIT),
            BusWidth::Eight => self.contains(Self::BUS_8BIT),
        }
    }

    /// Returns true if the signalling voltage is usable.
    pub fn allows_voltage(self, voltage: SignalVoltage) -> bool {
        match voltage {
            SignalVoltage::V330 | SignalVoltage::Off => true,
            SignalVoltage::V180 => self.intersects(Self::NEEDS_VQMMC.difference(Self::SIGNAL_1V2)),
            SignalVoltage::V120 => self.contains(Self::SIGNAL_1V2),
        }
    }

    /// Returns true if the timing mode is usable.
    pub fn allows_timing(self, timing: TimingMode) -> bool {
        match timing {
            TimingMode::Legacy => true,
            TimingMode::UhsSdr12 | TimingMode::UhsSdr25 => self.allows_voltage(SignalVoltage::V180),
            TimingMode::SdHs => self.contains(Self::SD_HS),
            TimingMode::MmcHs => self.contains(Self::MMC_HS),
            TimingMode::UhsSdr50 => self.contains(Self::UHS_SDR50),
            TimingMode::UhsSdr104 => self.contains(Self::UHS_SDR104),
            TimingMode::UhsDdr50 => self.contains(Self::UHS_DDR50),
            TimingMode::MmcDdr52 => self.intersects(Self::MMC_DDR_3V3 | Self::MMC_DDR_1V8),
            TimingMode::MmcHs200 => self.contains(Self::MMC_HS200),
        }
    }
}

/// Card detection strategy.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DetectMode {
    /// Non-removable card, always present.
    AlwaysPresent,
    /// Detect pin sampled by a periodic timer.
    PollGpio,
    /// Detect pin edge interrupt followed by a debounce window.
    IrqGpio,
    /// DAT3 line used as the presence signal.
    Data3Line,
    /// Presence set by an explicit external call.
    Manual,
}

/// Card detect and write-protect wiring.
#[derive(Debug, Clone)]
pub struct DetectConfig {
    pub mode: DetectMode,
    /// Card-detect GPIO, required by the GPIO based modes.
    pub cd_pin: Option<u32>,
    /// The detect pin reads low when a card is inserted.
    pub cd_active_low: bool,
    /// Consecutive agreeing samples required by [`DetectMode::PollGpio`].
    pub poll_samples: usize,
    /// Period of the detect timer for [`DetectMode::PollGpio`].
    pub poll_interval: Duration,
    /// Settling window for [`DetectMode::IrqGpio`].
    pub debounce: Duration,
    /// Write-protect GPIO; absent means the card is always writable.
    pub wp_pin: Option<u32>,
    /// The write-protect pin reads high when the card is protected.
    pub wp_active_high: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            mode: DetectMode::AlwaysPresent,
            cd_pin: None,
            cd_active_low: true,
            poll_samples: 5,
            poll_interval: Duration::from_millis(100),
            debounce: Duration::from_millis(200),
            wp_pin: None,
            wp_active_high: true,
        }
    }
}

/// Named speed modes, each with its own clock delay pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, IntoStaticStr)]
pub enum SpeedMode {
    #[strum(serialize = "400K")]
    Ds400K,
    #[strum(serialize = "25M")]
    Hs25M,
    #[strum(serialize = "50M")]
    Hs50M,
    #[strum(serialize = "50M-DDR")]
    Hs50MDdr,
    #[strum(serialize = "50M-DDR-8bit")]
    Hs50MDdr8,
    #[strum(serialize = "100M")]
    Hs100M,
    #[strum(serialize = "200M")]
    Hs200M,
}

impl SpeedMode {
    pub const ALL: [SpeedMode; 7] = [
        Self::Ds400K,
        Self::Hs25M,
        Self::Hs50M,
        Self::Hs50MDdr,
        Self::Hs50MDdr8,
        Self::Hs100M,
        Self::Hs200M,
    ];

    /// Picks the speed mode matching a card clock and bus setting.
    pub fn select(clock_hz: u32, ddr: bool, width: BusWidth) -> Self {
        match clock_hz {
            0..=400_000 => Self::Ds400K,
            400_001..=26_000_000 => Self::Hs25M,
            26_000_001..=52_000_000 if ddr && width == BusWidth::Eight => Self::Hs50MDdr8,
            26_000_001..=52_000_000 if ddr => Self::Hs50MDdr,
            26_000_001..=52_000_000 => Self::Hs50M,
            52_000_001..=100_000_000 => Self::Hs100M,
            _ => Self::Hs200M,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Output/sample clock delay steps of one speed mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct DelayPair {
    pub output: u8,
    pub sample: u8,
}

impl DelayPair {
    pub const fn new(output: u8, sample: u8) -> Self {
        Self { output, sample }
    }
}

/// Clock delay profile, one [`DelayPair`] per [`SpeedMode`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockDelayTable([DelayPair; 7]);

impl ClockDelayTable {
    pub const fn new(pairs: [DelayPair; 7]) -> Self {
        Self(pairs)
    }

    pub fn get(&self, mode: SpeedMode) -> DelayPair {
        self.0[mode.index()]
    }

    /// Records a tuned sample delay for `mode`.
    pub(crate) fn set_sample(&mut self, mode: SpeedMode, sample: u8) {
        self.0[mode.index()].sample = sample;
    }

    fn validate(&self) -> HostResult {
        let in_range = |p: &DelayPair| p.output <= MAX_DELAY_STEP && p.sample <= MAX_DELAY_STEP;
        if self.0.iter().all(in_range) {
            Ok(())
        } else {
            Err(HostError::Unsupported)
        }
    }
}

impl Default for ClockDelayTable {
    fn default() -> Self {
        Self([
            DelayPair::new(0, 0),
            DelayPair::new(0, 0),
            DelayPair::new(1, 0),
            DelayPair::new(2, 4),
            DelayPair::new(2, 4),
            DelayPair::new(1, 4),
            DelayPair::new(1, 8),
        ])
    }
}

/// One pin of the controller and how it must be configured.
#[derive(Debug, Clone)]
pub struct PinAssignment {
    /// Signal name (`"clk"`, `"cmd"`, `"d0"`..`"d7"`).
    pub signal: String,
    pub config: PinConfig,
}

impl PinAssignment {
    pub fn new(signal: &str, function: u8, pull: Pull, drive: u8) -> Self {
        Self {
            signal: signal.into(),
            config: PinConfig {
                function,
                pull,
                drive,
            },
        }
    }
}

/// Polling budgets and protocol delays.
#[derive(Debug, Clone, Copy)]
pub struct HostTimings {
    /// Polls of the status register while waiting for free lines.
    pub line_free_polls: u32,
    pub line_poll_interval: Duration,
    /// Polls of the start bit after an update-clock command.
    pub clk_update_polls: u32,
    /// Polls of the reset bits after a controller/FIFO/DMA reset.
    pub reset_polls: u32,
    /// Polls of DAT0 for commands with a busy response.
    pub busy_polls: u32,
    /// Settle time after a regulator voltage change.
    pub voltage_settle: Duration,
    /// Clock gate time during the 1.8V switch.
    pub switch_clock_gate: Duration,
    /// Time the card is given to drive the lines after the clock restarts.
    pub switch_line_settle: Duration,
    pub hw_reset_pulse: Duration,
    pub hw_reset_recovery: Duration,
}

impl Default for HostTimings {
    fn default() -> Self {
        Self {
            line_free_polls: 1000,
            line_poll_interval: Duration::from_micros(10),
            clk_update_polls: 1000,
            reset_polls: 1000,
            busy_polls: 100_000,
            voltage_settle: Duration::from_millis(1),
            switch_clock_gate: Duration::from_millis(5),
            switch_line_settle: Duration::from_millis(1),
            hw_reset_pulse: Duration::from_micros(10),
            hw_reset_recovery: Duration::from_micros(300),
        }
    }
}

/// Everything a controller instance needs to know about its board.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Device name reported through `DriverOps`.
    pub name: String,
    /// Controller interrupt line.
    pub irq: usize,
    pub pins: Vec<PinAssignment>,
    /// Module clock parent for card clocks at or below `low_speed_hz`.
    pub low_speed_parent: String,
    /// Module clock parent for faster card clocks.
    pub high_speed_parent: String,
    pub low_speed_hz: u32,
    pub detect: DetectConfig,
    /// Capabilities as wired; see [`HostCaps::effective`].
    pub caps: HostCaps,
    pub delays: ClockDelayTable,
    /// Largest byte count of a single descriptor (power of two).
    pub max_segment_size: usize,
    /// Descriptor ring capacity.
    pub max_descriptors: usize,
    /// Largest block count of one request.
    pub max_block_count: u32,
    pub timings: HostTimings,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let pins = ["clk", "cmd", "d0", "d1", "d2", "d3"]
            .iter()
            .map(|s| PinAssignment::new(s, 2, Pull::Up, 3))
            .collect();
        Self {
            name: "sunxi-mmc".into(),
            irq: 0,
            pins,
            low_speed_parent: "osc24m".into(),
            high_speed_parent: "pll-periph".into(),
            low_speed_hz: 400_000,
            detect: DetectConfig::default(),
            caps: HostCaps::BUS_4BIT | HostCaps::SD_HS | HostCaps::MMC_HS,
            delays: ClockDelayTable::default(),
            max_segment_size: 32 * 1024,
            max_descriptors: 128,
            max_block_count: 65535,
            timings: HostTimings::default(),
        }
    }
}

impl PlatformConfig {
    /// Rejects inconsistent configurations before anything touches hardware.
    pub fn validate(&self) -> HostResult {
        if !self.max_segment_size.is_power_of_two()
            || self.max_segment_size % DMA_ALIGN != 0
            || self.max_segment_size > DESC_MAX_LEN
        {
            return Err(HostError::InvalidBuffer);
        }
        if self.max_descriptors == 0
            || self.max_descriptors > MAX_DESCRIPTORS
            || self.max_block_count == 0
        {
            return Err(HostError::InvalidBuffer);
        }
        let det = &self.detect;
        if matches!(det.mode, DetectMode::PollGpio | DetectMode::IrqGpio) && det.cd_pin.is_none() {
            return Err(HostError::Unsupported);
        }
        if det.poll_samples == 0 || det.poll_samples > MAX_POLL_SAMPLES {
            return Err(HostError::Unsupported);
        }
        self.delays.validate()
    }
}
