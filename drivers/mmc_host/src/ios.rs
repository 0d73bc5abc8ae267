// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Bus I/O settings requested by the card protocol layer.

use strum::{Display, IntoStaticStr};

/// Data bus width.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum BusWidth {
    #[default]
    One,
    Four,
    Eight,
}

impl BusWidth {
    /// Number of data lines.
    pub const fn lines(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}

/// Signal timing selected by the card protocol layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Display, IntoStaticStr)]
pub enum TimingMode {
    #[default]
    Legacy,
    MmcHs,
    SdHs,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
    MmcDdr52,
    MmcHs200,
}

impl TimingMode {
    /// Returns true if this timing requires sample-delay tuning.
    pub const fn needs_tuning(self) -> bool {
        matches!(self, Self::UhsSdr104 | Self::MmcHs200)
    }

    /// Returns true if this timing samples on both clock edges.
    pub const fn is_ddr(self) -> bool {
        matches!(self, Self::UhsDdr50 | Self::MmcDdr52)
    }
}

/// Card power state requested through `set_bus_ios`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum PowerMode {
    #[default]
    Off,
    Up,
    On,
}

/// Signalling voltage of the bus.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Display, IntoStaticStr)]
pub enum SignalVoltage {
    #[strum(serialize = "3.3V")]
    V330,
    #[strum(serialize = "1.8V")]
    V180,
    #[strum(serialize = "1.2V")]
    V120,
    #[default]
    #[strum(serialize = "OFF")]
    Off,
}

impl SignalVoltage {
    /// Regulator setpoint in microvolts, `None` for [`SignalVoltage::Off`].
    pub const fn microvolts(self) -> Option<u32> {
        match self {
            Self::V330 => Some(3_300_000),
            Self::V180 => Some(1_800_000),
            Self::V120 => Some(1_200_000),
            Self::Off => None,
        }
    }
}

/// Bus settings applied atomically by `HostContext::set_bus_ios`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct BusIos {
    /// Target card clock in Hz; zero gates the card clock.
    pub clock_hz: u32,
    pub bus_width: BusWidth,
    pub timing: TimingMode,
    pub ddr: bool,
    pub power: PowerMode,
}
