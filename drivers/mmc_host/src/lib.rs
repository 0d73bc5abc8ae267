// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Request engine of an SD/MMC/SDIO host controller.
//!
//! Turns block I/O requests into bus transactions: command dispatch,
//! internal DMA descriptor chains, interrupt driven completion, clock and
//! signal voltage control, sample delay tuning and card detection.
//!
//! Hardware access goes through [`RegisterBus`]; pins, clocks, regulators,
//! GPIOs, interrupts and time come from the [`Platform`] providers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod completion;
pub mod config;
pub mod detect;
pub mod diag;
pub mod error;
pub mod host;
pub mod idma;
pub mod ios;
pub mod platform;
pub mod regs;
pub mod request;
pub mod tuning;
mod voltage;

#[doc(no_inline)]
pub use driver_base::{DeviceKind, DriverError, DriverOps, DriverResult};

pub use self::{
    clock::ClockProfile,
    config::{
        ClockDelayTable, DelayPair, DetectConfig, DetectMode, HostCaps, HostTimings,
        PinAssignment, PlatformConfig, SpeedMode,
    },
    detect::CardEvent,
    diag::{HostInfo, RegisterDump},
    error::{ErrorFlags, HostError, HostResult},
    host::{EngineState, HostContext, IrqOutcome, WaitFlags},
    idma::ScatterSegment,
    ios::{BusIos, BusWidth, PowerMode, SignalVoltage, TimingMode},
    platform::Platform,
    regs::{MmioBus, Reg, RegisterBus},
    request::{
        AutoCommand, Command, CompletedRequest, Data, DataDirection, Request, Response,
        ResponseKind,
    },
    tuning::TuningIo,
};
