// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Common interfaces shared by every device driver.

#![no_std]

use core::fmt;

/// Kinds of devices a driver may expose.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum DeviceKind {
    /// Block storage device (e.g., disk, SD card).
    Block,
    /// Character device (e.g., serial port).
    Char,
    /// Network device (e.g., NIC).
    Net,
    /// Graphic display device (e.g., GPU).
    Display,
    /// Input device (e.g., keyboard, mouse).
    Input,
    /// Vsock device.
    Vsock,
}

/// Errors a driver or a driver-facing provider may report.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverError {
    /// An entity already exists.
    AlreadyExists,
    /// Try again, for non-blocking APIs.
    WouldBlock,
    /// Bad internal state.
    BadState,
    /// Invalid parameter/argument.
    InvalidInput,
    /// Input/output error.
    Io,
    /// Not enough space/cannot allocate memory (DMA).
    NoMemory,
    /// Device or resource is busy.
    ResourceBusy,
    /// This operation is unsupported or unimplemented.
    Unsupported,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AlreadyExists => "entity already exists",
            Self::WouldBlock => "operation would block",
            Self::BadState => "bad internal state",
            Self::InvalidInput => "invalid input",
            Self::Io => "I/O error",
            Self::NoMemory => "out of memory",
            Self::ResourceBusy => "resource busy",
            Self::Unsupported => "operation unsupported",
        };
        f.write_str(msg)
    }
}

/// A specialized `Result` type for device drivers.
pub type DriverResult<T = ()> = Result<T, DriverError>;

/// Operations common to all device drivers.
pub trait DriverOps: Send + Sync {
    /// The name of the device.
    fn name(&self) -> &str;

    /// The kind of the device.
    fn device_kind(&self) -> DeviceKind;
}
