// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error taxonomy of the host controller.

use core::fmt;

use driver_base::DriverError;
use strum::IntoStaticStr;

use crate::{
    regs::{IdmaInt, IntFlags},
    request::Command,
};

bitflags::bitflags! {
    /// Detailed hardware fault bits retained for diagnostics.
    ///
    /// Callers only see [`HostError::Protocol`]; the sub-flags explain what
    /// the controller actually reported.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
    pub struct ErrorFlags: u32 {
        const RESP_ERROR      = 1 << 0;
        const RESP_CRC        = 1 << 1;
        const DATA_CRC        = 1 << 2;
        const RESP_TIMEOUT    = 1 << 3;
        const DATA_TIMEOUT    = 1 << 4;
        const FIFO_RUN        = 1 << 5;
        const HW_LOCKED       = 1 << 6;
        const START_BIT       = 1 << 7;
        const END_BIT         = 1 << 8;
        const RESP_INDEX      = 1 << 9;
        const DMA_BUS_FAULT   = 1 << 10;
        const DMA_DESC_UNAVAIL = 1 << 11;
        const CARD_BUSY_TIMEOUT = 1 << 12;
        /// The owner gave up waiting and expired the request.
        const SOFTWARE_TIMEOUT = 1 << 13;
    }
}

impl ErrorFlags {
    /// Classifies the raw interrupt and IDMA status words into fault bits.
    pub fn from_raw(int: IntFlags, idma: IdmaInt) -> Self {
        const MAP: [(IntFlags, ErrorFlags); 9] = [
            (IntFlags::RESP_ERROR, ErrorFlags::RESP_ERROR),
            (IntFlags::RESP_CRC_ERROR, ErrorFlags::RESP_CRC),
            (IntFlags::DATA_CRC_ERROR, ErrorFlags::DATA_CRC),
            (IntFlags::RESP_TIMEOUT, ErrorFlags::RESP_TIMEOUT),
            (IntFlags::DATA_TIMEOUT, ErrorFlags::DATA_TIMEOUT),
            (IntFlags::FIFO_RUN_ERROR, ErrorFlags::FIFO_RUN),
            (IntFlags::HARDWARE_LOCKED, ErrorFlags::HW_LOCKED),
            (IntFlags::START_BIT_ERROR, ErrorFlags::START_BIT),
            (IntFlags::END_BIT_ERROR, ErrorFlags::END_BIT),
        ];

        let mut flags = MAP
            .iter()
            .filter(|(raw, _)| int.contains(*raw))
            .fold(ErrorFlags::empty(), |acc, (_, f)| acc | *f);
        if idma.contains(IdmaInt::FATAL_BUS_ERROR) {
            flags |= ErrorFlags::DMA_BUS_FAULT;
        }
        if idma.contains(IdmaInt::DESC_UNAVAILABLE) {
            flags |= ErrorFlags::DMA_DESC_UNAVAIL;
        }
        flags
    }

    /// Applies the response checks `cmd` asked for.
    ///
    /// The controller raises `RESP_ERROR` when the response index does not
    /// echo the opcode. That is an index failure for commands that check it;
    /// R3/R4 responses carry a reserved index, so it is dropped for them.
    pub fn for_command(self, cmd: &Command) -> Self {
        if !self.contains(Self::RESP_ERROR) {
            return self;
        }
        if cmd.check_index {
            self.difference(Self::RESP_ERROR) | Self::RESP_INDEX
        } else {
            self.difference(Self::RESP_ERROR)
        }
    }

    /// Returns true if any bit indicates a timeout on the command or data lines.
    pub fn is_timeout(&self) -> bool {
        self.intersects(
            Self::RESP_TIMEOUT
                | Self::DATA_TIMEOUT
                | Self::CARD_BUSY_TIMEOUT
                | Self::SOFTWARE_TIMEOUT,
        )
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Errors reported by the host controller.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoStaticStr)]
pub enum HostError {
    /// A request is already outstanding.
    Busy,
    /// No card present, or the controller is unpowered or suspended.
    NoMedium,
    /// Command or data lines were not released in time.
    BusTimeout,
    /// The data buffer cannot be described to the DMA engine.
    InvalidBuffer,
    /// A scatter segment violates the alignment or size constraints.
    Unaligned,
    /// The controller reported a protocol fault during the transfer.
    Protocol(ErrorFlags),
    /// No sample delay received the tuning pattern correctly.
    TuningFailed,
    /// The voltage switch precondition was not met; the caller may retry.
    RetryLater,
    /// The operation is not allowed by the capabilities or the current mode.
    Unsupported,
    /// A platform capability provider failed.
    Platform(DriverError),
}

impl HostError {
    /// Returns the taxonomy name of this error.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(flags) => write!(f, "Protocol({flags})"),
            Self::Platform(err) => write!(f, "Platform({err})"),
            other => f.write_str(other.name()),
        }
    }
}

impl From<DriverError> for HostError {
    fn from(err: DriverError) -> Self {
        Self::Platform(err)
    }
}

impl From<HostError> for DriverError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Busy => DriverError::ResourceBusy,
            HostError::NoMedium => DriverError::BadState,
            HostError::RetryLater => DriverError::WouldBlock,
            HostError::InvalidBuffer | HostError::Unaligned => DriverError::InvalidInput,
            HostError::Unsupported => DriverError::Unsupported,
            HostError::BusTimeout | HostError::Protocol(_) | HostError::TuningFailed => {
                DriverError::Io
            }
            HostError::Platform(err) => err,
        }
    }
}

/// A specialized `Result` type for host controller operations.
pub type HostResult<T = ()> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_status_classifies_into_flags() {
        let flags = ErrorFlags::from_raw(
            IntFlags::RESP_CRC_ERROR | IntFlags::DATA_TIMEOUT | IntFlags::COMMAND_DONE,
            IdmaInt::DESC_UNAVAILABLE,
        );
        assert_eq!(
            flags,
            ErrorFlags::RESP_CRC | ErrorFlags::DATA_TIMEOUT | ErrorFlags::DMA_DESC_UNAVAIL
        );
        assert!(flags.is_timeout());
    }

    #[test]
    fn response_error_follows_index_check() {
        use crate::request::ResponseKind;

        let raw = ErrorFlags::from_raw(
            IntFlags::RESP_ERROR | IntFlags::COMMAND_DONE,
            IdmaInt::empty(),
        );
        assert_eq!(raw, ErrorFlags::RESP_ERROR);

        let r1 = Command::new(13, 0, ResponseKind::Short);
        assert_eq!(raw.for_command(&r1), ErrorFlags::RESP_INDEX);
        let r3 = Command::new(41, 0, ResponseKind::Short).unchecked();
        assert!(raw.for_command(&r3).is_empty());
        assert_eq!(
            (raw | ErrorFlags::DATA_CRC).for_command(&r3),
            ErrorFlags::DATA_CRC
        );
        assert_eq!(ErrorFlags::RESP_CRC.for_command(&r1), ErrorFlags::RESP_CRC);
    }

    #[test]
    fn completion_bits_are_not_faults() {
        let flags = ErrorFlags::from_raw(
            IntFlags::COMMAND_DONE | IntFlags::DATA_OVER | IntFlags::AUTO_COMMAND_DONE,
            IdmaInt::RX_INT,
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn flags_display_names() {
        use std::string::ToString;

        let flags = ErrorFlags::START_BIT | ErrorFlags::END_BIT;
        assert_eq!(flags.to_string(), "START_BIT|END_BIT");
        assert_eq!(ErrorFlags::empty().to_string(), "NONE");
        assert_eq!(
            HostError::Protocol(ErrorFlags::DATA_CRC).to_string(),
            "Protocol(DATA_CRC)"
        );
    }

    #[test]
    fn host_error_maps_to_driver_error() {
        assert_eq!(DriverError::from(HostError::Busy), DriverError::ResourceBusy);
        assert_eq!(DriverError::from(HostError::RetryLater), DriverError::WouldBlock);
        assert_eq!(
            DriverError::from(HostError::Platform(DriverError::NoMemory)),
            DriverError::NoMemory
        );
        assert_eq!(HostError::Unaligned.name(), "Unaligned");
    }
}
