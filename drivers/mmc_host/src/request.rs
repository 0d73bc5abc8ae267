// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Requests submitted to the host and their completions.

use alloc::vec::Vec;

use crate::{
    error::{ErrorFlags, HostResult},
    idma::ScatterSegment,
};

/// Opcode of STOP_TRANSMISSION, sent by the controller for auto-stop.
pub const MMC_STOP_TRANSMISSION: u8 = 12;
/// Opcode of SEND_TUNING_BLOCK (SD, 4-bit pattern).
pub const MMC_SEND_TUNING_BLOCK: u8 = 19;
/// Opcode of SEND_TUNING_BLOCK_HS200 (eMMC, 8-bit pattern).
pub const MMC_SEND_TUNING_BLOCK_HS200: u8 = 21;

/// Shape of the response a command expects.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseKind {
    None,
    /// 48-bit response (R1, R3, R6, R7).
    Short,
    /// 48-bit response followed by DAT0 busy signalling (R1b).
    ShortBusy,
    /// 136-bit response (R2).
    Long,
}

/// A bus command.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Command {
    pub opcode: u8,
    pub arg: u32,
    pub resp: ResponseKind,
    pub check_crc: bool,
    pub check_index: bool,
}

impl Command {
    /// Creates a command with the integrity checks usual for `resp`.
    pub const fn new(opcode: u8, arg: u32, resp: ResponseKind) -> Self {
        let (check_crc, check_index) = match resp {
            ResponseKind::None => (false, false),
            ResponseKind::Short | ResponseKind::ShortBusy => (true, true),
            ResponseKind::Long => (true, false),
        };
        Self {
            opcode,
            arg,
            resp,
            check_crc,
            check_index,
        }
    }

    /// Disables CRC and index checks (R3/R4 responses).
    pub const fn unchecked(mut self) -> Self {
        self.check_crc = false;
        self.check_index = false;
        self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataDirection {
    Read,
    Write,
}

/// Data phase of a request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Data {
    pub direction: DataDirection,
    pub block_size: u32,
    pub block_count: u32,
    /// DMA-mapped buffers, in transfer order.
    pub segments: Vec<ScatterSegment>,
}

impl Data {
    pub fn new(
        direction: DataDirection,
        block_size: u32,
        block_count: u32,
        segments: Vec<ScatterSegment>,
    ) -> Self {
        Self {
            direction,
            block_size,
            block_count,
            segments,
        }
    }

    /// Bytes moved by a complete transfer.
    pub fn total_bytes(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    /// Bytes covered by the scatter list.
    pub fn mapped_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }
}

/// Subcommand the controller issues on its own around the data phase.
///
/// Being a single enum, auto-stop and auto-set-block-count can never be
/// armed together.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AutoCommand {
    /// CMD12 after the last block, with the given argument.
    Stop { arg: u32 },
    /// CMD23 with the block count before the data command.
    SetBlockCount,
}

/// A command plus optional data phase, owned by the host while outstanding.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub cmd: Command,
    pub data: Option<Data>,
    pub auto: Option<AutoCommand>,
}

impl Request {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            data: None,
            auto: None,
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_auto(mut self, auto: AutoCommand) -> Self {
        self.auto = Some(auto);
        self
    }

    /// Returns true for the tuning block reads issued during a sweep.
    pub fn is_tuning_read(&self) -> bool {
        matches!(
            self.cmd.opcode,
            MMC_SEND_TUNING_BLOCK | MMC_SEND_TUNING_BLOCK_HS200
        ) && self
            .data
            .as_ref()
            .is_some_and(|d| d.direction == DataDirection::Read)
    }

    /// Returns true for multi-block transfers.
    pub fn is_multi_block(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.block_count > 1)
    }
}

/// Response payload read back from the controller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Response {
    None,
    Short(u32),
    /// Bits 127:0 of an R2 response, most significant word first.
    Long([u32; 4]),
}

/// A request handed back to its submitter, exactly once.
#[derive(Debug)]
pub struct CompletedRequest {
    pub request: Request,
    pub result: HostResult<Response>,
    /// Bytes moved by the data phase; zero on failure.
    pub bytes_transferred: usize,
    /// Raw fault bits seen while the request was outstanding.
    pub error_flags: ErrorFlags,
}

impl CompletedRequest {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Reassembles a 136-bit response from the raw `RESP0..RESP3` words.
///
/// The controller strips the CRC byte, so the registers hold response bits
/// 127:8 shifted down by one byte. Each output word takes its register
/// shifted up one byte plus the top byte of the next lower register.
pub const fn reassemble_long(raw: [u32; 4]) -> [u32; 4] {
    let [r0, r1, r2, r3] = raw;
    [
        (r3 << 8) | (r2 >> 24),
        (r2 << 8) | (r1 >> 24),
        (r1 << 8) | (r0 >> 24),
        r0 << 8,
    ]
}
