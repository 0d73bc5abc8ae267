// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Register map and bus adapter of the SD/MMC host controller.

use core::ptr::NonNull;

use strum::{EnumIter, IntoStaticStr};

/// Named controller registers, by byte offset from the register base.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, IntoStaticStr)]
pub enum Reg {
    /// Global control.
    Gctrl = 0x00,
    /// Card clock control.
    Clkcr = 0x04,
    /// Response/data timeout.
    Tmout = 0x08,
    /// Card bus width.
    Width = 0x0c,
    /// Block size.
    Blksz = 0x10,
    /// Total byte count.
    Bytecnt = 0x14,
    /// Command.
    Cmd = 0x18,
    /// Command argument.
    Arg = 0x1c,
    Resp0 = 0x20,
    Resp1 = 0x24,
    Resp2 = 0x28,
    Resp3 = 0x2c,
    /// Interrupt mask.
    Imask = 0x30,
    /// Masked interrupt status.
    Mista = 0x34,
    /// Raw interrupt status.
    Rintr = 0x38,
    Status = 0x3c,
    /// FIFO water level.
    Ftrgl = 0x40,
    /// Function select (SDIO).
    Funs = 0x44,
    /// Auto command 12 argument.
    A12a = 0x58,
    /// New timing set.
    Ntsr = 0x5c,
    /// Hardware reset (eMMC RST_n).
    Hwrst = 0x78,
    /// Internal DMA control.
    Dmac = 0x80,
    /// Descriptor list base address.
    Dlba = 0x84,
    /// IDMA status.
    Idst = 0x88,
    /// IDMA interrupt enable.
    Idie = 0x8c,
    /// Card threshold control.
    Thld = 0x100,
    /// Auto command 23 argument.
    A23a = 0x108,
    /// Output (drive) clock delay.
    DrvDl = 0x140,
    /// Sample clock delay.
    SampDl = 0x144,
}

impl Reg {
    /// Byte offset from the register base.
    pub const fn offset(self) -> usize {
        self as u32 as usize
    }

    /// Register name as used in dumps.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

bitflags::bitflags! {
    /// `GCTRL` bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct Gctrl: u32 {
        const SOFT_RESET  = 1 << 0;
        const FIFO_RESET  = 1 << 1;
        const DMA_RESET   = 1 << 2;
        const INT_ENABLE  = 1 << 4;
        const DMA_ENABLE  = 1 << 5;
        const DEBOUNCE_ENABLE = 1 << 8;
        const DDR_MODE    = 1 << 10;
        /// FIFO accessed by the CPU instead of the DMA engine.
        const ACCESS_BY_AHB = 1 << 31;

        const RESET_ALL = Self::SOFT_RESET.bits()
            | Self::FIFO_RESET.bits()
            | Self::DMA_RESET.bits();
        const RESET_XFER = Self::FIFO_RESET.bits() | Self::DMA_RESET.bits();
    }

    /// `CLKCR` bits. Bits 7:0 hold the internal card clock divider.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct Clkcr: u32 {
        const DIVIDER     = 0xff;
        const CARD_CLK_ON = 1 << 16;
        const LOW_POWER   = 1 << 17;
        const MASK_DATA0  = 1 << 31;
    }

    /// `CMD` bits. Bits 5:0 hold the opcode.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct CmdFlags: u32 {
        const OPCODE        = 0x3f;
        const RESP_EXPECT   = 1 << 6;
        const LONG_RESP     = 1 << 7;
        const CHECK_RESP_CRC = 1 << 8;
        const DATA_EXPECT   = 1 << 9;
        const WRITE         = 1 << 10;
        const STREAM_MODE   = 1 << 11;
        const SEND_AUTO_STOP = 1 << 12;
        const WAIT_PRE_OVER = 1 << 13;
        const STOP_ABORT    = 1 << 14;
        const SEND_INIT_SEQ = 1 << 15;
        const UPCLK_ONLY    = 1 << 21;
        const VOLTAGE_SWITCH = 1 << 28;
        const SEND_AUTO_SBC = 1 << 30;
        const START         = 1 << 31;
    }

    /// `RINTR`/`MISTA`/`IMASK` bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct IntFlags: u32 {
        const RESP_ERROR        = 1 << 1;
        const COMMAND_DONE      = 1 << 2;
        const DATA_OVER         = 1 << 3;
        const TX_DATA_REQUEST   = 1 << 4;
        const RX_DATA_REQUEST   = 1 << 5;
        const RESP_CRC_ERROR    = 1 << 6;
        const DATA_CRC_ERROR    = 1 << 7;
        const RESP_TIMEOUT      = 1 << 8;
        const DATA_TIMEOUT      = 1 << 9;
        const VOLTAGE_CHANGE_DONE = 1 << 10;
        const FIFO_RUN_ERROR    = 1 << 11;
        const HARDWARE_LOCKED   = 1 << 12;
        const START_BIT_ERROR   = 1 << 13;
        const AUTO_COMMAND_DONE = 1 << 14;
        const END_BIT_ERROR     = 1 << 15;
        const SDIO_INTERRUPT    = 1 << 16;
        const CARD_INSERT       = 1 << 30;
        const CARD_REMOVE       = 1 << 31;

        const ERRORS = Self::RESP_ERROR.bits()
            | Self::RESP_CRC_ERROR.bits()
            | Self::DATA_CRC_ERROR.bits()
            | Self::RESP_TIMEOUT.bits()
            | Self::DATA_TIMEOUT.bits()
            | Self::FIFO_RUN_ERROR.bits()
            | Self::HARDWARE_LOCKED.bits()
            | Self::START_BIT_ERROR.bits()
            | Self::END_BIT_ERROR.bits();
        const CARD_CHANGE = Self::CARD_INSERT.bits() | Self::CARD_REMOVE.bits();
    }

    /// `STATUS` bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct StatusFlags: u32 {
        const FIFO_EMPTY     = 1 << 2;
        const FIFO_FULL      = 1 << 3;
        /// DAT3 level, used as a presence signal.
        const CARD_PRESENT   = 1 << 8;
        /// DAT0 held low by the card.
        const CARD_DATA_BUSY = 1 << 9;
        const DATA_FSM_BUSY  = 1 << 10;
        const DAT0_LEVEL     = 1 << 20;
        const DAT1_LEVEL     = 1 << 21;
        const DAT2_LEVEL     = 1 << 22;
        const DAT3_LEVEL     = 1 << 23;

        const DAT_LEVELS = Self::DAT0_LEVEL.bits()
            | Self::DAT1_LEVEL.bits()
            | Self::DAT2_LEVEL.bits()
            | Self::DAT3_LEVEL.bits();
        const LINES_BUSY = Self::CARD_DATA_BUSY.bits() | Self::DATA_FSM_BUSY.bits();
    }

    /// `DMAC` bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct Dmac: u32 {
        const SOFT_RESET   = 1 << 0;
        const FIX_BURST    = 1 << 1;
        const IDMAC_ENABLE = 1 << 7;
        const REFETCH_DESC = 1 << 31;
    }

    /// `IDST`/`IDIE` bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct IdmaInt: u32 {
        const TX_INT           = 1 << 0;
        const RX_INT           = 1 << 1;
        const FATAL_BUS_ERROR  = 1 << 2;
        const DESC_UNAVAILABLE = 1 << 4;
        const CARD_ERROR_SUM   = 1 << 5;
        const NORMAL_SUM       = 1 << 8;
        const ABNORMAL_SUM     = 1 << 9;

        const DONE = Self::TX_INT.bits() | Self::RX_INT.bits();
        const ERRORS = Self::FATAL_BUS_ERROR.bits() | Self::DESC_UNAVAILABLE.bits();
        const ALL = 0x337;
    }

    /// `DRV_DL`/`SAMP_DL` bits. Bits 5:0 hold the delay step.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct DelayCtrl: u32 {
        const STEP   = 0x3f;
        const SW_ENABLE = 1 << 7;
    }
}

/// Card bus width encodings of the `WIDTH` register.
pub const WIDTH_1BIT: u32 = 0;
pub const WIDTH_4BIT: u32 = 1;
pub const WIDTH_8BIT: u32 = 2;

/// Default `TMOUT`: data timeout at maximum, response timeout of 0x40 cycles.
pub const TMOUT_DEFAULT: u32 = 0xffff_ff40;
/// Default `FTRGL`: burst size 8, RX trigger 7, TX trigger 8.
pub const FTRGL_DEFAULT: u32 = 0x2007_0008;
/// Largest delay step accepted by `DRV_DL` and `SAMP_DL`.
pub const MAX_DELAY_STEP: u8 = DelayCtrl::STEP.bits() as u8;

/// Atomic access to the controller's register file.
///
/// Every read and write is a single 32-bit access with no caching, so
/// the interrupt path and submission path may both use the same bus.
pub trait RegisterBus: Send + Sync {
    /// Reads a register.
    fn read(&self, reg: Reg) -> u32;

    /// Writes a register.
    fn write(&self, reg: Reg, val: u32);

    /// Physical (or bus) address of the register base, for diagnostics.
    fn base(&self) -> usize;

    /// Read-modify-write helper: sets `set` bits and clears `clear` bits.
    fn modify(&self, reg: Reg, clear: u32, set: u32) {
        let val = self.read(reg);
        self.write(reg, (val & !clear) | set);
    }
}

/// A [`RegisterBus`] backed by memory-mapped I/O.
pub struct MmioBus {
    base: NonNull<u8>,
}

unsafe impl Send for MmioBus {}
unsafe impl Sync for MmioBus {}

impl MmioBus {
    /// Creates a bus over the given mapped register base.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base` is a valid virtual address of the
    /// controller's register block, mapped as device memory, and that no
    /// other code drives the same controller.
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }
}

impl RegisterBus for MmioBus {
    #[inline]
    fn read(&self, reg: Reg) -> u32 {
        unsafe { self.base.add(reg.offset()).cast::<u32>().read_volatile() }
    }

    #[inline]
    fn write(&self, reg: Reg, val: u32) {
        unsafe { self.base.add(reg.offset()).cast::<u32>().write_volatile(val) }
    }

    fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn offsets_are_word_aligned_and_unique() {
        let offsets: std::vec::Vec<usize> = Reg::iter().map(Reg::offset).collect();
        for (i, off) in offsets.iter().enumerate() {
            assert_eq!(off % 4, 0, "{} misaligned", Reg::iter().nth(i).unwrap().name());
            assert!(!offsets[..i].contains(off));
        }
    }

    #[test]
    fn mmio_bus_accesses_offsets() {
        let mut file = [0u32; 0x200 / 4];
        let bus = unsafe { MmioBus::new(NonNull::new(file.as_mut_ptr().cast()).unwrap()) };
        bus.write(Reg::Arg, 0xdead_beef);
        bus.modify(Reg::Clkcr, 0, Clkcr::CARD_CLK_ON.bits());
        assert_eq!(bus.read(Reg::Arg), 0xdead_beef);
        assert_eq!(file[Reg::Arg.offset() / 4], 0xdead_beef);
        assert_eq!(file[Reg::Clkcr.offset() / 4], Clkcr::CARD_CLK_ON.bits());
    }

    #[test]
    fn error_mask_matches_controller_layout() {
        assert_eq!(IntFlags::ERRORS.bits(), 0xbbc2);
    }
}
