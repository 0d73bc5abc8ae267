// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Internal DMA descriptor chains.

use alloc::{boxed::Box, vec};
use core::sync::atomic::{Ordering, fence};

use crate::error::{HostError, HostResult};

/// Transfer granularity of the DMA engine in bytes.
pub const DMA_ALIGN: usize = 4;
/// Largest length a descriptor can encode (a zero length field means this).
pub const DESC_MAX_LEN: usize = 1 << 16;

bitflags::bitflags! {
    /// Attribute half-word of a descriptor.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct DescAttr: u16 {
        const VALID = 1 << 0;
        /// Last descriptor of the chain.
        const END   = 1 << 1;
        /// Raise the DMA-done interrupt once this descriptor completes.
        const INT   = 1 << 2;
        const ACT   = 0b11 << 4;
    }
}

/// Action encoded in bits 5:4 of the attribute.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DescAction {
    Nop,
    Transfer,
    Link,
}

impl DescAction {
    const fn bits(self) -> u16 {
        match self {
            Self::Nop => 0b00 << 4,
            Self::Transfer => 0b10 << 4,
            Self::Link => 0b11 << 4,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match (bits >> 4) & 0b11 {
            0b10 => Self::Transfer,
            0b11 => Self::Link,
            _ => Self::Nop,
        }
    }
}

/// One hardware descriptor as laid out in the descriptor ring.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct IdmaDesc {
    attr: u16,
    len: u16,
    addr: u32,
}

impl IdmaDesc {
    fn transfer(addr: u32, len: usize, last: bool) -> Self {
        let mut attr = DescAttr::VALID.bits() | DescAction::Transfer.bits();
        if last {
            attr |= (DescAttr::END | DescAttr::INT).bits();
        }
        Self {
            attr,
            // 64 KiB is encoded as zero.
            len: (len % DESC_MAX_LEN) as u16,
            addr,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(DescAttr::VALID)
    }

    pub fn is_end(&self) -> bool {
        self.flags().contains(DescAttr::END)
    }

    pub fn interrupts(&self) -> bool {
        self.flags().contains(DescAttr::INT)
    }

    pub fn action(&self) -> DescAction {
        DescAction::from_bits(self.attr)
    }

    pub fn len(&self) -> usize {
        match self.len {
            0 if self.is_valid() => DESC_MAX_LEN,
            n => n as usize,
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    fn flags(&self) -> DescAttr {
        DescAttr::from_bits_truncate(self.attr)
    }
}

/// A DMA-mapped buffer segment of a request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScatterSegment {
    /// Bus address of the segment.
    pub addr: u64,
    pub len: usize,
}

impl ScatterSegment {
    pub const fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }
}

fn check_segment(seg: &ScatterSegment, max_len: usize) -> HostResult {
    if seg.addr % DMA_ALIGN as u64 != 0 || seg.len % DMA_ALIGN != 0 {
        return Err(HostError::Unaligned);
    }
    if seg.len == 0 || seg.len > max_len {
        return Err(HostError::Unaligned);
    }
    if seg.addr.saturating_add(seg.len as u64) > u32::MAX as u64 + 1 {
        // Outside the engine's 32-bit address window.
        return Err(HostError::InvalidBuffer);
    }
    Ok(())
}

/// Writes the chain describing `segs` into `out` and returns its length.
///
/// Every segment is validated before the first descriptor is written, so a
/// failed build leaves `out` untouched.
pub fn build_chain(
    segs: &[ScatterSegment],
    max_len: usize,
    out: &mut [IdmaDesc],
) -> HostResult<usize> {
    if segs.is_empty() || segs.len() > out.len() {
        return Err(HostError::InvalidBuffer);
    }
    let max_len = max_len.min(DESC_MAX_LEN);
    segs.iter().try_for_each(|seg| check_segment(seg, max_len))?;

    let last = segs.len() - 1;
    for (i, (seg, desc)) in segs.iter().zip(out.iter_mut()).enumerate() {
        *desc = IdmaDesc::transfer(seg.addr as u32, seg.len, i == last);
    }
    Ok(segs.len())
}

/// A built chain, valid until the ring is released.
#[derive(Debug)]
pub struct DescriptorChain<'a> {
    descs: &'a [IdmaDesc],
    bus_addr: u64,
}

impl DescriptorChain<'_> {
    /// Bus address of the first descriptor.
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn descriptors(&self) -> &[IdmaDesc] {
        self.descs
    }

    /// Sum of all descriptor lengths.
    pub fn total_len(&self) -> usize {
        self.descs.iter().map(IdmaDesc::len).sum()
    }
}

/// Descriptor memory reserved once at attach and reused by every request.
pub struct DescriptorRing {
    descs: Box<[IdmaDesc]>,
    in_use: usize,
    max_seg: usize,
}

impl DescriptorRing {
    /// Reserves a ring of `capacity` descriptors.
    pub fn new(capacity: usize, max_seg: usize) -> Self {
        Self {
            descs: vec![IdmaDesc::default(); capacity].into_boxed_slice(),
            in_use: 0,
            max_seg,
        }
    }

    pub fn capacity(&self) -> usize {
        self.descs.len()
    }

    /// CPU address of the ring, for bus address translation.
    pub fn vaddr(&self) -> usize {
        self.descs.as_ptr() as usize
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Builds the chain for `segs` into the ring.
    ///
    /// Fails with [`HostError::Busy`] if the previous chain is still owned
    /// by an outstanding request.
    pub fn build(
        &mut self,
        segs: &[ScatterSegment],
        bus_addr: u64,
    ) -> HostResult<DescriptorChain<'_>> {
        if self.in_use != 0 {
            return Err(HostError::Busy);
        }
        let n = build_chain(segs, self.max_seg, &mut self.descs)?;
        // Descriptors must be visible to the engine before the doorbell.
        fence(Ordering::Release);
        self.in_use = n;
        Ok(DescriptorChain {
            descs: &self.descs[..n],
            bus_addr,
        })
    }

    /// Tears down the current chain once the engine is done with it.
    pub fn release(&mut self) {
        self.descs[..self.in_use].fill(IdmaDesc::default());
        self.in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 32 * 1024;

    #[test]
    fn single_segment_is_terminal() {
        let mut out = [IdmaDesc::default(); 4];
        let n = build_chain(&[ScatterSegment::new(0x4000_0000, 512)], MAX, &mut out).unwrap();
        assert_eq!(n, 1);
        let d = out[0];
        assert!(d.is_valid() && d.is_end() && d.interrupts());
        assert_eq!(d.action(), DescAction::Transfer);
        assert_eq!((d.addr(), d.len()), (0x4000_0000, 512));
    }

    #[test]
    fn only_last_descriptor_ends_chain() {
        let segs: std::vec::Vec<_> = (0..5u64)
            .map(|i| ScatterSegment::new(0x1000 * (i + 1), 512 * (i as usize + 1)))
            .collect();
        let mut ring = DescriptorRing::new(8, MAX);
        let chain = ring.build(&segs, 0x8000_0000).unwrap();
        let descs = chain.descriptors();
        assert_eq!(descs.len(), 5);
        for d in &descs[..4] {
            assert!(d.is_valid() && !d.is_end() && !d.interrupts());
        }
        assert!(descs[4].is_end() && descs[4].interrupts());
        let expect: usize = segs.iter().map(|s| s.len).sum();
        assert_eq!(chain.total_len(), expect);
        assert_eq!(chain.bus_addr(), 0x8000_0000);
    }

    #[test]
    fn misaligned_or_oversized_segments_are_rejected_without_writes() {
        let bad = [
            [ScatterSegment::new(0x1000, 512), ScatterSegment::new(0x2002, 512)],
            [ScatterSegment::new(0x1000, 512), ScatterSegment::new(0x2000, 510)],
            [ScatterSegment::new(0x1000, 512), ScatterSegment::new(0x2000, MAX + 4)],
            [ScatterSegment::new(0x1000, 512), ScatterSegment::new(0x2000, 0)],
        ];
        for segs in bad {
            let mut out = [IdmaDesc::default(); 4];
            assert_eq!(build_chain(&segs, MAX, &mut out), Err(HostError::Unaligned));
            assert!(out.iter().all(|d| *d == IdmaDesc::default()));
        }
    }

    #[test]
    fn degenerate_lists_are_invalid() {
        let mut out = [IdmaDesc::default(); 2];
        assert_eq!(build_chain(&[], MAX, &mut out), Err(HostError::InvalidBuffer));
        let segs = [ScatterSegment::new(0x1000, 4); 3];
        assert_eq!(build_chain(&segs, MAX, &mut out), Err(HostError::InvalidBuffer));
        let high = [ScatterSegment::new(0x1_0000_0000, 512)];
        assert_eq!(build_chain(&high, MAX, &mut out), Err(HostError::InvalidBuffer));
    }

    #[test]
    fn full_64k_segment_encodes_as_zero() {
        let mut out = [IdmaDesc::default(); 1];
        build_chain(&[ScatterSegment::new(0, DESC_MAX_LEN)], DESC_MAX_LEN, &mut out).unwrap();
        assert_eq!(out[0].len, 0);
        assert_eq!(out[0].len(), DESC_MAX_LEN);
    }

    #[test]
    fn ring_is_exclusive_until_released() {
        let mut ring = DescriptorRing::new(2, MAX);
        let seg = [ScatterSegment::new(0x1000, 512)];
        ring.build(&seg, 0).unwrap();
        assert_eq!(ring.in_use(), 1);
        assert_eq!(ring.build(&seg, 0).err(), Some(HostError::Busy));
        ring.release();
        assert_eq!(ring.in_use(), 0);
        assert!(ring.build(&seg, 0).is_ok());
    }
}
