//! Transfer Request Block (TRB) and per-endpoint descriptor ring
//!
//! A TRB is four little-endian words shared with the DMA engine:
//! buffer pointer low/high, size/status, control. Ownership is carried by
//! the HWO bit of the control word: software fills a TRB, then hands it off
//! (sets HWO, cleans the cache line); the controller clears HWO and writes
//! the remaining byte count when it is done, and software reclaims it
//! (invalidates, reads size/status).
//!
//! Non-control endpoints use a ring of [`RING_DEPTH`] data TRBs closed by a
//! link TRB whose HWO bit is permanently set and which points back at slot 0.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::dma::Platform;
use crate::error::{Result, UsbError};

/// Data TRBs per ring
pub const RING_DEPTH: usize = 8;

/// TRBs per ring including the link TRB
pub const RING_SLOTS: usize = RING_DEPTH + 1;

/// Largest length a TRB can describe
pub const TRB_MAX_LENGTH: u32 = 0x00FF_FFFF;

bitflags! {
    /// TRB control word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrbControl: u32 {
        /// Hardware owns the TRB
        const HWO = 1 << 0;
        /// Last TRB of the transfer
        const LST = 1 << 1;
        /// Chained to the next TRB
        const CHN = 1 << 2;
        /// Continue on short packet
        const CSP = 1 << 3;
        /// TRB type field
        const TRBCTL_MASK = 0x3F << 4;
        /// Interrupt on short packet / missed isoc
        const ISP_IMI = 1 << 10;
        /// Interrupt on completion
        const IOC = 1 << 11;

        const _ = !0;
    }
}

impl TrbControl {
    /// Control word with the type field set
    pub const fn with_type(self, ty: TrbType) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::TRBCTL_MASK.bits()) | ((ty as u32) << 4),
        )
    }

    /// Decode the type field
    pub const fn trb_type(self) -> Option<TrbType> {
        TrbType::from_bits((self.bits() >> 4) & 0x3F)
    }
}

/// TRB types (control word TRBCTL field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TrbType {
    /// Normal data
    Normal = 1,
    /// Control setup stage
    ControlSetup = 2,
    /// Control status stage of a two-stage transfer
    ControlStatus2 = 3,
    /// Control status stage of a three-stage transfer
    ControlStatus3 = 4,
    /// Control data stage
    ControlData = 5,
    /// First isochronous TRB of a service interval
    IsochronousFirst = 6,
    /// Isochronous
    Isochronous = 7,
    /// Link to another TRB
    Link = 8,
    /// Normal, terminates with a zero-length packet
    NormalZlp = 9,
}

impl TrbType {
    /// Decode a TRBCTL value
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            1 => Self::Normal,
            2 => Self::ControlSetup,
            3 => Self::ControlStatus2,
            4 => Self::ControlStatus3,
            5 => Self::ControlData,
            6 => Self::IsochronousFirst,
            7 => Self::Isochronous,
            8 => Self::Link,
            9 => Self::NormalZlp,
            _ => return None,
        })
    }
}

/// TRB completion status (size word bits 31:28)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrbStatus {
    /// Completed
    Ok,
    /// Isochronous interval missed
    MissedIsoc,
    /// A new SETUP arrived while this control TRB was pending
    SetupPending,
    /// Transfer still in progress
    InProgress,
    /// Reserved encoding
    Other(u8),
}

impl TrbStatus {
    /// Decode the status field of a size word
    pub const fn from_size_word(size: u32) -> Self {
        match (size >> 28) & 0xF {
            0 => Self::Ok,
            1 => Self::MissedIsoc,
            2 => Self::SetupPending,
            4 => Self::InProgress,
            other => Self::Other(other as u8),
        }
    }
}

/// What the controller reported for a reclaimed TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrbCompletion {
    /// Bytes not transferred
    pub remaining: u32,
    /// Completion status
    pub status: TrbStatus,
}

/// Transfer Request Block
#[repr(C, align(16))]
pub struct Trb {
    /// Buffer pointer, low word
    pub buf_ptr_low: AtomicU32,
    /// Buffer pointer, high word
    pub buf_ptr_high: AtomicU32,
    /// Length (23:0), PCM1 (25:24), status (31:28)
    pub size: AtomicU32,
    /// Control word
    pub ctrl: AtomicU32,
}

const _: () = {
    assert!(core::mem::size_of::<Trb>() == 16);
};

impl Trb {
    /// Size of one TRB in bytes
    pub const SIZE: usize = 16;

    /// Zeroed, software-owned TRB
    pub const fn new() -> Self {
        Self {
            buf_ptr_low: AtomicU32::new(0),
            buf_ptr_high: AtomicU32::new(0),
            size: AtomicU32::new(0),
            ctrl: AtomicU32::new(0),
        }
    }

    /// CPU address of the TRB
    #[inline]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Control word
    #[inline]
    pub fn control(&self) -> TrbControl {
        TrbControl::from_bits_retain(self.ctrl.load(Ordering::Acquire))
    }

    /// Hardware currently owns the TRB
    #[inline]
    pub fn is_hardware_owned(&self) -> bool {
        self.control().contains(TrbControl::HWO)
    }

    /// Type field
    pub fn trb_type(&self) -> Option<TrbType> {
        self.control().trb_type()
    }

    /// Length field
    pub fn length(&self) -> u32 {
        self.size.load(Ordering::Acquire) & TRB_MAX_LENGTH
    }

    /// Fill a software-owned TRB; HWO stays clear until [`Trb::hand_off`]
    pub fn prepare(
        &self,
        global_addr: u32,
        len: u32,
        ty: TrbType,
        flags: TrbControl,
    ) -> Result<()> {
        if self.is_hardware_owned() {
            return Err(UsbError::RingFull);
        }
        if len > TRB_MAX_LENGTH {
            return Err(UsbError::InvalidLength);
        }

        self.buf_ptr_low.store(global_addr, Ordering::Relaxed);
        self.buf_ptr_high.store(0, Ordering::Relaxed);
        self.size.store(len, Ordering::Relaxed);
        let ctrl = flags.difference(TrbControl::HWO).with_type(ty);
        self.ctrl.store(ctrl.bits(), Ordering::Release);
        Ok(())
    }

    /// Give the TRB to the controller
    pub fn hand_off<P: Platform + ?Sized>(&self, platform: &mut P) {
        self.ctrl.fetch_or(TrbControl::HWO.bits(), Ordering::Release);
        platform.clean_dcache(self.addr(), Self::SIZE);
    }

    /// Take the TRB back after the controller reported completion
    pub fn reclaim<P: Platform + ?Sized>(&self, platform: &mut P) -> TrbCompletion {
        platform.invalidate_dcache(self.addr(), Self::SIZE);
        let size = self.size.load(Ordering::Acquire);
        TrbCompletion {
            remaining: size & TRB_MAX_LENGTH,
            status: TrbStatus::from_size_word(size),
        }
    }

    /// Drop hardware ownership without a completion
    pub fn release<P: Platform + ?Sized>(&self, platform: &mut P) {
        self.ctrl.fetch_and(!TrbControl::HWO.bits(), Ordering::Release);
        platform.clean_dcache(self.addr(), Self::SIZE);
    }

    /// Zero every word
    pub fn clear(&self) {
        self.buf_ptr_low.store(0, Ordering::Relaxed);
        self.buf_ptr_high.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.ctrl.store(0, Ordering::Release);
    }
}

impl Default for Trb {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor ring storage of one endpoint
#[repr(C, align(32))]
pub struct TrbRing {
    slots: [Trb; RING_SLOTS],
}

impl TrbRing {
    /// Zeroed ring
    pub const fn new() -> Self {
        Self { slots: [const { Trb::new() }; RING_SLOTS] }
    }

    /// Data TRB `index` (0..RING_DEPTH)
    pub fn slot(&self, index: usize) -> &Trb {
        &self.slots[index % RING_DEPTH]
    }

    /// The link TRB closing the ring
    pub fn link(&self) -> &Trb {
        &self.slots[RING_DEPTH]
    }

    /// Address of slot 0
    pub fn addr(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Zero the data TRBs and install the link TRB
    pub fn reset<P: Platform + ?Sized>(&self, platform: &mut P) {
        for trb in &self.slots[..RING_DEPTH] {
            trb.clear();
        }

        let link = self.link();
        link.buf_ptr_low
            .store(platform.to_global(self.addr()), Ordering::Relaxed);
        link.buf_ptr_high.store(0, Ordering::Relaxed);
        link.size.store(0, Ordering::Relaxed);
        link.ctrl.store(
            TrbControl::HWO.with_type(TrbType::Link).bits(),
            Ordering::Release,
        );

        platform.clean_dcache(self.addr(), RING_SLOTS * Trb::SIZE);
    }
}

impl Default for TrbRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Software cursors over a [`TrbRing`]
///
/// `enqueue` is the next slot to fill, `dequeue` the oldest slot the
/// controller has not reported yet. Both only move forward, modulo
/// [`RING_DEPTH`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RingCursor {
    enqueue: u8,
    dequeue: u8,
    in_flight: u8,
}

impl RingCursor {
    /// Both cursors at slot 0, nothing in flight
    pub const fn new() -> Self {
        Self { enqueue: 0, dequeue: 0, in_flight: 0 }
    }

    /// Next slot to fill
    pub const fn enqueue(&self) -> usize {
        self.enqueue as usize
    }

    /// Oldest outstanding slot
    pub const fn dequeue(&self) -> usize {
        self.dequeue as usize
    }

    /// TRBs handed to hardware and not yet completed
    pub const fn in_flight(&self) -> usize {
        self.in_flight as usize
    }

    /// No free data slot
    pub const fn is_full(&self) -> bool {
        self.in_flight as usize == RING_DEPTH
    }

    /// Claim the enqueue slot and advance
    pub fn push(&mut self) -> Result<usize> {
        if self.is_full() {
            return Err(UsbError::RingFull);
        }
        let slot = self.enqueue as usize;
        self.enqueue = ((slot + 1) % RING_DEPTH) as u8;
        self.in_flight += 1;
        Ok(slot)
    }

    /// Give back the most recently claimed slot (submission failed)
    pub fn unpush(&mut self) {
        if self.in_flight == 0 {
            return;
        }
        self.enqueue = ((self.enqueue as usize + RING_DEPTH - 1) % RING_DEPTH) as u8;
        self.in_flight -= 1;
    }

    /// Retire the dequeue slot and advance
    pub fn pop(&mut self) -> Option<usize> {
        if self.in_flight == 0 {
            return None;
        }
        let slot = self.dequeue as usize;
        self.dequeue = ((slot + 1) % RING_DEPTH) as u8;
        self.in_flight -= 1;
        Some(slot)
    }

    /// Back to slot 0 with nothing in flight
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
