//! DMA memory and cache coherency
//!
//! The controller reads descriptors and data buffers and writes event words,
//! setup packets and descriptor status straight to memory. Every boundary
//! between the CPU and the DMA engine is crossed with one of two operations:
//!
//! - **hand off**: clean the data cache over the range so the controller sees
//!   the committed bytes, then give the memory to hardware
//! - **reclaim**: invalidate the range so the CPU re-reads what the
//!   controller wrote
//!
//! Both live on [`Platform`], together with local-to-global address
//! translation and the busy-wait primitive.

use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use embedded_hal::delay::DelayNs;

use crate::dwc3::trb::{Trb, TrbRing};
use crate::dwc3::MAX_PHYSICAL_ENDPOINTS;

/// Data cache line size (Cortex-M7 / Cortex-M55)
pub const CACHE_LINE_SIZE: usize = 32;

/// Event buffer size in bytes
pub const EVENT_BUFFER_SIZE: usize = 4096;

/// Event buffer size in 32-bit event words
pub const EVENT_BUFFER_WORDS: usize = EVENT_BUFFER_SIZE / 4;

/// Scratchpad handed to the core through the generic command interface
pub const SCRATCHPAD_SIZE: usize = 4096;

const SCRATCHPAD_WORDS: usize = SCRATCHPAD_SIZE / 4;

/// Platform services the driver needs besides the register block
///
/// Implemented by [`CortexMPlatform`] on target and by recording fakes in
/// tests.
pub trait Platform: DelayNs {
    /// Write dirty cache lines covering `addr..addr + len` back to memory
    fn clean_dcache(&mut self, addr: usize, len: usize);

    /// Discard cache lines covering `addr..addr + len`
    fn invalidate_dcache(&mut self, addr: usize, len: usize);

    /// Translate a CPU-local address to the address the DMA master uses
    fn to_global(&self, addr: usize) -> u32;
}

/// Check cache line alignment
#[inline(always)]
pub const fn is_cache_aligned(addr: usize) -> bool {
    addr & (CACHE_LINE_SIZE - 1) == 0
}

/// One window of CPU-private memory that the DMA master sees elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAlias {
    /// Start of the window as seen by the CPU
    pub local_start: usize,
    /// Window length in bytes
    pub len: usize,
    /// Start of the window on the system bus
    pub global_start: u32,
}

impl AddressAlias {
    /// Create an alias window
    pub const fn new(local_start: usize, len: usize, global_start: u32) -> Self {
        Self { local_start, len, global_start }
    }

    const fn contains(&self, addr: usize) -> bool {
        addr >= self.local_start && addr - self.local_start < self.len
    }
}

/// Translate `addr` through an alias table, identity when no window matches
pub fn translate(aliases: &[AddressAlias], addr: usize) -> u32 {
    aliases
        .iter()
        .find(|alias| alias.contains(addr))
        .map(|alias| alias.global_start.wrapping_add((addr - alias.local_start) as u32))
        .unwrap_or(addr as u32)
}

/// Cache-line aligned wrapper
#[repr(C, align(32))]
pub struct CacheAligned<T>(T);

impl<T> CacheAligned<T> {
    /// Wrap a value
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// All memory shared with the controller's DMA engine
///
/// Contents are atomics so the region can be shared with hardware through
/// `&self`; it is meant to be placed in a `static`:
///
/// ```ignore
/// #[link_section = ".bss.usb_dma"]
/// static USB_DMA: DmaRegion = DmaRegion::new();
/// ```
#[repr(C, align(32))]
pub struct DmaRegion {
    events: CacheAligned<[AtomicU32; EVENT_BUFFER_WORDS]>,
    scratchpad: CacheAligned<[AtomicU32; SCRATCHPAD_WORDS]>,
    setup: CacheAligned<[AtomicU32; 2]>,
    ep0_trb: CacheAligned<Trb>,
    rings: [TrbRing; MAX_PHYSICAL_ENDPOINTS],
}

const _: () = {
    assert!(core::mem::align_of::<DmaRegion>() == CACHE_LINE_SIZE);
    assert!(core::mem::align_of::<CacheAligned<Trb>>() == CACHE_LINE_SIZE);
    assert!(EVENT_BUFFER_SIZE % CACHE_LINE_SIZE == 0);
    assert!(EVENT_BUFFER_SIZE <= 0xFFFF);
};

impl DmaRegion {
    /// Zeroed region
    pub const fn new() -> Self {
        Self {
            events: CacheAligned::new([const { AtomicU32::new(0) }; EVENT_BUFFER_WORDS]),
            scratchpad: CacheAligned::new([const { AtomicU32::new(0) }; SCRATCHPAD_WORDS]),
            setup: CacheAligned::new([const { AtomicU32::new(0) }; 2]),
            ep0_trb: CacheAligned::new(Trb::new()),
            rings: [const { TrbRing::new() }; MAX_PHYSICAL_ENDPOINTS],
        }
    }

    /// Event buffer words
    pub fn events(&self) -> &[AtomicU32] {
        &self.events[..]
    }

    /// Address of the event buffer
    pub fn events_addr(&self) -> usize {
        self.events.as_ptr() as usize
    }

    /// Zero the event buffer
    pub(crate) fn clear_events(&self) {
        for word in self.events.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Address of the scratchpad
    pub fn scratchpad_addr(&self) -> usize {
        self.scratchpad.as_ptr() as usize
    }

    /// The 8-byte setup packet buffer, as two little-endian words
    pub fn setup_words(&self) -> &[AtomicU32; 2] {
        &self.setup
    }

    /// Address of the setup packet buffer
    pub fn setup_addr(&self) -> usize {
        self.setup.as_ptr() as usize
    }

    /// Raw setup packet bytes
    pub fn setup_bytes(&self) -> [u8; 8] {
        let lo = self.setup[0].load(Ordering::Acquire).to_le_bytes();
        let hi = self.setup[1].load(Ordering::Acquire).to_le_bytes();
        [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]]
    }

    /// Descriptor shared by EP0 OUT and EP0 IN
    pub fn ep0_trb(&self) -> &Trb {
        &self.ep0_trb
    }

    /// Descriptor ring of a physical endpoint
    ///
    /// Rings exist for every index; the two control endpoints never use theirs.
    pub fn ring(&self, phy: usize) -> &TrbRing {
        &self.rings[phy]
    }
}

impl Default for DmaRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-owned transfer buffer
///
/// The driver only records the address; the caller keeps the memory alive and
/// untouched until the completion callback for the transfer has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the handle is an address and a length; access goes through unsafe fns.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Wrap a buffer that lives for the rest of the program
    pub fn from_static(buffer: &'static mut [u8]) -> Self {
        let len = buffer.len();
        // A slice pointer is never null, even for an empty slice
        let ptr = NonNull::from(buffer).cast::<u8>();
        Self { ptr, len }
    }

    /// Wrap raw memory
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid, DMA-reachable memory for as long as
    /// any transfer using this handle is in flight.
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Buffer address as seen by the CPU
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Capacity in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the buffer contents
    ///
    /// # Safety
    ///
    /// No transfer using this buffer may be in flight.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: validity guaranteed by the constructor contract
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the buffer contents
    ///
    /// # Safety
    ///
    /// No transfer using this buffer may be in flight and no other view may exist.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: validity and exclusivity guaranteed by the caller
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Give the first `len` bytes to the controller
    pub fn hand_off<P: Platform + ?Sized>(&self, platform: &mut P, len: usize) {
        platform.clean_dcache(self.addr(), len.min(self.len));
    }

    /// Take the first `len` bytes back after the controller wrote them
    pub fn reclaim<P: Platform + ?Sized>(&self, platform: &mut P, len: usize) {
        platform.invalidate_dcache(self.addr(), len.min(self.len));
    }
}

/// Cache maintenance by address through the SCB
#[cfg(target_arch = "arm")]
pub mod cache_ops {
    use super::CACHE_LINE_SIZE;
    use cortex_m::asm::{dsb, isb};

    const SCB_DCIMVAC: *mut u32 = 0xE000_EF5C as *mut u32; // Invalidate by MVA to PoC
    const SCB_DCCMVAC: *mut u32 = 0xE000_EF68 as *mut u32; // Clean by MVA to PoC

    fn for_each_line(addr: usize, size: usize, op: *mut u32) {
        if size == 0 {
            return;
        }
        let start = addr & !(CACHE_LINE_SIZE - 1);
        let end = (addr + size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        dsb();
        for line_addr in (start..end).step_by(CACHE_LINE_SIZE) {
            // SAFETY: SCB maintenance registers are always mapped on ARMv7-M/v8-M
            unsafe { core::ptr::write_volatile(op, line_addr as u32) };
        }
        dsb();
        isb();
    }

    /// Clean data cache lines covering the range
    pub fn clean_dcache(addr: usize, size: usize) {
        for_each_line(addr, size, SCB_DCCMVAC);
    }

    /// Invalidate data cache lines covering the range
    pub fn invalidate_dcache(addr: usize, size: usize) {
        for_each_line(addr, size, SCB_DCIMVAC);
    }
}

/// Cortex-M platform: SCB cache maintenance, alias-table address
/// translation, cycle-counted delays
#[cfg(target_arch = "arm")]
pub struct CortexMPlatform {
    cpu_hz: u32,
    aliases: &'static [AddressAlias],
}

#[cfg(target_arch = "arm")]
impl CortexMPlatform {
    /// Create the platform for a core clocked at `cpu_hz`
    pub const fn new(cpu_hz: u32, aliases: &'static [AddressAlias]) -> Self {
        Self { cpu_hz, aliases }
    }
}

#[cfg(target_arch = "arm")]
impl DelayNs for CortexMPlatform {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = (u64::from(ns) * u64::from(self.cpu_hz)) / 1_000_000_000;
        cortex_m::asm::delay(cycles.clamp(1, u64::from(u32::MAX)) as u32);
    }
}

#[cfg(target_arch = "arm")]
impl Platform for CortexMPlatform {
    fn clean_dcache(&mut self, addr: usize, len: usize) {
        cache_ops::clean_dcache(addr, len);
    }

    fn invalidate_dcache(&mut self, addr: usize, len: usize) {
        cache_ops::invalidate_dcache(addr, len);
    }

    fn to_global(&self, addr: usize) -> u32 {
        translate(self.aliases, addr)
    }
}
