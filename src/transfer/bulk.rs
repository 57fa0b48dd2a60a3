//! Bulk and interrupt transfers
//!
//! Each non-control endpoint owns a [`TrbRing`](crate::dwc3::TrbRing). A
//! submission fills the enqueue slot and either starts the transfer (endpoint
//! idle) or updates the running one with the cached resource index (endpoint
//! busy). Completions arrive as transfer-in-progress events, one per TRB with
//! IOC, and are retired strictly in ring order.

use crate::controller::Dwc3Core;
use crate::dma::{DmaBuffer, Platform};
use crate::dwc3::{CommandParams, DepCmd, EpCommand, RegisterIo, TrbControl, TrbStatus, TrbType};
use crate::endpoint::{PhysicalEndpoint, SlotRequest};
use crate::error::{Result, UsbError};
use crate::transfer::Direction;

/// Round an OUT request up to a whole number of packets (at least one)
pub const fn round_to_packets(len: u32, max_packet: u16) -> u32 {
    let mps = if max_packet == 0 { 1 } else { max_packet as u32 };
    let packets = if len == 0 { 1 } else { len.div_ceil(mps) };
    packets * mps
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Queue an IN transfer
    ///
    /// A zero `len` queues a zero-length packet.
    pub fn bulk_send(
        &mut self,
        number: u8,
        direction: Direction,
        buffer: DmaBuffer,
        len: u32,
    ) -> Result<()> {
        if direction != Direction::In {
            #[cfg(feature = "defmt")]
            defmt::error!("ep{} send on an OUT endpoint", number);
            return Err(UsbError::WrongDirection);
        }
        let phy = self.ring_endpoint(number, direction)?;
        if len as usize > buffer.len() {
            return Err(UsbError::InvalidLength);
        }

        let ty = if len == 0 { TrbType::NormalZlp } else { TrbType::Normal };
        let request = SlotRequest {
            length: len,
            buffer: Some(buffer),
        };
        self.queue_trb(phy, request, ty, TrbControl::IOC)
    }

    /// Queue an OUT transfer
    ///
    /// The request is rounded up to a whole number of max-size packets;
    /// `buffer` must hold the rounded length.
    pub fn bulk_recv(
        &mut self,
        number: u8,
        direction: Direction,
        buffer: DmaBuffer,
        len: u32,
    ) -> Result<()> {
        if direction != Direction::Out {
            #[cfg(feature = "defmt")]
            defmt::error!("ep{} receive on an IN endpoint", number);
            return Err(UsbError::WrongDirection);
        }
        let phy = self.ring_endpoint(number, direction)?;

        let size = round_to_packets(len, self.endpoints[phy.index()].max_packet);
        if size as usize > buffer.len() {
            return Err(UsbError::InvalidLength);
        }

        let request = SlotRequest {
            length: size,
            buffer: Some(buffer),
        };
        self.queue_trb(
            phy,
            request,
            TrbType::Normal,
            TrbControl::CSP | TrbControl::IOC | TrbControl::ISP_IMI,
        )
    }

    /// Enabled, non-control endpoint
    fn ring_endpoint(&self, number: u8, direction: Direction) -> Result<PhysicalEndpoint> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        if phy.is_control() || !self.endpoints[phy.index()].is_enabled() {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(phy)
    }

    fn queue_trb(
        &mut self,
        phy: PhysicalEndpoint,
        request: SlotRequest,
        ty: TrbType,
        flags: TrbControl,
    ) -> Result<()> {
        let index = phy.index();
        let slot = self.endpoints[index].cursor.push()?;
        let trb = self.dma.ring(index).slot(slot);

        let (addr, len) = match request.buffer {
            Some(buffer) => {
                buffer.hand_off(&mut self.platform, request.length as usize);
                (self.platform.to_global(buffer.addr()), request.length)
            }
            None => (0, 0),
        };
        if let Err(err) = trb.prepare(addr, len, ty, flags) {
            self.endpoints[index].cursor.unpush();
            return Err(err);
        }
        trb.hand_off(&mut self.platform);

        {
            let record = &mut self.endpoints[index];
            record.slots[slot] = request;
            record.requested = request.length;
            record.transferred = 0;
        }

        let record = &self.endpoints[index];
        let result = match (record.is_busy(), record.resource_index) {
            (true, Some(resource)) => self
                .send_ep_command(
                    index,
                    DepCmd::new(EpCommand::UpdateTransfer).with_param(u16::from(resource)),
                    CommandParams::trb_address(self.platform.to_global(trb.addr())),
                )
                .map(|_| ()),
            _ => {
                let ring = self.platform.to_global(trb.addr());
                self.send_ep_command(
                    index,
                    DepCmd::new(EpCommand::StartTransfer),
                    CommandParams::trb_address(ring),
                )
                .map(|done| self.endpoints[index].mark_started(done.resource_index()))
            }
        };

        if let Err(err) = result {
            trb.release(&mut self.platform);
            let record = &mut self.endpoints[index];
            record.cursor.unpush();
            record.slots[slot] = SlotRequest::default();
            return Err(err);
        }

        #[cfg(feature = "defmt")]
        defmt::trace!("ep{} slot {} queued {} bytes", index, slot, request.length);
        Ok(())
    }

    /// Retire the oldest outstanding TRB of a ring endpoint
    ///
    /// Returns the number of bytes moved, or `None` when the completion was
    /// dropped (setup pending) or nothing was outstanding.
    pub(crate) fn complete_ring_transfer(&mut self, phy: PhysicalEndpoint) -> Option<u32> {
        let index = phy.index();
        let slot = self.endpoints[index].cursor.dequeue();
        if self.endpoints[index].cursor.in_flight() == 0 {
            #[cfg(feature = "defmt")]
            defmt::warn!("ep{} completion with nothing queued", index);
            return None;
        }

        let done = self.dma.ring(index).slot(slot).reclaim(&mut self.platform);
        if done.status == TrbStatus::SetupPending {
            self.setup_pending = true;
            #[cfg(feature = "defmt")]
            defmt::warn!("ep{} setup pending in ring transfer", index);
            return None;
        }

        let record = &mut self.endpoints[index];
        record.cursor.pop();
        let request = core::mem::take(&mut record.slots[slot]);
        let bytes = if done.remaining == 0 {
            request.length
        } else {
            request.length.saturating_sub(done.remaining)
        };
        record.transferred = bytes;

        if let Some(buffer) = request.buffer {
            if phy.direction() == Direction::Out {
                buffer.reclaim(&mut self.platform, bytes as usize);
            }
        }
        self.stats.record_transfer(bytes);
        Some(bytes)
    }

    /// Bytes moved by the most recent completion on an endpoint
    pub fn transferred_bytes(&self, number: u8, direction: Direction) -> Result<u32> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        Ok(self.endpoints[phy.index()].transferred)
    }
}
