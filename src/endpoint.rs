//! Endpoint records and lifecycle
//!
//! One [`EndpointRecord`] per physical endpoint, indexed by
//! `logical number * 2 + direction`. Index 0 and 1 are the two halves of the
//! control endpoint and share the single EP0 TRB; every other endpoint owns a
//! descriptor ring in the [`DmaRegion`](crate::dma::DmaRegion).

use bitflags::bitflags;

use crate::config::timing;
use crate::controller::Dwc3Core;
use crate::dma::{DmaBuffer, Platform};
use crate::dwc3::command::depcfg;
use crate::dwc3::trb::RING_DEPTH;
use crate::dwc3::{CommandParams, DepCmd, EpCommand, EpConfig, RegisterIo, RingCursor};
use crate::dwc3::MAX_PHYSICAL_ENDPOINTS;
use crate::error::{Result, UsbError};
use crate::transfer::{Direction, EndpointType};

/// Physical endpoint index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhysicalEndpoint(u8);

impl PhysicalEndpoint {
    /// EP0 OUT
    pub const EP0_OUT: Self = Self(0);
    /// EP0 IN
    pub const EP0_IN: Self = Self(1);

    /// Physical endpoint for a logical number and direction
    pub const fn new(number: u8, direction: Direction) -> Result<Self> {
        let index = (number as usize) * 2 + direction as usize;
        if number > 15 || index >= MAX_PHYSICAL_ENDPOINTS {
            Err(UsbError::InvalidEndpoint)
        } else {
            Ok(Self(index as u8))
        }
    }

    /// Physical endpoint from a raw index
    pub const fn from_index(index: usize) -> Result<Self> {
        if index >= MAX_PHYSICAL_ENDPOINTS {
            Err(UsbError::InvalidEndpoint)
        } else {
            Ok(Self(index as u8))
        }
    }

    /// Index for array access
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Logical endpoint number
    pub const fn number(self) -> u8 {
        self.0 >> 1
    }

    /// Direction
    pub const fn direction(self) -> Direction {
        if self.0 & 1 == 1 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// USB endpoint address (bit 7 set for IN)
    pub const fn address(self) -> u8 {
        match self.direction() {
            Direction::In => self.number() | 0x80,
            Direction::Out => self.number(),
        }
    }

    /// One of the two control endpoint halves
    pub const fn is_control(self) -> bool {
        self.0 < 2
    }
}

bitflags! {
    /// Endpoint software status
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct EndpointStatus: u8 {
        /// Configured and enabled in DALEPENA
        const ENABLED = 1 << 0;
        /// Halted
        const STALL = 1 << 1;
        /// Halt set by the function, survives CLEAR_FEATURE
        const WEDGE = 1 << 2;
        /// A transfer resource is held
        const BUSY = 1 << 4;
        /// Request queued while busy
        const PENDING_REQUEST = 1 << 5;
        /// Isochronous interval missed
        const MISSED_ISOC = 1 << 6;
    }
}

/// Length recorded for one submitted TRB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotRequest {
    /// Bytes described by the TRB (after rounding)
    pub length: u32,
    /// Buffer to reclaim on completion
    pub buffer: Option<DmaBuffer>,
}

/// Per physical endpoint state
#[derive(Debug, Clone, Copy)]
pub struct EndpointRecord {
    pub(crate) phy: PhysicalEndpoint,
    pub(crate) ep_type: EndpointType,
    pub(crate) max_packet: u16,
    pub(crate) interval: u8,
    pub(crate) status: EndpointStatus,
    pub(crate) resource_index: Option<u8>,
    pub(crate) cursor: RingCursor,
    pub(crate) slots: [SlotRequest; RING_DEPTH],
    pub(crate) requested: u32,
    pub(crate) transferred: u32,
}

impl EndpointRecord {
    pub(crate) const fn new(phy: PhysicalEndpoint) -> Self {
        Self {
            phy,
            ep_type: EndpointType::Control,
            max_packet: 0,
            interval: 0,
            status: EndpointStatus::empty(),
            resource_index: None,
            cursor: RingCursor::new(),
            slots: [SlotRequest { length: 0, buffer: None }; RING_DEPTH],
            requested: 0,
            transferred: 0,
        }
    }

    /// Physical endpoint
    pub fn phy(&self) -> PhysicalEndpoint {
        self.phy
    }

    /// Transfer type
    pub fn ep_type(&self) -> EndpointType {
        self.ep_type
    }

    /// Max packet size
    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    /// Status flags
    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    /// Enabled
    pub fn is_enabled(&self) -> bool {
        self.status.contains(EndpointStatus::ENABLED)
    }

    /// Transfer in flight
    pub fn is_busy(&self) -> bool {
        self.status.contains(EndpointStatus::BUSY)
    }

    /// Halted
    pub fn is_stalled(&self) -> bool {
        self.status.contains(EndpointStatus::STALL)
    }

    /// Transfer resource index, present only while busy
    pub fn resource_index(&self) -> Option<u8> {
        self.resource_index
    }

    /// Ring cursors
    pub fn cursor(&self) -> RingCursor {
        self.cursor
    }

    /// Bytes requested by the most recent submission (after rounding)
    pub fn requested(&self) -> u32 {
        self.requested
    }

    /// Bytes moved by the most recent completion
    pub fn transferred(&self) -> u32 {
        self.transferred
    }

    /// Forget everything but identity, type and size
    pub(crate) fn reset_transfer_state(&mut self) {
        self.status = EndpointStatus::empty();
        self.resource_index = None;
        self.cursor.reset();
        self.slots = [SlotRequest::default(); RING_DEPTH];
        self.requested = 0;
        self.transferred = 0;
    }

    /// Busy flag and resource index after a successful start transfer
    pub(crate) fn mark_started(&mut self, resource_index: u8) {
        self.status.insert(EndpointStatus::BUSY);
        self.resource_index = Some(resource_index);
    }

    /// Clear busy flag and resource index
    pub(crate) fn mark_idle(&mut self) {
        self.status.remove(EndpointStatus::BUSY);
        self.resource_index = None;
    }
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Endpoint record
    pub fn endpoint(&self, phy: PhysicalEndpoint) -> &EndpointRecord {
        &self.endpoints[phy.index()]
    }

    /// Create an endpoint of any transfer type
    ///
    /// Isochronous endpoints are not supported.
    pub fn endpoint_create(
        &mut self,
        ep_type: EndpointType,
        number: u8,
        direction: Direction,
        max_packet: u16,
        interval: u8,
    ) -> Result<()> {
        match ep_type {
            EndpointType::Control | EndpointType::Bulk | EndpointType::Interrupt => {
                self.endpoint_enable(number, direction, ep_type, max_packet, interval)
            }
            EndpointType::Isochronous => Err(UsbError::Unsupported),
        }
    }

    /// Configure and enable an endpoint
    ///
    /// The first enable of a physical endpoint issues start-config (once per
    /// group), set-endpoint-config, set-transfer-resource and sets the
    /// DALEPENA bit. Re-enabling only re-issues set-endpoint-config. The first
    /// failing command is returned; commands already issued are not undone.
    pub fn endpoint_enable(
        &mut self,
        number: u8,
        direction: Direction,
        ep_type: EndpointType,
        max_packet: u16,
        interval: u8,
    ) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        if phy.index() >= self.num_endpoints {
            return Err(UsbError::InvalidEndpoint);
        }
        if max_packet == 0 {
            return Err(UsbError::InvalidParameter);
        }
        if phy.is_control() != matches!(ep_type, EndpointType::Control) {
            return Err(UsbError::InvalidParameter);
        }

        let index = phy.index();
        let first_enable = !self.endpoints[index].is_enabled();
        {
            let record = &mut self.endpoints[index];
            record.ep_type = ep_type;
            record.max_packet = max_packet;
            record.interval = interval;
        }

        if first_enable {
            self.start_endpoint_config(phy)?;
        }

        let config = EpConfig {
            phy: phy.0,
            ep_type,
            max_packet,
            interval,
        };
        self.send_ep_command(index, DepCmd::new(EpCommand::SetEndpointConfig), config.to_params())?;

        if first_enable {
            self.send_ep_command(
                index,
                DepCmd::new(EpCommand::SetTransferResource),
                CommandParams::new(depcfg::NUM_XFER_RES_1, 0),
            )?;

            self.endpoints[index].status.insert(EndpointStatus::ENABLED);
            self.regs.set_endpoint_enabled(index, true);

            if !phy.is_control() {
                self.dma.ring(index).reset(&mut self.platform);
                let record = &mut self.endpoints[index];
                record.cursor.reset();
                record.slots = [SlotRequest::default(); RING_DEPTH];
            }
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("ep{} enabled: type {}, mps {}", index, ep_type, max_packet);
        Ok(())
    }

    /// Issue start-config for the group `phy` belongs to
    ///
    /// EP0 OUT starts the control group exactly once for the lifetime of the
    /// controller; EP0 IN never issues it. Any other endpoint starts the
    /// non-control group (transfer resource base 2) once per connection.
    pub(crate) fn start_endpoint_config(&mut self, phy: PhysicalEndpoint) -> Result<()> {
        match phy.index() {
            1 => Ok(()),
            0 => {
                if self.control_config_done {
                    return Ok(());
                }
                self.send_ep_command(0, DepCmd::new(EpCommand::StartConfig), CommandParams::none())?;
                self.control_config_done = true;
                Ok(())
            }
            _ => {
                if self.config_done {
                    return Ok(());
                }
                self.send_ep_command(
                    0,
                    DepCmd::new(EpCommand::StartConfig).with_param(2),
                    CommandParams::none(),
                )?;
                self.config_done = true;
                Ok(())
            }
        }
    }

    /// Disable an endpoint
    ///
    /// In-flight descriptors are left alone; stop transfers first.
    pub fn endpoint_disable(&mut self, number: u8, direction: Direction) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        self.regs.set_endpoint_enabled(phy.index(), false);
        self.endpoints[phy.index()].status.remove(EndpointStatus::ENABLED);
        Ok(())
    }

    /// Halt an endpoint
    pub fn endpoint_stall(&mut self, number: u8, direction: Direction) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        self.send_ep_command(phy.index(), DepCmd::new(EpCommand::SetStall), CommandParams::none())?;
        self.endpoints[phy.index()].status.insert(EndpointStatus::STALL);
        Ok(())
    }

    /// Clear an endpoint halt
    pub fn endpoint_clear_stall(&mut self, number: u8, direction: Direction) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        self.send_ep_command(phy.index(), DepCmd::new(EpCommand::ClearStall), CommandParams::none())?;
        self.endpoints[phy.index()]
            .status
            .remove(EndpointStatus::STALL | EndpointStatus::WEDGE);
        Ok(())
    }

    /// Halt an endpoint and mark it wedged
    ///
    /// The flag only records the request; the next clear-stall removes it
    /// together with the halt.
    pub fn endpoint_wedge(&mut self, number: u8, direction: Direction) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        self.send_ep_command(phy.index(), DepCmd::new(EpCommand::SetStall), CommandParams::none())?;
        self.endpoints[phy.index()]
            .status
            .insert(EndpointStatus::STALL | EndpointStatus::WEDGE);
        Ok(())
    }

    /// End the transfer in flight on an endpoint
    ///
    /// With `force` the controller drops the transfer resource immediately.
    /// Every outstanding ring descriptor is taken back from hardware.
    pub fn stop_transfer(&mut self, number: u8, direction: Direction, force: bool) -> Result<()> {
        let phy = PhysicalEndpoint::new(number, direction)?;
        let index = phy.index();
        let resource = self.endpoints[index]
            .resource_index
            .ok_or(UsbError::ResourceIndexInvalid)?;

        let mut cmd = DepCmd::new(EpCommand::EndTransfer)
            .with_param(u16::from(resource))
            .with_ioc();
        if force {
            cmd = cmd.with_force_rm();
        }
        self.send_ep_command(index, cmd, CommandParams::none())?;
        self.platform.delay_us(timing::END_TRANSFER_SETTLE_US);

        self.endpoints[index].mark_idle();
        if !phy.is_control() {
            let ring = self.dma.ring(index);
            while let Some(slot) = self.endpoints[index].cursor.pop() {
                ring.slot(slot).release(&mut self.platform);
            }
        }
        Ok(())
    }

    /// Clear every stalled, enabled endpoint except EP0 OUT
    pub(crate) fn clear_all_stalls(&mut self) {
        for index in 1..self.num_endpoints {
            let status = self.endpoints[index].status;
            if !status.contains(EndpointStatus::ENABLED | EndpointStatus::STALL) {
                continue;
            }
            self.endpoints[index].status.remove(EndpointStatus::STALL);
            if let Err(_err) =
                self.send_ep_command(index, DepCmd::new(EpCommand::ClearStall), CommandParams::none())
            {
                #[cfg(feature = "defmt")]
                defmt::warn!("ep{} clear stall failed: {}", index, _err);
            }
        }
    }

    /// Drop software transfer state of every endpoint after a bus reset
    ///
    /// The control endpoints stay enabled; the controller keeps them
    /// configured across a reset.
    pub(crate) fn reset_endpoints(&mut self) {
        for record in self.endpoints.iter_mut() {
            let keep_enabled = record.phy.is_control() && record.is_enabled();
            record.reset_transfer_state();
            if keep_enabled {
                record.status.insert(EndpointStatus::ENABLED);
            }
        }
    }
}
