//! Control transfers on endpoint 0
//!
//! EP0 OUT (physical 0) and EP0 IN (physical 1) share one TRB, so at most one
//! control stage is ever in flight. The stage machine:
//!
//! ```text
//!            +--------------------------------------------+
//!            v                                            |
//!  SETUP --(xfer complete, wLength > 0)--> DATA           |
//!    |                                      |             |
//!    |                         (not ready: status)        |
//!    |                                      v             |
//!    +--(not ready: status, wLength == 0)--> STATUS --(xfer complete)
//! ```
//!
//! A data-stage not-ready for the wrong direction ends the data transfer and
//! stalls EP0; disconnect and bus reset end whatever is in flight.

use crate::controller::Dwc3Core;
use crate::dma::{DmaBuffer, Platform};
use crate::dwc3::{
    CommandParams, ControlStage, DepCmd, EndpointEvent, EndpointEventKind, EpCommand,
    RegisterIo, TrbControl, TrbStatus, TrbType,
};
use crate::endpoint::{EndpointStatus, PhysicalEndpoint, SlotRequest};
use crate::error::{Result, UsbError};
use crate::transfer::{Direction, Ep0State, SetupPacket};

/// Size of a setup packet
pub const SETUP_PACKET_SIZE: u32 = 8;

/// Upper-layer notification produced by an EP0 event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Ep0Action {
    /// Nothing to report
    None,
    /// A setup packet is ready
    SetupReceived,
    /// Data stage finished on EP0 IN
    DataIn,
    /// Data stage finished on EP0 OUT
    DataOut,
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Start the IN data stage of a control transfer
    pub fn ep0_send(&mut self, buffer: DmaBuffer, len: u32) -> Result<()> {
        if len == 0 || len as usize > buffer.len() {
            return Err(UsbError::InvalidLength);
        }
        self.ep0_start_data(PhysicalEndpoint::EP0_IN, buffer, len)
    }

    /// Start the OUT data stage of a control transfer
    ///
    /// The request is rounded up to a multiple of the EP0 max packet size;
    /// `buffer` must be large enough for the rounded length.
    pub fn ep0_recv(&mut self, buffer: DmaBuffer, len: u32) -> Result<()> {
        let mps = u32::from(self.config.control_max_packet.max(1));
        let rounded = len.max(1).div_ceil(mps) * mps;
        if rounded as usize > buffer.len() {
            return Err(UsbError::InvalidLength);
        }
        self.ep0_start_data(PhysicalEndpoint::EP0_OUT, buffer, rounded)
    }

    fn ep0_start_data(&mut self, phy: PhysicalEndpoint, buffer: DmaBuffer, len: u32) -> Result<()> {
        let index = phy.index();
        if self.endpoints[index].is_busy() {
            #[cfg(feature = "defmt")]
            defmt::warn!("ep{} busy, data stage refused", index);
            return Err(UsbError::EndpointBusy);
        }

        {
            let record = &mut self.endpoints[index];
            record.requested = len;
            record.transferred = 0;
            record.slots[0] = SlotRequest {
                length: len,
                buffer: Some(buffer),
            };
        }

        buffer.hand_off(&mut self.platform, len as usize);
        let global = self.platform.to_global(buffer.addr());
        self.ep0_arm(
            phy,
            global,
            len,
            TrbType::ControlData,
            Ep0State::Data,
        )
    }

    /// Fill the shared TRB, hand it off and start the transfer on `phy`
    fn ep0_arm(
        &mut self,
        phy: PhysicalEndpoint,
        global_addr: u32,
        len: u32,
        ty: TrbType,
        next: Ep0State,
    ) -> Result<()> {
        let trb = self.dma.ep0_trb();
        trb.clear();
        trb.prepare(
            global_addr,
            len,
            ty,
            TrbControl::LST | TrbControl::ISP_IMI | TrbControl::IOC,
        )?;
        trb.hand_off(&mut self.platform);
        self.ep0_state = next;

        let params = CommandParams::trb_address(self.platform.to_global(trb.addr()));
        match self.send_ep_command(phy.index(), DepCmd::new(EpCommand::StartTransfer), params) {
            Ok(done) => {
                self.endpoints[phy.index()].mark_started(done.resource_index());
                Ok(())
            }
            Err(err) => {
                trb.release(&mut self.platform);
                Err(err)
            }
        }
    }

    /// Arm the SETUP stage on EP0 OUT
    pub(crate) fn prepare_setup(&mut self) -> Result<()> {
        self.platform
            .clean_dcache(self.dma.setup_addr(), SETUP_PACKET_SIZE as usize);
        let global = self.platform.to_global(self.dma.setup_addr());
        self.ep0_arm(
            PhysicalEndpoint::EP0_OUT,
            global,
            SETUP_PACKET_SIZE,
            TrbType::ControlSetup,
            Ep0State::Setup,
        )
    }

    /// Arm the STATUS stage, opposite to the data direction
    pub(crate) fn start_status(&mut self) -> Result<()> {
        let phy = match self.data_direction.reverse() {
            Direction::In => PhysicalEndpoint::EP0_IN,
            Direction::Out => PhysicalEndpoint::EP0_OUT,
        };
        if self.endpoints[phy.index()].is_busy() {
            #[cfg(feature = "defmt")]
            defmt::warn!("ep{} busy, status stage refused", phy.index());
            return Err(UsbError::EndpointBusy);
        }

        let ty = if self.three_stage {
            TrbType::ControlStatus3
        } else {
            TrbType::ControlStatus2
        };
        // Zero-length: the setup buffer only provides a valid pointer
        self.platform
            .clean_dcache(self.dma.setup_addr(), SETUP_PACKET_SIZE as usize);
        let global = self.platform.to_global(self.dma.setup_addr());
        self.ep0_arm(phy, global, 0, ty, Ep0State::Status)
    }

    /// Stall EP0 and re-arm SETUP
    ///
    /// The upper layer calls this for requests it does not support.
    pub fn ep0_stall(&mut self) -> Result<()> {
        self.send_ep_command(0, DepCmd::new(EpCommand::SetStall), CommandParams::none())?;
        let record = &mut self.endpoints[0];
        record.status = EndpointStatus::ENABLED | EndpointStatus::STALL;
        record.resource_index = None;
        self.ep0_state = Ep0State::Setup;
        self.prepare_setup()
    }

    /// End the transfer in flight on one control endpoint half
    pub(crate) fn end_control_data(&mut self, phy: PhysicalEndpoint) -> Result<()> {
        let index = phy.index();
        let Some(resource) = self.endpoints[index].resource_index else {
            return Ok(());
        };
        let cmd = DepCmd::new(EpCommand::EndTransfer)
            .with_param(u16::from(resource))
            .with_ioc();
        self.send_ep_command(index, cmd, CommandParams::none())?;
        self.endpoints[index].mark_idle();
        Ok(())
    }

    /// End anything in flight on EP0 and forget the control transfer
    pub(crate) fn abort_control(&mut self) {
        for phy in [PhysicalEndpoint::EP0_OUT, PhysicalEndpoint::EP0_IN] {
            if let Err(_err) = self.end_control_data(phy) {
                #[cfg(feature = "defmt")]
                defmt::warn!("ep{} abort failed: {}", phy.index(), _err);
                self.endpoints[phy.index()].mark_idle();
            }
        }
        self.dma.ep0_trb().release(&mut self.platform);
        self.setup_pending = false;
        self.three_stage = false;
        self.data_direction = Direction::Out;
        self.actual_length = 0;
    }

    /// Handle an endpoint event for physical endpoint 0 or 1
    pub(crate) fn handle_ep0_event(&mut self, event: EndpointEvent) -> Result<Ep0Action> {
        let phy = PhysicalEndpoint::from_index(usize::from(event.phy))?;
        self.platform
            .invalidate_dcache(self.dma.setup_addr(), SETUP_PACKET_SIZE as usize);

        match event.kind {
            EndpointEventKind::TransferNotReady => match event.control_stage() {
                Some(ControlStage::Data) => {
                    if phy.direction() != self.data_direction {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("control data stage requested in the wrong direction");
                        let in_flight = match self.data_direction {
                            Direction::In => PhysicalEndpoint::EP0_IN,
                            Direction::Out => PhysicalEndpoint::EP0_OUT,
                        };
                        self.end_control_data(in_flight)?;
                        self.ep0_stall()?;
                    }
                    Ok(Ep0Action::None)
                }
                Some(ControlStage::Status) => {
                    if self.setup.is_set_address() {
                        if let Err(err) = self.set_address(self.setup.value) {
                            #[cfg(feature = "defmt")]
                            defmt::error!("set address {} refused: {}", self.setup.value, err);
                            self.ep0_stall()?;
                            return Err(err);
                        }
                    }
                    self.start_status()?;
                    Ok(Ep0Action::None)
                }
                None => Ok(Ep0Action::None),
            },
            EndpointEventKind::TransferComplete => {
                self.endpoints[phy.index()].mark_idle();
                self.setup_pending = false;

                match self.ep0_state {
                    Ep0State::Setup => {
                        self.read_setup();
                        Ok(Ep0Action::SetupReceived)
                    }
                    Ep0State::Data => Ok(self.ep0_data_done(phy)),
                    Ep0State::Status => {
                        self.ep0_status_done()?;
                        Ok(Ep0Action::None)
                    }
                    Ep0State::Unconnected => Ok(Ep0Action::None),
                }
            }
            _other => {
                #[cfg(feature = "defmt")]
                defmt::trace!("ep{} event {} ignored", phy.index(), _other);
                Ok(Ep0Action::None)
            }
        }
    }

    /// Cache the setup packet written by the controller and classify it
    fn read_setup(&mut self) {
        self.dma.ep0_trb().reclaim(&mut self.platform);
        let setup = SetupPacket::from_bytes(self.dma.setup_bytes());
        self.setup = setup;

        if setup.has_data_stage() {
            self.three_stage = true;
            self.data_direction = setup.direction();
            self.ep0_state = Ep0State::Data;
        } else {
            self.three_stage = false;
            self.data_direction = Direction::Out;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "setup {:02x} {:02x} len {}",
            setup.request_type,
            setup.request,
            setup.length
        );
    }

    fn ep0_data_done(&mut self, phy: PhysicalEndpoint) -> Ep0Action {
        self.actual_length = 0;
        let done = self.dma.ep0_trb().reclaim(&mut self.platform);
        if done.status == TrbStatus::SetupPending {
            self.setup_pending = true;
            #[cfg(feature = "defmt")]
            defmt::warn!("setup pending during control data stage");
            return Ep0Action::None;
        }

        let record = &mut self.endpoints[phy.index()];
        let bytes = record.requested.saturating_sub(done.remaining);
        record.transferred = bytes;
        if let Some(buffer) = record.slots[0].buffer.take() {
            if phy.direction() == Direction::Out {
                buffer.reclaim(&mut self.platform, bytes as usize);
            }
        }
        self.actual_length = bytes;
        self.stats.record_transfer(bytes);

        match phy.direction() {
            Direction::In => Ep0Action::DataIn,
            Direction::Out => Ep0Action::DataOut,
        }
    }

    fn ep0_status_done(&mut self) -> Result<()> {
        let done = self.dma.ep0_trb().reclaim(&mut self.platform);
        if done.status == TrbStatus::SetupPending {
            self.setup_pending = true;
            #[cfg(feature = "defmt")]
            defmt::warn!("setup pending at status completion");
        }
        self.actual_length = 0;
        self.prepare_setup()
    }

    /// A new SETUP arrived before the previous control stage completed
    pub fn setup_pending(&self) -> bool {
        self.setup_pending
    }
}
