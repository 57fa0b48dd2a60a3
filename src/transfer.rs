//! USB transfer types and state
//!
//! Control transfers on EP0 are driven by [`control`]; bulk and interrupt
//! endpoints share the descriptor-ring engine in [`bulk`].

pub mod bulk;
pub mod control;

/// USB endpoint transfer types (DEPCFG encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EndpointType {
    /// Control
    Control = 0,
    /// Isochronous
    Isochronous = 1,
    /// Bulk
    Bulk = 2,
    /// Interrupt
    Interrupt = 3,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

impl Direction {
    /// Direction from an endpoint address or bmRequestType bit 7
    pub const fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    /// The other direction
    pub const fn reverse(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

/// Standard request codes the engine itself reacts to
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// USB setup packet
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Parse the 8 bytes written by the controller
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Wire format
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage direction
    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    /// Check if this is an IN transfer
    pub const fn is_in(&self) -> bool {
        matches!(self.direction(), Direction::In)
    }

    /// Transfer has a data stage
    pub const fn has_data_stage(&self) -> bool {
        self.length != 0
    }

    /// Standard SET_ADDRESS request
    pub const fn is_set_address(&self) -> bool {
        self.request_type & 0x60 == 0 && self.request == request::SET_ADDRESS
    }
}

/// EP0 control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Ep0State {
    /// No connection, nothing armed
    Unconnected = 0,
    /// SETUP TRB armed or awaited
    Setup = 1,
    /// Data stage
    Data = 2,
    /// Status stage armed or awaited
    Status = 3,
}

/// Chapter 9 device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// Not attached to a host
    NotAttached,
    /// Run/stop set, waiting for bus reset
    Attached,
    /// Reset seen, address 0
    Default,
    /// Address assigned
    Address,
    /// Configuration selected
    Configured,
    /// Bus suspended
    Suspended,
}
