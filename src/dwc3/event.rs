//! Event buffer words
//!
//! The controller appends 4-byte event words to a circular buffer in memory
//! and reports the number of unread bytes in GEVNTCOUNT. Bit 0 separates the
//! two families: set for device-level events, clear for endpoint events.

use crate::dma::EVENT_BUFFER_SIZE;
use crate::dwc3::LinkState;

/// Device event type (bits 12:8 of a device event)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceEventKind {
    /// Disconnect detected
    Disconnect,
    /// USB bus reset
    Reset,
    /// Speed enumeration finished
    ConnectDone,
    /// Link state changed
    LinkStatusChange,
    /// Resume / remote wakeup detected
    Wakeup,
    /// Hibernation request
    HibernationRequest,
    /// End of periodic frame
    EndOfPeriodicFrame,
    /// Start of (micro)frame
    StartOfFrame,
    /// Erratic error
    ErraticError,
    /// Generic command complete
    CommandComplete,
    /// Event buffer overflow
    Overflow,
    /// Reserved encoding
    Unknown(u8),
}

impl DeviceEventKind {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Disconnect,
            1 => Self::Reset,
            2 => Self::ConnectDone,
            3 => Self::LinkStatusChange,
            4 => Self::Wakeup,
            5 => Self::HibernationRequest,
            6 => Self::EndOfPeriodicFrame,
            7 => Self::StartOfFrame,
            9 => Self::ErraticError,
            10 => Self::CommandComplete,
            11 => Self::Overflow,
            other => Self::Unknown(other as u8),
        }
    }
}

/// Device-level event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceEvent {
    /// Event type
    pub kind: DeviceEventKind,
    /// Event information (bits 24:16); link state in bits 3:0
    pub info: u16,
}

impl DeviceEvent {
    /// Link state carried by link-status-change and wakeup events
    pub const fn link_state(&self) -> LinkState {
        LinkState::from_bits(self.info as u32 & 0xF)
    }
}

/// Endpoint event type (bits 9:6 of an endpoint event)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointEventKind {
    /// Transfer finished (LST TRB or end transfer)
    TransferComplete,
    /// A TRB with IOC completed, transfer continues
    TransferInProgress,
    /// Endpoint has no TRB for a host request
    TransferNotReady,
    /// FIFO underrun/overrun
    FifoEvent,
    /// Stream event
    StreamEvent,
    /// Endpoint command complete
    CommandComplete,
    /// Reserved encoding
    Unknown(u8),
}

impl EndpointEventKind {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::TransferComplete,
            2 => Self::TransferInProgress,
            3 => Self::TransferNotReady,
            4 => Self::FifoEvent,
            6 => Self::StreamEvent,
            7 => Self::CommandComplete,
            other => Self::Unknown(other as u8),
        }
    }
}

/// Control stage reported by a transfer-not-ready event on EP0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    /// Host wants the data stage
    Data,
    /// Host wants the status stage
    Status,
}

/// Endpoint-level event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointEvent {
    /// Physical endpoint (bits 5:1)
    pub phy: u8,
    /// Event type
    pub kind: EndpointEventKind,
    /// Event status (bits 15:12)
    pub status: u8,
    /// Event parameters (bits 31:16)
    pub param: u16,
}

impl EndpointEvent {
    /// Control stage of a transfer-not-ready event
    pub const fn control_stage(&self) -> Option<ControlStage> {
        match self.status & 0x3 {
            1 => Some(ControlStage::Data),
            2 => Some(ControlStage::Status),
            _ => None,
        }
    }
}

/// Decoded event word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Device-level
    Device(DeviceEvent),
    /// Endpoint-level
    Endpoint(EndpointEvent),
}

impl Event {
    const DEVICE_EVENT: u32 = 1 << 0;

    /// Decode one event word
    pub const fn decode(word: u32) -> Self {
        if word & Self::DEVICE_EVENT != 0 {
            Self::Device(DeviceEvent {
                kind: DeviceEventKind::from_bits((word >> 8) & 0x1F),
                info: ((word >> 16) & 0x1FF) as u16,
            })
        } else {
            Self::Endpoint(EndpointEvent {
                phy: ((word >> 1) & 0x1F) as u8,
                kind: EndpointEventKind::from_bits((word >> 6) & 0xF),
                status: ((word >> 12) & 0xF) as u8,
                param: (word >> 16) as u16,
            })
        }
    }
}

/// Build a device event word
pub const fn device_event_word(kind: u8, info: u16) -> u32 {
    Event::DEVICE_EVENT | ((kind as u32 & 0x1F) << 8) | ((info as u32 & 0x1FF) << 16)
}

/// Build an endpoint event word
pub const fn endpoint_event_word(phy: u8, kind: u8, status: u8) -> u32 {
    ((phy as u32 & 0x1F) << 1) | ((kind as u32 & 0xF) << 6) | ((status as u32 & 0xF) << 12)
}

/// Software read position in the event buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventCursor {
    lpos: usize,
}

impl EventCursor {
    /// Cursor at byte 0
    pub const fn new() -> Self {
        Self { lpos: 0 }
    }

    /// Byte offset of the next unread word
    pub const fn position(&self) -> usize {
        self.lpos
    }

    /// Word index of the next unread word
    pub const fn word_index(&self) -> usize {
        self.lpos / 4
    }

    /// Step over one word, wrapping at the end of the buffer
    pub fn advance(&mut self) {
        self.lpos = (self.lpos + 4) % EVENT_BUFFER_SIZE;
    }

    /// Back to byte 0
    pub fn reset(&mut self) {
        self.lpos = 0;
    }
}
