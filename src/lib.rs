#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB device driver for the Synopsys DesignWare USB3 (DWC3) controller
//!
//! A transfer engine for DWC3 cores running in USB 2.0 device mode. The
//! controller is driven through its endpoint command interface, transfer
//! request blocks (TRBs) in shared memory, and a circular event buffer.
//!
//! # Core Components
//!
//! - [`controller`] - core bring-up, connection, address and link state
//! - [`endpoint`] - endpoint enable, disable, stall and transfer abort
//! - [`transfer`] - EP0 control state machine and bulk/interrupt rings
//! - [`device`] - interrupt-time event processing and upper-layer callbacks
//! - [`dwc3`] - register, command, TRB and event formats
//! - [`dma`] - shared memory and cache coherency
//! - [`error`] - error types
//!
//! # Getting Started
//!
//! 1. Place a [`DmaRegion`] in DMA-reachable memory
//! 2. Implement [`Platform`] (or use [`dma::CortexMPlatform`] on target)
//! 3. Implement [`UsbDeviceHandler`] for your class
//! 4. Build a [`UsbDevice`], call `init` and `connect`, then call
//!    `on_interrupt` from the USB interrupt handler

#[cfg(feature = "defmt")]
use defmt as _;

pub mod config;
pub mod controller;
pub mod device;
pub mod dma;
pub mod dwc3;
pub mod endpoint;
pub mod error;
pub mod perf;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::{DeviceSpeed, Dwc3Config, PhyInterface};
pub use controller::Dwc3Core;
pub use device::{DeviceBus, UsbDevice, UsbDeviceHandler};
pub use dma::{AddressAlias, DmaBuffer, DmaRegion, Platform};
pub use dwc3::{LinkState, Mmio, RegisterIo};
pub use endpoint::{EndpointStatus, PhysicalEndpoint};
pub use error::{Result, UsbError};
pub use perf::{DriverStats, StatsSnapshot};
pub use transfer::{DeviceState, Direction, Ep0State, EndpointType, SetupPacket};
