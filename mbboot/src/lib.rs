//! # mbboot
//!
//! A library for updating firmware on embedded devices over Modbus RTU,
//! using the bootloader's "Read/Write File Record" extension.
//!
//! The crate is built around a small set of single-threaded, event-driven
//! components:
//!
//! - [`FirmwareEngine`] — turns an arbitrary byte range into page-aligned,
//!   word-aligned file-record operations (select page, erase, transfer)
//! - [`OperationChain`] — sequences heterogeneous asynchronous steps with
//!   success/failure/cancel semantics
//! - [`File`]/[`FileRegion`] — chunked Read/Write File Record transfers
//!   bounded by the link's PDU size
//! - [`Register`] — device memory-mapped values (coils, input and holding
//!   registers)
//! - [`Message`]/[`LinkQueue`] — one request/response exchange at a time
//!   on one physical link
//! - [`RtuMaster`] — the serial RTU transport carrying it all
//!
//! Everything above the transport is non-blocking: calls either fail
//! synchronously or make progress through event callbacks on the calling
//! thread. The transport is pump-driven; an application loops on
//! [`RtuMaster::poll`] until the engine reports completion.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use mbboot::{Device, FirmwareEngine, LinkQueue, RtuConfig, RtuMaster};
//!
//! fn main() {
//!     let master = RtuMaster::new(RtuConfig::new("/dev/ttyUSB0", 115200));
//!     let link = LinkQueue::new(Rc::clone(&master) as Rc<dyn mbboot::Transport>);
//!     let device = Device::new(Rc::clone(&link), 1);
//!     let engine = FirmwareEngine::new(device);
//!
//!     engine.events().conf_read.connect(|()| println!("geometry read"));
//!
//!     link.connect_link();
//!     engine.conf_read();
//!     while master.poll() {}
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod device;
pub mod error;
pub mod file;
pub mod firmware;
pub mod link;
pub mod message;
pub mod protocol;
pub mod register;
pub mod signal;
pub mod transport;

#[cfg(test)]
pub(crate) mod testsupport;

// Re-exports for convenience
pub use {
    chain::{ChainState, OperationChain, Step},
    device::Device,
    error::{Error, ErrorKind, ModbusDetail, Result, TransportErrorCode},
    file::{File, FileRegion},
    firmware::{FLASH_BASE, FirmwareEngine, Geometry},
    link::LinkQueue,
    message::{Message, MessageState, Payload},
    protocol::{DataUnit, MAX_PDU_SIZE, Pdu, RegisterClass},
    register::Register,
    signal::{Signal, SlotId},
    transport::{
        ExchangeError, ExchangeReply, LinkState, RtuConfig, RtuMaster, Transport, TransportEvents,
    },
};
