//! Device memory-mapped values: coils, discrete inputs, input and
//! holding registers.
//!
//! A [`Register`] owns a buffer of 16-bit words and knows how to read or
//! write itself through its [`Device`]. `value()`/`set_value()` access
//! word 0, the common single-register case.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::warn;

use crate::device::Device;
use crate::error::Error;
use crate::message::Message;
use crate::protocol::{DataUnit, RegisterClass};
use crate::signal::Signal;

const COMPONENT: &str = "Register";

/// Events a register emits.
#[derive(Debug, Default)]
pub struct RegisterEvents {
    /// A read completed and the buffer holds the device's values.
    pub data_read: Signal<()>,
    /// A write completed.
    pub data_written: Signal<()>,
    /// A read or write failed.
    pub error: Signal<Error>,
}

/// A block of device registers of one class.
pub struct Register {
    weak_self: Weak<Self>,
    device: Rc<Device>,
    class: Cell<RegisterClass>,
    address: Cell<u16>,
    data: RefCell<Vec<u16>>,
    events: RegisterEvents,
}

impl Register {
    /// Create a register block of `count` words at `address`.
    pub fn new(device: Rc<Device>, class: RegisterClass, address: u16, count: u16) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            device,
            class: Cell::new(class),
            address: Cell::new(address),
            data: RefCell::new(vec![0; usize::from(count)]),
            events: RegisterEvents::default(),
        })
    }

    /// Create a single-word register at `address`.
    pub fn single(device: Rc<Device>, class: RegisterClass, address: u16) -> Rc<Self> {
        Self::new(device, class, address, 1)
    }

    /// Event channels.
    pub fn events(&self) -> &RegisterEvents {
        &self.events
    }

    /// Register class.
    pub fn class(&self) -> RegisterClass {
        self.class.get()
    }

    /// Start address.
    pub fn address(&self) -> u16 {
        self.address.get()
    }

    /// Number of words in the block.
    pub fn count(&self) -> u16 {
        self.data.borrow().len() as u16
    }

    /// Resize the block.
    pub fn set_count(&self, count: u16) {
        self.data.borrow_mut().resize(usize::from(count), 0);
    }

    /// Word at `index` (0 when out of range).
    pub fn data(&self, index: usize) -> u16 {
        self.data.borrow().get(index).copied().unwrap_or(0)
    }

    /// Set word at `index`; out-of-range writes are ignored.
    pub fn set_data(&self, index: usize, value: u16) {
        if let Some(word) = self.data.borrow_mut().get_mut(index) {
            *word = value;
        }
    }

    /// Word 0, the single-register case.
    pub fn value(&self) -> u16 {
        self.data(0)
    }

    /// Set word 0.
    pub fn set_value(&self, value: u16) {
        self.set_data(0, value);
    }

    /// Launch a read of the block. Returns whether the request was
    /// queued; the outcome arrives via the events.
    pub fn read(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        let unit = DataUnit::with_count(self.class.get(), self.address.get(), self.count());
        let msg = Message::read(unit);

        let weak = self.weak_self.clone();
        let weak_msg = Rc::downgrade(&msg);
        msg.events().success.connect(move |()| {
            if let (Some(reg), Some(msg)) = (weak.upgrade(), weak_msg.upgrade()) {
                reg.on_read_done(&msg);
            }
        });
        let weak = self.weak_self.clone();
        msg.events().error.connect(move |error| {
            if let Some(reg) = weak.upgrade() {
                reg.events.error.emit(error);
            }
        });

        self.device.send_msg(&msg)
    }

    /// Launch a write of the block. Returns whether the request was
    /// queued; the outcome arrives via the events.
    pub fn write(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        let unit = DataUnit::with_values(
            self.class.get(),
            self.address.get(),
            self.data.borrow().clone(),
        );
        let msg = Message::write(unit);

        let weak = self.weak_self.clone();
        let weak_msg = Rc::downgrade(&msg);
        msg.events().success.connect(move |()| {
            if let (Some(reg), Some(msg)) = (weak.upgrade(), weak_msg.upgrade()) {
                reg.on_write_done(&msg);
            }
        });
        let weak = self.weak_self.clone();
        msg.events().error.connect(move |error| {
            if let Some(reg) = weak.upgrade() {
                reg.events.error.emit(error);
            }
        });

        self.device.send_msg(&msg)
    }

    fn on_read_done(&self, msg: &Message) {
        if !msg.is_sent() {
            return;
        }

        let Some(reply) = msg.reply() else {
            warn!("Register: read completion with no reply");
            self.events
                .error
                .emit(&Error::state(COMPONENT, "read reply is missing"));
            return;
        };

        if reply.error().is_some() {
            self.events
                .error
                .emit(&Error::state(COMPONENT, "read reply has an error"));
            return;
        }

        let values = reply.values();
        if values.len() != self.data.borrow().len() {
            self.events
                .error
                .emit(&Error::state(COMPONENT, "read result size mismatch"));
            return;
        }

        *self.data.borrow_mut() = values;

        self.events.data_read.emit(&());
    }

    fn on_write_done(&self, msg: &Message) {
        if !msg.is_sent() {
            return;
        }

        let Some(reply) = msg.reply() else {
            warn!("Register: write completion with no reply");
            self.events
                .error
                .emit(&Error::state(COMPONENT, "write reply is missing"));
            return;
        };

        if reply.error().is_some() {
            self.events
                .error
                .emit(&Error::state(COMPONENT, "write reply has an error"));
            return;
        }

        self.events.data_written.emit(&());
    }
}
