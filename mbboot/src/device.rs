//! Handle to one device on the link: server address plus link access.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::link::LinkQueue;
use crate::message::Message;

/// One addressable device behind a [`LinkQueue`].
///
/// Every higher component (registers, files, the firmware engine) sends
/// through a device and uses its validity as the common guard: a device
/// is valid once a link is attached.
pub struct Device {
    link: RefCell<Option<Rc<LinkQueue>>>,
    server: Cell<u8>,
}

impl Device {
    /// Create a device for `server` on `link`.
    pub fn new(link: Rc<LinkQueue>, server: u8) -> Rc<Self> {
        Rc::new(Self {
            link: RefCell::new(Some(link)),
            server: Cell::new(server),
        })
    }

    /// Create a device with no link attached (invalid until one is set).
    pub fn detached(server: u8) -> Rc<Self> {
        Rc::new(Self {
            link: RefCell::new(None),
            server: Cell::new(server),
        })
    }

    /// Whether a link is attached.
    pub fn is_valid(&self) -> bool {
        self.link.borrow().is_some()
    }

    /// The attached link, if any.
    pub fn link(&self) -> Option<Rc<LinkQueue>> {
        self.link.borrow().clone()
    }

    /// Attach or replace the link.
    pub fn set_link(&self, link: Option<Rc<LinkQueue>>) {
        *self.link.borrow_mut() = link;
    }

    /// The device's server address.
    pub fn server(&self) -> u8 {
        self.server.get()
    }

    /// Change the device's server address.
    pub fn set_server(&self, server: u8) {
        self.server.set(server);
    }

    /// Maximum PDU size of the attached link (0 when detached).
    pub fn max_pdu_size(&self) -> usize {
        self.link.borrow().as_ref().map_or(0, |link| link.max_pdu_size())
    }

    /// Queue `msg` for this device. Fails when detached, when the message
    /// has no payload, or when it is already in flight.
    pub fn send_msg(&self, msg: &Rc<Message>) -> bool {
        let Some(link) = self.link.borrow().clone() else {
            return false;
        };
        if !msg.is_valid() {
            return false;
        }
        if msg.is_sending() {
            return false;
        }

        link.enqueue(Rc::clone(msg), self.server.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataUnit, RegisterClass};
    use crate::testsupport::MockTransport;
    use crate::transport::Transport;

    #[test]
    fn test_detached_device_rejects_sends() {
        let device = Device::detached(1);
        assert!(!device.is_valid());

        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        assert!(!device.send_msg(&msg));
        assert_eq!(device.max_pdu_size(), 0);
    }

    #[test]
    fn test_send_through_link() {
        let transport = MockTransport::connected();
        let link = LinkQueue::new(Rc::clone(&transport) as Rc<dyn Transport>);
        let device = Device::new(Rc::clone(&link), 7);

        assert!(device.is_valid());
        assert_eq!(device.max_pdu_size(), crate::protocol::MAX_PDU_SIZE);

        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        assert!(device.send_msg(&msg));
        assert!(msg.is_sending());
        assert_eq!(transport.last_server(), Some(7));
    }

    #[test]
    fn test_invalid_message_rejected_before_queueing() {
        let transport = MockTransport::connected();
        let link = LinkQueue::new(Rc::clone(&transport) as Rc<dyn Transport>);
        let device = Device::new(Rc::clone(&link), 1);

        let msg = Message::new();
        assert!(!device.send_msg(&msg));
        assert_eq!(link.queue_len(), 0);
    }
}
