//! Transport-level queue serializing concurrent senders onto one link.
//!
//! A [`LinkQueue`] owns the connection to the external transport and an
//! ordered queue of (message, server address) pairs. At most one queued
//! message is in flight at any time; the head of the queue is always the
//! in-flight one while the link is connected. Connection state changes
//! are translated into link-level events.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::warn;

use crate::error::{Error, ModbusDetail};
use crate::message::Message;
use crate::signal::{Signal, SlotId};
use crate::transport::{LinkState, Transport};

const COMPONENT: &str = "LinkQueue";

/// Events a link queue emits.
#[derive(Debug, Default)]
pub struct LinkEvents {
    /// The link reached the connected state.
    pub connected: Signal<()>,
    /// The link reached the unconnected state.
    pub disconnected: Signal<()>,
    /// Any link state change, with the new state.
    pub state_changed: Signal<LinkState>,
    /// A transport-level error outside a specific exchange.
    pub error: Signal<Error>,
}

struct QueueInner {
    queue: VecDeque<(Rc<Message>, u8)>,
    head_slot: Option<SlotId>,
}

/// Serializes messages onto one physical link.
pub struct LinkQueue {
    weak_self: Weak<Self>,
    transport: Rc<dyn Transport>,
    inner: RefCell<QueueInner>,
    events: LinkEvents,
}

impl LinkQueue {
    /// Create a queue over `transport` and subscribe to its link events.
    pub fn new(transport: Rc<dyn Transport>) -> Rc<Self> {
        let link = Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            transport,
            inner: RefCell::new(QueueInner {
                queue: VecDeque::new(),
                head_slot: None,
            }),
            events: LinkEvents::default(),
        });

        let weak = Rc::downgrade(&link);
        link.transport
            .events()
            .state_changed
            .connect(move |state| {
                if let Some(link) = weak.upgrade() {
                    link.on_state_changed(*state);
                }
            });

        let weak = Rc::downgrade(&link);
        link.transport.events().error.connect(move |exchange_error| {
            if let Some(link) = weak.upgrade() {
                link.events.error.emit(&Error::modbus(
                    COMPONENT,
                    "transport error",
                    ModbusDetail {
                        code: exchange_error.code,
                        description: exchange_error.description.clone(),
                        exception: None,
                    },
                ));
            }
        });

        link
    }

    /// Event channels.
    pub fn events(&self) -> &LinkEvents {
        &self.events
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    /// Begin connecting the link.
    pub fn connect_link(&self) -> bool {
        self.transport.connect_link()
    }

    /// Disconnect the link and flush the queue: the head's completion
    /// subscription is removed and every queued message is asked to
    /// cancel.
    pub fn disconnect_link(&self) {
        self.transport.disconnect_link();
        self.clear_queue();
    }

    /// Whether the link is in the connected state.
    pub fn is_connected(&self) -> bool {
        self.transport.state() == LinkState::Connected
    }

    /// Maximum PDU size the link can carry.
    pub fn max_pdu_size(&self) -> usize {
        self.transport.max_pdu_size()
    }

    /// Number of queued messages (including the in-flight head).
    pub fn queue_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Append a message for `server`; dispatches immediately if the queue
    /// was empty. Returns `false` if the link is not connected.
    pub fn enqueue(&self, msg: Rc<Message>, server: u8) -> bool {
        if !self.is_connected() {
            return false;
        }

        let need_send = {
            let mut inner = self.inner.borrow_mut();
            let was_empty = inner.queue.is_empty();
            inner.queue.push_back((msg, server));
            was_empty
        };

        if need_send {
            self.send_next();
        }

        true
    }

    fn on_state_changed(&self, state: LinkState) {
        match state {
            LinkState::Connected => self.events.connected.emit(&()),
            LinkState::Unconnected => self.events.disconnected.emit(&()),
            _ => {},
        }

        self.events.state_changed.emit(&state);
    }

    fn on_head_finished(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            let Some((msg, _)) = inner.queue.pop_front() else {
                warn!("LinkQueue: head completion with empty queue");
                return;
            };
            if let Some(slot) = inner.head_slot.take() {
                msg.events().finished.disconnect(slot);
            }
        }

        self.send_next();
    }

    /// Dispatch the head of the queue, discarding heads that cannot be
    /// launched, until a send succeeds or the queue is empty.
    fn send_next(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        loop {
            let head = self.inner.borrow().queue.front().cloned();
            let Some((msg, server)) = head else {
                return false;
            };

            let weak = self.weak_self.clone();
            let slot = msg.events().finished.connect(move |()| {
                if let Some(link) = weak.upgrade() {
                    link.on_head_finished();
                }
            });
            self.inner.borrow_mut().head_slot = Some(slot);

            if msg.send(self.transport.as_ref(), server) {
                return true;
            }

            // A failed launch emits `finished` during the send call, so
            // on_head_finished has already discarded this head and
            // dispatched the rest of the queue.
            let still_head = self
                .inner
                .borrow()
                .queue
                .front()
                .is_some_and(|(front, _)| Rc::ptr_eq(front, &msg));
            if !still_head {
                return true;
            }

            // The failure did not advance the queue (no finished event
            // reached us); drop the head ourselves and try the next.
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.head_slot.take() {
                msg.events().finished.disconnect(slot);
            }
            inner.queue.pop_front();
        }
    }

    fn clear_queue(&self) {
        let (messages, head_slot) = {
            let mut inner = self.inner.borrow_mut();
            (std::mem::take(&mut inner.queue), inner.head_slot.take())
        };

        if messages.is_empty() {
            return;
        }

        if let Some(slot) = head_slot {
            messages[0].0.events().finished.disconnect(slot);
        }

        for (msg, _) in &messages {
            msg.cancel();
        }
    }
}
