//! Single request/response exchange with explicit lifecycle state.
//!
//! A [`Message`] wraps exactly one outgoing payload and tracks it from
//! `Idle` through `Sending` to one of the terminal states `Sent`, `Error`
//! or `Canceled`. Whatever the outcome, the `finished` event fires
//! exactly once, so cleanup observers do not need to care which terminal
//! state was reached.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::error::{Error, ModbusDetail};
use crate::protocol::{DataUnit, Pdu};
use crate::signal::Signal;
use crate::transport::{ExchangeReply, Transport};

const COMPONENT: &str = "Message";

/// Lifecycle state of a message.
///
/// `Sent`, `Error` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageState {
    /// Not yet sent.
    #[default]
    Idle,
    /// Dispatched, awaiting the exchange outcome.
    Sending,
    /// The exchange completed without a transport error.
    Sent,
    /// The exchange failed or the message could not be launched.
    Error,
    /// The message was canceled before it was sent.
    Canceled,
}

/// The outgoing payload of a message.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A raw protocol data unit.
    Raw(Pdu),
    /// A register-block read.
    Read(DataUnit),
    /// A register-block write.
    Write(DataUnit),
}

/// Events a message emits.
#[derive(Debug, Default)]
pub struct MessageEvents {
    /// The exchange completed without a transport error.
    pub success: Signal<()>,
    /// The exchange failed; carries the propagated error.
    pub error: Signal<Error>,
    /// The message was canceled.
    pub canceled: Signal<()>,
    /// Fired exactly once when any terminal state is reached.
    pub finished: Signal<()>,
}

/// One request/response exchange.
#[derive(Debug)]
pub struct Message {
    weak_self: Weak<Self>,
    state: Cell<MessageState>,
    payload: RefCell<Option<Payload>>,
    reply: RefCell<Option<Rc<ExchangeReply>>>,
    events: MessageEvents,
}

impl Message {
    /// Create a message with no payload. Sending it fails until a payload
    /// is set.
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            state: Cell::new(MessageState::Idle),
            payload: RefCell::new(None),
            reply: RefCell::new(None),
            events: MessageEvents::default(),
        })
    }

    /// Create a message carrying a raw PDU.
    pub fn raw(pdu: Pdu) -> Rc<Self> {
        let msg = Self::new();
        *msg.payload.borrow_mut() = Some(Payload::Raw(pdu));
        msg
    }

    /// Create a message carrying a register-block read.
    pub fn read(unit: DataUnit) -> Rc<Self> {
        let msg = Self::new();
        *msg.payload.borrow_mut() = Some(Payload::Read(unit));
        msg
    }

    /// Create a message carrying a register-block write.
    pub fn write(unit: DataUnit) -> Rc<Self> {
        let msg = Self::new();
        *msg.payload.borrow_mut() = Some(Payload::Write(unit));
        msg
    }

    /// Replace the payload. Rejected while sending.
    pub fn set_payload(&self, payload: Payload) -> bool {
        if self.is_sending() {
            return false;
        }
        *self.reply.borrow_mut() = None;
        *self.payload.borrow_mut() = Some(payload);
        true
    }

    /// Whether a payload has been configured.
    pub fn is_valid(&self) -> bool {
        self.payload.borrow().is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MessageState {
        self.state.get()
    }

    /// Whether the exchange completed successfully.
    pub fn is_sent(&self) -> bool {
        self.state.get() == MessageState::Sent
    }

    /// Whether the message is in flight.
    pub fn is_sending(&self) -> bool {
        self.state.get() == MessageState::Sending
    }

    /// Whether the message was canceled.
    pub fn is_canceled(&self) -> bool {
        self.state.get() == MessageState::Canceled
    }

    /// The reply handle of the last dispatch, if any.
    pub fn reply(&self) -> Option<Rc<ExchangeReply>> {
        self.reply.borrow().clone()
    }

    /// Event channels.
    pub fn events(&self) -> &MessageEvents {
        &self.events
    }

    /// Drop payload and reply and return to `Idle`. Rejected while
    /// sending.
    pub fn clear(&self) -> bool {
        if self.is_sending() {
            return false;
        }
        *self.payload.borrow_mut() = None;
        *self.reply.borrow_mut() = None;
        self.state.set(MessageState::Idle);
        true
    }

    /// Dispatch the payload to `server` over `transport`.
    ///
    /// Returns `false` — after emitting the error and finished events —
    /// if the message is already sending, has no payload, or the
    /// transport produced no reply handle. Otherwise the message is
    /// `Sending` and will reach a terminal state when the reply
    /// completes (which may happen before `send` returns).
    pub fn send(&self, transport: &dyn Transport, server: u8) -> bool {
        if self.is_sending() {
            debug!("Message: send on a message already sending");
            self.on_send_fail(Error::state(COMPONENT, "send on a message already sending"));
            return false;
        }

        if !self.is_valid() {
            debug!("Message: send on a message with no payload");
            self.on_send_fail(Error::state(COMPONENT, "send on a message with no payload"));
            return false;
        }

        self.state.set(MessageState::Sending);
        *self.reply.borrow_mut() = None;

        let payload = self.payload.borrow().clone();
        let reply = match payload {
            Some(Payload::Raw(pdu)) => transport.send_raw(pdu, server),
            Some(Payload::Read(unit)) => transport.send_read(unit, server),
            Some(Payload::Write(unit)) => transport.send_write(unit, server),
            None => None,
        };

        let Some(reply) = reply else {
            self.on_send_fail(Error::state(COMPONENT, "transport returned no reply"));
            return false;
        };

        *self.reply.borrow_mut() = Some(Rc::clone(&reply));

        if reply.is_finished() {
            self.on_reply_finished();
        } else {
            let weak = self.weak_self.clone();
            reply.on_finished().connect(move |()| {
                if let Some(msg) = weak.upgrade() {
                    msg.on_reply_finished();
                }
            });
        }

        true
    }

    /// Cancel the message. Fails while the message is in flight: an
    /// exchange already sent runs to completion under the transport's
    /// own timeout policy.
    pub fn cancel(&self) -> bool {
        if self.is_sending() {
            debug!("Message: cancel on a message in flight");
            return false;
        }

        self.on_send_canceled();
        true
    }

    fn on_reply_finished(&self) {
        let reply = self.reply.borrow().clone();
        let Some(reply) = reply else {
            warn!("Message: reply completion with no reply handle");
            return;
        };

        if let Some(exchange_error) = reply.error() {
            let exception = reply.raw_response().and_then(|pdu| pdu.exception_code());
            let err = Error::modbus(
                COMPONENT,
                "exchange failed",
                ModbusDetail {
                    code: exchange_error.code,
                    description: exchange_error.description,
                    exception,
                },
            );
            self.on_send_error(err);
        }

        self.on_send_done();
    }

    fn on_send_fail(&self, err: Error) {
        self.on_send_error(err);
        self.on_send_done();
    }

    fn on_send_canceled(&self) {
        self.state.set(MessageState::Canceled);
        self.events.canceled.emit(&());

        self.on_send_done();
    }

    fn on_send_done(&self) {
        match self.state.get() {
            MessageState::Sending => {
                self.state.set(MessageState::Sent);
                self.events.success.emit(&());
            },
            MessageState::Error | MessageState::Canceled => {},
            state => {
                warn!("Message: send completion in invalid state {state:?}");
            },
        }

        self.events.finished.emit(&());
    }

    fn on_send_error(&self, err: Error) {
        self.state.set(MessageState::Error);
        self.events.error.emit(&err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TransportErrorCode};
    use crate::protocol::{RegisterClass, function};
    use crate::testsupport::MockTransport;
    use crate::transport::ExchangeError;

    fn observe(msg: &Rc<Message>) -> Rc<RefCell<Vec<&'static str>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for (name, signal) in [
            ("success", &msg.events().success),
            ("canceled", &msg.events().canceled),
            ("finished", &msg.events().finished),
        ] {
            let log = Rc::clone(&log);
            signal.connect(move |()| log.borrow_mut().push(name));
        }
        let log_err = Rc::clone(&log);
        msg.events()
            .error
            .connect(move |_| log_err.borrow_mut().push("error"));
        log
    }

    #[test]
    fn test_send_without_payload_fails_with_state_error() {
        let transport = MockTransport::connected();
        let msg = Message::new();
        let log = observe(&msg);

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        msg.events().error.connect(move |e| sink.borrow_mut().push(e.clone()));

        assert!(!msg.send(&*transport, 1));
        assert_eq!(msg.state(), MessageState::Error);
        assert_eq!(*log.borrow(), vec!["error", "finished"]);
        assert_eq!(errors.borrow()[0].kind(), ErrorKind::State);
    }

    #[test]
    fn test_send_success_emits_success_then_finished() {
        let transport = MockTransport::connected();
        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        let log = observe(&msg);

        assert!(msg.send(&*transport, 1));
        assert!(msg.is_sending());
        assert!(log.borrow().is_empty());

        transport.pump_one();
        assert!(msg.is_sent());
        assert_eq!(*log.borrow(), vec!["success", "finished"]);
    }

    #[test]
    fn test_send_while_sending_fails() {
        let transport = MockTransport::connected();
        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));

        assert!(msg.send(&*transport, 1));
        assert!(!msg.send(&*transport, 1));
        // The guard failure clobbers the state, matching the contract:
        // send on a sending message fails with a state error.
        assert_eq!(msg.state(), MessageState::Error);
    }

    #[test]
    fn test_transport_error_carries_modbus_detail() {
        let transport = MockTransport::connected();
        transport.fail_next(
            ExchangeError::new(TransportErrorCode::Timeout, "no response"),
            Some(Pdu::new(
                function::READ_INPUT_REGISTERS | function::EXCEPTION_FLAG,
                vec![0x02],
            )),
        );

        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        let log = observe(&msg);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        msg.events().error.connect(move |e| sink.borrow_mut().push(e.clone()));

        assert!(msg.send(&*transport, 1));
        transport.pump_one();

        assert_eq!(msg.state(), MessageState::Error);
        assert_eq!(*log.borrow(), vec!["error", "finished"]);

        let detail = errors.borrow()[0].modbus_detail().cloned().unwrap();
        assert_eq!(detail.code, TransportErrorCode::Timeout);
        assert_eq!(detail.description, "no response");
        assert_eq!(detail.exception, Some(0x02));
    }

    #[test]
    fn test_cancel_before_send() {
        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        let log = observe(&msg);

        assert!(msg.cancel());
        assert!(msg.is_canceled());
        assert_eq!(*log.borrow(), vec!["canceled", "finished"]);
    }

    #[test]
    fn test_cancel_while_sending_fails() {
        let transport = MockTransport::connected();
        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));

        assert!(msg.send(&*transport, 1));
        assert!(!msg.cancel());
        assert!(msg.is_sending());

        transport.pump_one();
        assert!(msg.is_sent());
    }

    #[test]
    fn test_clear_resets_to_idle() {
        let msg = Message::read(DataUnit::with_count(RegisterClass::InputRegisters, 1, 1));
        assert!(msg.is_valid());
        assert!(msg.clear());
        assert!(!msg.is_valid());
        assert_eq!(msg.state(), MessageState::Idle);
    }
}
