//! Transport abstraction: the narrow interface to the external Modbus
//! client.
//!
//! The core never frames bytes or manages timing; it hands a request to a
//! [`Transport`] and receives an [`ExchangeReply`] that completes later
//! (or immediately). Timeout and retry policy live entirely inside the
//! transport implementation.

pub mod rtu;

pub use rtu::{DataBits, Parity, RtuConfig, RtuMaster, StopBits};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::TransportErrorCode;
use crate::protocol::{DataUnit, Pdu};
use crate::signal::Signal;

/// Connection state of the physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No connection.
    #[default]
    Unconnected,
    /// Connection being established.
    Connecting,
    /// Connected and able to carry exchanges.
    Connected,
    /// Connection shutting down.
    Closing,
}

/// Error reported by the transport for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeError {
    /// Error code.
    pub code: TransportErrorCode,
    /// The transport's literal error description.
    pub description: String,
}

impl ExchangeError {
    /// Create an exchange error.
    pub fn new(code: TransportErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Handle to one in-flight request/response exchange.
///
/// Created pending by the transport's `send_*` methods; the transport
/// completes it exactly once with [`finish_ok`] or [`finish_err`], which
/// fires the `finished` signal. Observers attach with [`on_finished`]
/// and must handle the already-finished case themselves (check
/// [`is_finished`] first, as the message layer does).
///
/// [`finish_ok`]: ExchangeReply::finish_ok
/// [`finish_err`]: ExchangeReply::finish_err
/// [`on_finished`]: ExchangeReply::on_finished
/// [`is_finished`]: ExchangeReply::is_finished
#[derive(Debug)]
pub struct ExchangeReply {
    finished: Cell<bool>,
    error: RefCell<Option<ExchangeError>>,
    raw_response: RefCell<Option<Pdu>>,
    values: RefCell<Vec<u16>>,
    finished_signal: Signal<()>,
}

impl Default for ExchangeReply {
    fn default() -> Self {
        Self::pending()
    }
}

impl ExchangeReply {
    /// Create a pending reply.
    pub fn pending() -> Self {
        Self {
            finished: Cell::new(false),
            error: RefCell::new(None),
            raw_response: RefCell::new(None),
            values: RefCell::new(Vec::new()),
            finished_signal: Signal::new(),
        }
    }

    /// Whether the exchange has completed (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// The transport error, if the exchange failed.
    pub fn error(&self) -> Option<ExchangeError> {
        self.error.borrow().clone()
    }

    /// The raw response PDU, if one was received.
    pub fn raw_response(&self) -> Option<Pdu> {
        self.raw_response.borrow().clone()
    }

    /// Decoded register words for register-read exchanges.
    pub fn values(&self) -> Vec<u16> {
        self.values.borrow().clone()
    }

    /// Subscribe to completion. The signal fires once, after the reply
    /// data is in place.
    pub fn on_finished(&self) -> Signal<()> {
        self.finished_signal.clone()
    }

    /// Complete the exchange successfully.
    ///
    /// A no-op if already finished.
    pub fn finish_ok(&self, raw_response: Option<Pdu>, values: Vec<u16>) {
        if self.finished.get() {
            log::warn!("ExchangeReply: finish_ok on finished reply");
            return;
        }
        *self.raw_response.borrow_mut() = raw_response;
        *self.values.borrow_mut() = values;
        self.finished.set(true);
        self.finished_signal.emit(&());
    }

    /// Complete the exchange with a transport error. The raw response, if
    /// any, is kept so observers can extract a protocol exception code.
    ///
    /// A no-op if already finished.
    pub fn finish_err(&self, error: ExchangeError, raw_response: Option<Pdu>) {
        if self.finished.get() {
            log::warn!("ExchangeReply: finish_err on finished reply");
            return;
        }
        *self.error.borrow_mut() = Some(error);
        *self.raw_response.borrow_mut() = raw_response;
        self.finished.set(true);
        self.finished_signal.emit(&());
    }
}

/// Link-level events a transport emits.
#[derive(Debug, Default)]
pub struct TransportEvents {
    /// Fired on every link state change with the new state.
    pub state_changed: Signal<LinkState>,
    /// Fired when the transport reports an error outside a specific
    /// reply (connection failures and the like).
    pub error: Signal<ExchangeError>,
}

impl TransportEvents {
    /// Create an event set with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The external Modbus client, as consumed by the core.
pub trait Transport {
    /// Current link state.
    fn state(&self) -> LinkState;

    /// Begin connecting. Returns `false` if the attempt could not even be
    /// started.
    fn connect_link(&self) -> bool;

    /// Disconnect the link.
    fn disconnect_link(&self);

    /// Maximum PDU size the link can carry.
    fn max_pdu_size(&self) -> usize;

    /// Send a raw PDU to `server`. `None` if the request could not be
    /// issued at all.
    fn send_raw(&self, pdu: Pdu, server: u8) -> Option<Rc<ExchangeReply>>;

    /// Send a register-block read to `server`.
    fn send_read(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>>;

    /// Send a register-block write to `server`.
    fn send_write(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>>;

    /// Link-level event channels.
    fn events(&self) -> &TransportEvents;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_finish_ok_once() {
        let reply = ExchangeReply::pending();
        let fired = std::rc::Rc::new(Cell::new(0u32));
        let fired_clone = Rc::clone(&fired);
        reply.on_finished().connect(move |()| {
            fired_clone.set(fired_clone.get() + 1);
        });

        assert!(!reply.is_finished());
        reply.finish_ok(None, vec![1, 2]);
        assert!(reply.is_finished());
        assert_eq!(reply.values(), vec![1, 2]);
        assert!(reply.error().is_none());

        // Second completion is ignored.
        reply.finish_err(
            ExchangeError::new(TransportErrorCode::Timeout, "late"),
            None,
        );
        assert!(reply.error().is_none());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_reply_finish_err_keeps_raw_response() {
        let reply = ExchangeReply::pending();
        let raw = Pdu::new(0x94, vec![0x02]);
        reply.finish_err(
            ExchangeError::new(TransportErrorCode::Protocol, "exception"),
            Some(raw.clone()),
        );
        assert_eq!(reply.error().map(|e| e.code), Some(TransportErrorCode::Protocol));
        assert_eq!(reply.raw_response(), Some(raw));
    }
}
