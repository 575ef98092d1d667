//! Error type for mbboot.
//!
//! Errors travel by value through event channels (a failing exchange is
//! reported to several observers), so this is a plain clonable value
//! rather than a source-chained enum: an error kind, the component that
//! raised it, a display message and — for transport-reported failures —
//! the Modbus detail (transport error code, its description and any
//! protocol exception code from the raw response).

use thiserror::Error;

/// Result type for mbboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// Local logic or validation failure (invalid chunk sizing, chain
    /// launch failure, ...).
    #[default]
    General,
    /// An operation was observed in a state where it is invalid (missing
    /// reply, reply already errored, result shape mismatch).
    State,
    /// A transport-reported protocol or communication error.
    Modbus,
}

/// Transport-level error codes, as reported by the external Modbus
/// client for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// Reading the response failed.
    Read,
    /// Writing the request failed.
    Write,
    /// The connection dropped or could not be used.
    Connection,
    /// The link was misconfigured.
    Configuration,
    /// The exchange timed out (after the transport's own retries).
    Timeout,
    /// The response violated the protocol.
    Protocol,
    /// The exchange was aborted before completion.
    Aborted,
    /// Anything else.
    Unknown,
}

impl TransportErrorCode {
    /// Short human-readable name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read error",
            Self::Write => "write error",
            Self::Connection => "connection error",
            Self::Configuration => "configuration error",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol error",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown error",
        }
    }
}

/// Detail attached to [`ErrorKind::Modbus`] errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusDetail {
    /// The transport's error code for the exchange.
    pub code: TransportErrorCode,
    /// The transport's literal error description.
    pub description: String,
    /// Protocol exception code from the raw response, if the device
    /// answered with an exception.
    pub exception: Option<u8>,
}

/// Human-readable description of a Modbus protocol exception code.
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Error value carried by failure events and `Result`s.
#[derive(Debug, Clone, Error)]
#[error("{component}: {message}")]
pub struct Error {
    kind: ErrorKind,
    component: &'static str,
    message: String,
    modbus: Option<ModbusDetail>,
}

impl Error {
    /// Build a [`ErrorKind::General`] error.
    pub fn general(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::General,
            component,
            message: message.into(),
            modbus: None,
        }
    }

    /// Build a [`ErrorKind::State`] error.
    pub fn state(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::State,
            component,
            message: message.into(),
            modbus: None,
        }
    }

    /// Build a [`ErrorKind::Modbus`] error carrying transport detail.
    pub fn modbus(component: &'static str, message: impl Into<String>, detail: ModbusDetail) -> Self {
        Self {
            kind: ErrorKind::Modbus,
            component,
            message: message.into(),
            modbus: Some(detail),
        }
    }

    /// The error's classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Name of the component that raised the error.
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Display message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transport detail for [`ErrorKind::Modbus`] errors.
    pub fn modbus_detail(&self) -> Option<&ModbusDetail> {
        self.modbus.as_ref()
    }

    /// Full display string including the Modbus detail, for presentation
    /// layers.
    pub fn detailed(&self) -> String {
        match &self.modbus {
            Some(detail) => {
                let mut s = format!(
                    "{}: {} ({}: {})",
                    self.component,
                    self.message,
                    detail.code.as_str(),
                    detail.description
                );
                if let Some(exc) = detail.exception {
                    s.push_str(&format!(
                        ", exception 0x{:02X} {}",
                        exc,
                        exception_description(exc)
                    ));
                }
                s
            },
            None => self.to_string(),
        }
    }
}
