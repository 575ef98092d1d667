//! Modbus RTU master over a native serial port.
//!
//! Requests are framed as `server address + PDU + CRC16` and answered by
//! exactly one response frame. The master is pump-driven: `send_*` only
//! queues the exchange and returns a pending [`ExchangeReply`];
//! [`RtuMaster::poll`] performs one blocking exchange (write, read with
//! timeout, retry) and completes the reply, which synchronously drives
//! the subscribers' event cascade. Timeout and retry policy for an
//! exchange live here and only here.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::TransportErrorCode;
use crate::protocol::{self, DataUnit, MAX_PDU_SIZE, Pdu, RegisterClass, function};
use crate::transport::{ExchangeError, ExchangeReply, LinkState, Transport, TransportEvents};

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Serial link configuration for the RTU master.
#[derive(Debug, Clone)]
pub struct RtuConfig {
    /// Port name/path (e.g. "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Per-attempt response timeout.
    pub timeout: Duration,
    /// Retries after a timed-out attempt (0 = single attempt).
    pub retries: u32,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(1000),
            retries: 3,
        }
    }
}

impl RtuConfig {
    /// Create a configuration for `port_name` at `baud_rate` with the
    /// remaining fields at their defaults.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }
}

/// Compute the Modbus RTU CRC16 (init 0xFFFF, reflected poly 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

enum ExchangeKind {
    Raw,
    Read { class: RegisterClass, count: u16 },
    Write,
}

struct PendingExchange {
    server: u8,
    request: Pdu,
    kind: ExchangeKind,
    reply: Rc<ExchangeReply>,
}

struct RtuInner {
    port: Option<Box<dyn serialport::SerialPort>>,
    pending: VecDeque<PendingExchange>,
}

/// Modbus RTU master over the `serialport` crate.
pub struct RtuMaster {
    config: RtuConfig,
    state: Cell<LinkState>,
    inner: RefCell<RtuInner>,
    events: TransportEvents,
}

impl RtuMaster {
    /// Create an unconnected master for `config`.
    pub fn new(config: RtuConfig) -> Rc<Self> {
        Rc::new(Self {
            config,
            state: Cell::new(LinkState::Unconnected),
            inner: RefCell::new(RtuInner {
                port: None,
                pending: VecDeque::new(),
            }),
            events: TransportEvents::new(),
        })
    }

    /// The configuration this master was created with.
    pub fn config(&self) -> &RtuConfig {
        &self.config
    }

    /// Number of exchanges waiting to be performed.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Perform the next queued exchange, if any, completing its reply.
    ///
    /// Returns `false` when no exchange was pending. Completing the reply
    /// delivers its `finished` signal before `poll` returns, so a new
    /// exchange queued by a subscriber is picked up by the next call.
    pub fn poll(&self) -> bool {
        let Some(exchange) = self.inner.borrow_mut().pending.pop_front() else {
            return false;
        };

        let outcome = self.perform(&exchange);

        // The reply cascade may call back into send_*; no inner borrow
        // may be held here.
        match outcome {
            Ok((raw, values)) => exchange.reply.finish_ok(raw, values),
            Err((error, raw)) => exchange.reply.finish_err(error, raw),
        }

        true
    }

    fn set_state(&self, state: LinkState) {
        if self.state.get() == state {
            return;
        }
        self.state.set(state);
        self.events.state_changed.emit(&state);
    }

    /// One full request/response exchange with retries.
    #[allow(clippy::type_complexity)]
    fn perform(
        &self,
        exchange: &PendingExchange,
    ) -> Result<(Option<Pdu>, Vec<u16>), (ExchangeError, Option<Pdu>)> {
        let frame = build_frame(exchange.server, &exchange.request);

        let attempts = self.config.retries + 1;
        let mut last_error =
            ExchangeError::new(TransportErrorCode::Timeout, "no response from device");

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(
                    "RtuMaster: retrying exchange (attempt {attempt}/{attempts}, function 0x{:02X})",
                    exchange.request.function
                );
            }

            let result = {
                let mut inner = self.inner.borrow_mut();
                let Some(port) = inner.port.as_mut() else {
                    return Err((
                        ExchangeError::new(TransportErrorCode::Connection, "link is not open"),
                        None,
                    ));
                };
                write_then_read(port.as_mut(), &frame, self.config.timeout)
            };

            match result {
                Ok(response) => {
                    return self.decode_response(exchange, &response);
                },
                Err(error) => {
                    trace!("RtuMaster: attempt {attempt} failed: {}", error.description);
                    last_error = error;
                },
            }
        }

        Err((last_error, None))
    }

    /// Validate the response frame and decode it per the request kind.
    #[allow(clippy::type_complexity)]
    fn decode_response(
        &self,
        exchange: &PendingExchange,
        response: &[u8],
    ) -> Result<(Option<Pdu>, Vec<u16>), (ExchangeError, Option<Pdu>)> {
        let pdu = parse_frame(exchange.server, response)
            .map_err(|description| (ExchangeError::new(TransportErrorCode::Protocol, description), None))?;

        if pdu.is_exception() {
            let exc = pdu.exception_code().unwrap_or(0);
            let description = format!(
                "device exception 0x{exc:02X}: {}",
                crate::error::exception_description(exc)
            );
            return Err((
                ExchangeError::new(TransportErrorCode::Protocol, description),
                Some(pdu),
            ));
        }

        if pdu.function != exchange.request.function {
            return Err((
                ExchangeError::new(
                    TransportErrorCode::Protocol,
                    format!(
                        "function code mismatch: sent 0x{:02X}, got 0x{:02X}",
                        exchange.request.function, pdu.function
                    ),
                ),
                Some(pdu),
            ));
        }

        match &exchange.kind {
            ExchangeKind::Raw => Ok((Some(pdu), Vec::new())),
            ExchangeKind::Write => Ok((Some(pdu), Vec::new())),
            ExchangeKind::Read { class, count } => {
                let values = decode_read_values(*class, *count, &pdu).map_err(|description| {
                    (
                        ExchangeError::new(TransportErrorCode::Protocol, description),
                        Some(pdu.clone()),
                    )
                })?;
                Ok((Some(pdu), values))
            },
        }
    }

    fn queue_exchange(&self, kind: ExchangeKind, request: Pdu, server: u8) -> Option<Rc<ExchangeReply>> {
        if self.state.get() != LinkState::Connected {
            return None;
        }
        if request.len() > MAX_PDU_SIZE {
            warn!(
                "RtuMaster: request PDU of {} bytes exceeds the {MAX_PDU_SIZE}-byte limit",
                request.len()
            );
            return None;
        }

        let reply = Rc::new(ExchangeReply::pending());
        self.inner.borrow_mut().pending.push_back(PendingExchange {
            server,
            request,
            kind,
            reply: Rc::clone(&reply),
        });
        Some(reply)
    }
}

impl Transport for RtuMaster {
    fn state(&self) -> LinkState {
        self.state.get()
    }

    fn connect_link(&self) -> bool {
        if self.state.get() != LinkState::Unconnected {
            return false;
        }

        self.set_state(LinkState::Connecting);

        let builder = serialport::new(&self.config.port_name, self.config.baud_rate)
            .data_bits(match self.config.data_bits {
                DataBits::Seven => serialport::DataBits::Seven,
                DataBits::Eight => serialport::DataBits::Eight,
            })
            .parity(match self.config.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .stop_bits(match self.config.stop_bits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            })
            .timeout(self.config.timeout);

        match builder.open() {
            Ok(port) => {
                debug!("RtuMaster: opened {}", self.config.port_name);
                self.inner.borrow_mut().port = Some(port);
                self.set_state(LinkState::Connected);
                true
            },
            Err(e) => {
                warn!("RtuMaster: failed to open {}: {e}", self.config.port_name);
                self.set_state(LinkState::Unconnected);
                self.events.error.emit(&ExchangeError::new(
                    TransportErrorCode::Connection,
                    format!("failed to open {}: {e}", self.config.port_name),
                ));
                false
            },
        }
    }

    fn disconnect_link(&self) {
        if self.state.get() == LinkState::Unconnected {
            return;
        }

        self.set_state(LinkState::Closing);

        let pending = {
            let mut inner = self.inner.borrow_mut();
            inner.port = None;
            std::mem::take(&mut inner.pending)
        };

        // Abort every queued exchange after releasing the borrow; the
        // replies' subscribers may call back in.
        for exchange in pending {
            exchange.reply.finish_err(
                ExchangeError::new(TransportErrorCode::Aborted, "link disconnected"),
                None,
            );
        }

        self.set_state(LinkState::Unconnected);
    }

    fn max_pdu_size(&self) -> usize {
        MAX_PDU_SIZE
    }

    fn send_raw(&self, pdu: Pdu, server: u8) -> Option<Rc<ExchangeReply>> {
        self.queue_exchange(ExchangeKind::Raw, pdu, server)
    }

    fn send_read(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>> {
        let request = encode_read_request(&unit);
        self.queue_exchange(
            ExchangeKind::Read {
                class: unit.class,
                count: unit.count(),
            },
            request,
            server,
        )
    }

    fn send_write(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>> {
        if !unit.class.is_writable() {
            warn!("RtuMaster: write request for a read-only register class");
            return None;
        }
        let request = encode_write_request(&unit);
        self.queue_exchange(ExchangeKind::Write, request, server)
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

/// `server address + PDU + CRC16`, CRC low byte first.
fn build_frame(server: u8, pdu: &Pdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(server);
    frame.push(pdu.function);
    frame.extend_from_slice(&pdu.data);
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Validate address and CRC, return the response PDU.
fn parse_frame(server: u8, frame: &[u8]) -> Result<Pdu, String> {
    if frame.len() < 5 {
        return Err(format!("response frame too short: {} bytes", frame.len()));
    }

    let crc_received =
        u16::from(frame[frame.len() - 2]) | (u16::from(frame[frame.len() - 1]) << 8);
    let crc_computed = crc16(&frame[..frame.len() - 2]);
    if crc_received != crc_computed {
        return Err(format!(
            "CRC mismatch: expected 0x{crc_computed:04X}, got 0x{crc_received:04X}"
        ));
    }

    if frame[0] != server {
        return Err(format!(
            "response from unexpected server address {} (expected {server})",
            frame[0]
        ));
    }

    Ok(Pdu::new(frame[1], frame[2..frame.len() - 2].to_vec()))
}

/// Expected total frame length once enough header bytes arrived, or
/// `None` if more bytes are needed to tell.
fn expected_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let func = buf[1];

    if func & function::EXCEPTION_FLAG != 0 {
        // server + func + exception code + CRC
        return Some(5);
    }

    match func {
        function::READ_COILS
        | function::READ_DISCRETE_INPUTS
        | function::READ_HOLDING_REGISTERS
        | function::READ_INPUT_REGISTERS
        | function::READ_FILE_RECORD
        | function::WRITE_FILE_RECORD => {
            // server + func + byte count + payload + CRC
            buf.get(2).map(|&count| 3 + usize::from(count) + 2)
        },
        function::WRITE_SINGLE_COIL
        | function::WRITE_SINGLE_REGISTER
        | function::WRITE_MULTIPLE_COILS
        | function::WRITE_MULTIPLE_REGISTERS => Some(8),
        _ => {
            // Unknown function: consume what arrives until the read times
            // out, then let CRC validation reject it.
            None
        },
    }
}

/// Write the request frame and accumulate the response until a complete
/// frame arrived or the timeout elapsed.
fn write_then_read(
    port: &mut dyn serialport::SerialPort,
    frame: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ExchangeError> {
    let _ = port.clear(serialport::ClearBuffer::All);

    port.write_all(frame)
        .and_then(|()| port.flush())
        .map_err(|e| ExchangeError::new(TransportErrorCode::Write, e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut response = Vec::with_capacity(MAX_PDU_SIZE + 3);
    let mut chunk = [0u8; 256];

    loop {
        if let Some(expected) = expected_frame_len(&response) {
            if response.len() >= expected {
                response.truncate(expected);
                return Ok(response);
            }
        }

        if Instant::now() >= deadline {
            if response.is_empty() {
                return Err(ExchangeError::new(
                    TransportErrorCode::Timeout,
                    "no response from device",
                ));
            }
            // A partial or unknown-function frame; hand it to CRC
            // validation.
            return Ok(response);
        }

        match port.read(&mut chunk) {
            Ok(0) => {},
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) => {
                return Err(ExchangeError::new(TransportErrorCode::Read, e.to_string()));
            },
        }
    }
}

fn encode_read_request(unit: &DataUnit) -> Pdu {
    let mut data = Vec::with_capacity(4);
    protocol::put_u16_be(&mut data, unit.address);
    protocol::put_u16_be(&mut data, unit.count());
    Pdu::new(unit.class.read_function(), data)
}

fn encode_write_request(unit: &DataUnit) -> Pdu {
    match unit.class {
        RegisterClass::Coils if unit.count() == 1 => {
            let mut data = Vec::with_capacity(4);
            protocol::put_u16_be(&mut data, unit.address);
            protocol::put_u16_be(&mut data, if unit.values[0] != 0 { 0xFF00 } else { 0x0000 });
            Pdu::new(function::WRITE_SINGLE_COIL, data)
        },
        RegisterClass::Coils => {
            let count = unit.count();
            let byte_count = usize::from(count).div_ceil(8);
            let mut data = Vec::with_capacity(5 + byte_count);
            protocol::put_u16_be(&mut data, unit.address);
            protocol::put_u16_be(&mut data, count);
            data.push(byte_count as u8);
            let mut bits = vec![0u8; byte_count];
            for (i, &value) in unit.values.iter().enumerate() {
                if value != 0 {
                    bits[i / 8] |= 1 << (i % 8);
                }
            }
            data.extend_from_slice(&bits);
            Pdu::new(function::WRITE_MULTIPLE_COILS, data)
        },
        _ if unit.count() == 1 => {
            let mut data = Vec::with_capacity(4);
            protocol::put_u16_be(&mut data, unit.address);
            protocol::put_u16_be(&mut data, unit.values[0]);
            Pdu::new(function::WRITE_SINGLE_REGISTER, data)
        },
        _ => {
            let count = unit.count();
            let mut data = Vec::with_capacity(5 + usize::from(count) * 2);
            protocol::put_u16_be(&mut data, unit.address);
            protocol::put_u16_be(&mut data, count);
            data.push((count * 2) as u8);
            for &value in &unit.values {
                protocol::put_u16_be(&mut data, value);
            }
            Pdu::new(function::WRITE_MULTIPLE_REGISTERS, data)
        },
    }
}

fn decode_read_values(class: RegisterClass, count: u16, pdu: &Pdu) -> Result<Vec<u16>, String> {
    let byte_count = usize::from(*pdu.data.first().ok_or("empty read response")?);
    let payload = pdu
        .data
        .get(1..1 + byte_count)
        .ok_or_else(|| format!("read response shorter than its byte count {byte_count}"))?;

    if class.is_bit() {
        let expected = usize::from(count).div_ceil(8);
        if byte_count != expected {
            return Err(format!(
                "bit read byte count {byte_count}, expected {expected}"
            ));
        }
        Ok((0..usize::from(count))
            .map(|i| u16::from(payload[i / 8] >> (i % 8) & 1))
            .collect())
    } else {
        if byte_count != usize::from(count) * 2 {
            return Err(format!(
                "register read byte count {byte_count}, expected {}",
                count * 2
            ));
        }
        Ok((0..usize::from(count))
            .map(|i| protocol::get_u16_be(payload, i * 2).unwrap_or(0))
            .collect())
    }
}
