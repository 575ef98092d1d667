//! Test doubles: a deferred-completion mock transport and a scripted
//! bootloader device model behind it.
//!
//! The mock mirrors the pump model of the real RTU master: `send_*`
//! queues the exchange and `pump_one` completes it against the device
//! model, so tests can observe in-flight states and drive completion at
//! exact points.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::TransportErrorCode;
use crate::protocol::{DataUnit, FILE_REF_TYPE, MAX_PDU_SIZE, Pdu, RegisterClass, function};
use crate::transport::{ExchangeError, ExchangeReply, LinkState, Transport, TransportEvents};

/// Initial geometry of the scripted device.
pub(crate) struct BootDeviceConfig {
    pub flash_size_kb: u16,
    pub page_size: u16,
}

/// 256 KB flash, 2048-byte pages — the geometry the documented scenarios
/// use.
pub(crate) fn boot_device_defaults() -> BootDeviceConfig {
    BootDeviceConfig {
        flash_size_kb: 256,
        page_size: 2048,
    }
}

/// One handled request, for asserting operation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceOp {
    ReadRegister { address: u16 },
    SetPage(u16),
    ErasePage(u16),
    ReadRecords { page: u16, rec_num: u16, rec_len: u16 },
    WriteRecords { page: u16, rec_num: u16, rec_len: u16 },
}

/// State of the scripted bootloader device.
#[derive(Debug, Clone)]
pub(crate) struct BootDeviceState {
    pub flash_size_kb: u16,
    pub page_size: u16,
    pub page_number: u16,
    pub erase_coil: u16,
    pub flash: Vec<u8>,
    pub ops: Vec<DeviceOp>,
}

impl BootDeviceState {
    fn new(config: &BootDeviceConfig) -> Self {
        Self {
            flash_size_kb: config.flash_size_kb,
            page_size: config.page_size,
            page_number: 0,
            erase_coil: 0,
            flash: vec![0; usize::from(config.flash_size_kb) * 1024],
            ops: Vec::new(),
        }
    }
}

enum MockPayload {
    Raw(Pdu),
    Read(DataUnit),
    Write(DataUnit),
}

struct MockExchange {
    payload: MockPayload,
    reply: Rc<ExchangeReply>,
}

/// Deferred-completion transport over the scripted device.
pub(crate) struct MockTransport {
    state: Cell<LinkState>,
    events: TransportEvents,
    pending: RefCell<VecDeque<MockExchange>>,
    device: RefCell<BootDeviceState>,
    fail_next: RefCell<Option<(ExchangeError, Option<Pdu>)>>,
    override_next_raw: RefCell<Option<Pdu>>,
    last_server: Cell<Option<u8>>,
}

impl MockTransport {
    /// Unconnected transport over the default device.
    pub fn new() -> Rc<Self> {
        Self::build(boot_device_defaults(), LinkState::Unconnected)
    }

    /// Connected transport over the default device.
    pub fn connected() -> Rc<Self> {
        Self::build(boot_device_defaults(), LinkState::Connected)
    }

    /// Connected transport over a device with the given geometry.
    pub fn with_device(config: BootDeviceConfig) -> Rc<Self> {
        Self::build(config, LinkState::Connected)
    }

    fn build(config: BootDeviceConfig, state: LinkState) -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(state),
            events: TransportEvents::new(),
            pending: RefCell::new(VecDeque::new()),
            device: RefCell::new(BootDeviceState::new(&config)),
            fail_next: RefCell::new(None),
            override_next_raw: RefCell::new(None),
            last_server: Cell::new(None),
        })
    }

    /// Number of exchanges waiting for completion.
    pub fn pending_exchanges(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Server address of the most recently queued exchange.
    pub fn last_server(&self) -> Option<u8> {
        self.last_server.get()
    }

    /// Snapshot of the device state (flash image, request log, ...).
    pub fn device_state(&self) -> BootDeviceState {
        self.device.borrow().clone()
    }

    /// Seed the device's flash at `offset` (relative to flash base).
    pub fn seed_flash(&self, offset: usize, bytes: &[u8]) {
        let mut device = self.device.borrow_mut();
        device.flash[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Fail the next pumped exchange with `error` (and an optional raw
    /// response, e.g. a device exception).
    pub fn fail_next(&self, error: ExchangeError, raw: Option<Pdu>) {
        *self.fail_next.borrow_mut() = Some((error, raw));
    }

    /// Answer the next raw exchange with `pdu` instead of the device
    /// model's response.
    pub fn override_next_raw(&self, pdu: Pdu) {
        *self.override_next_raw.borrow_mut() = Some(pdu);
    }

    /// Complete the oldest pending exchange. Returns `false` when none
    /// was pending.
    pub fn pump_one(&self) -> bool {
        let Some(exchange) = self.pending.borrow_mut().pop_front() else {
            return false;
        };

        if let Some((error, raw)) = self.fail_next.borrow_mut().take() {
            exchange.reply.finish_err(error, raw);
            return true;
        }

        let outcome = {
            let mut device = self.device.borrow_mut();
            match &exchange.payload {
                MockPayload::Read(unit) => handle_register_read(&mut device, unit),
                MockPayload::Write(unit) => handle_register_write(&mut device, unit),
                MockPayload::Raw(pdu) => {
                    let overridden = self.override_next_raw.borrow_mut().take();
                    match overridden {
                        Some(response) => Ok((Some(response), Vec::new())),
                        None => handle_raw(&mut device, pdu),
                    }
                },
            }
        };

        // The reply cascade may queue further exchanges; no borrow may be
        // held while completing.
        match outcome {
            Ok((raw, values)) => exchange.reply.finish_ok(raw, values),
            Err(error) => exchange.reply.finish_err(error, None),
        }

        true
    }

    /// Pump until no exchange is pending.
    pub fn pump_all(&self) {
        while self.pump_one() {}
    }

    fn queue(&self, payload: MockPayload, server: u8) -> Option<Rc<ExchangeReply>> {
        if self.state.get() != LinkState::Connected {
            return None;
        }
        self.last_server.set(Some(server));
        let reply = Rc::new(ExchangeReply::pending());
        self.pending.borrow_mut().push_back(MockExchange {
            payload,
            reply: Rc::clone(&reply),
        });
        Some(reply)
    }
}

impl Transport for MockTransport {
    fn state(&self) -> LinkState {
        self.state.get()
    }

    fn connect_link(&self) -> bool {
        if self.state.get() != LinkState::Unconnected {
            return false;
        }
        self.state.set(LinkState::Connecting);
        self.events.state_changed.emit(&LinkState::Connecting);
        self.state.set(LinkState::Connected);
        self.events.state_changed.emit(&LinkState::Connected);
        true
    }

    fn disconnect_link(&self) {
        if self.state.get() == LinkState::Unconnected {
            return;
        }
        self.state.set(LinkState::Closing);
        self.events.state_changed.emit(&LinkState::Closing);

        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for exchange in pending {
            exchange.reply.finish_err(
                ExchangeError::new(TransportErrorCode::Aborted, "link disconnected"),
                None,
            );
        }

        self.state.set(LinkState::Unconnected);
        self.events.state_changed.emit(&LinkState::Unconnected);
    }

    fn max_pdu_size(&self) -> usize {
        MAX_PDU_SIZE
    }

    fn send_raw(&self, pdu: Pdu, server: u8) -> Option<Rc<ExchangeReply>> {
        self.queue(MockPayload::Raw(pdu), server)
    }

    fn send_read(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>> {
        self.queue(MockPayload::Read(unit), server)
    }

    fn send_write(&self, unit: DataUnit, server: u8) -> Option<Rc<ExchangeReply>> {
        self.queue(MockPayload::Write(unit), server)
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

type MockResult = Result<(Option<Pdu>, Vec<u16>), ExchangeError>;

fn protocol_error(description: impl Into<String>) -> ExchangeError {
    ExchangeError::new(TransportErrorCode::Protocol, description)
}

fn handle_register_read(device: &mut BootDeviceState, unit: &DataUnit) -> MockResult {
    let mut values = Vec::with_capacity(unit.values.len());
    for i in 0..unit.count() {
        let address = unit.address + i;
        device.ops.push(DeviceOp::ReadRegister { address });
        let value = match (unit.class, address) {
            (RegisterClass::InputRegisters, 0x0001) => device.flash_size_kb,
            (RegisterClass::InputRegisters, 0x0002) => device.page_size,
            (RegisterClass::HoldingRegisters, 0x0001) => device.page_number,
            (RegisterClass::Coils, 0x0001) => device.erase_coil,
            _ => return Err(protocol_error(format!("unmapped register {address:#06x}"))),
        };
        values.push(value);
    }
    Ok((None, values))
}

fn handle_register_write(device: &mut BootDeviceState, unit: &DataUnit) -> MockResult {
    for (i, &value) in unit.values.iter().enumerate() {
        let address = unit.address + i as u16;
        match (unit.class, address) {
            (RegisterClass::HoldingRegisters, 0x0001) => {
                device.page_number = value;
                device.ops.push(DeviceOp::SetPage(value));
            },
            (RegisterClass::Coils, 0x0001) => {
                device.erase_coil = value;
                if value != 0 {
                    let page = device.page_number;
                    let start = usize::from(page) * usize::from(device.page_size);
                    let end = start + usize::from(device.page_size);
                    if end > device.flash.len() {
                        return Err(protocol_error(format!("erase beyond flash: page {page}")));
                    }
                    device.flash[start..end].fill(0xFF);
                    device.ops.push(DeviceOp::ErasePage(page));
                }
            },
            _ => return Err(protocol_error(format!("unmapped register {address:#06x}"))),
        }
    }
    Ok((None, Vec::new()))
}

fn handle_raw(device: &mut BootDeviceState, pdu: &Pdu) -> MockResult {
    match pdu.function {
        function::READ_FILE_RECORD => handle_read_records(device, pdu),
        function::WRITE_FILE_RECORD => handle_write_records(device, pdu),
        other => Err(protocol_error(format!("unsupported function {other:#04x}"))),
    }
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from(data[offset]) << 8 | u16::from(data[offset + 1])
}

fn record_range(device: &BootDeviceState, rec_num: u16, rec_len: u16) -> Result<(usize, usize), ExchangeError> {
    let start = usize::from(device.page_number) * usize::from(device.page_size)
        + usize::from(rec_num) * 2;
    let end = start + usize::from(rec_len) * 2;
    if end > device.flash.len() {
        return Err(protocol_error("record range beyond flash"));
    }
    Ok((start, end))
}

fn handle_read_records(device: &mut BootDeviceState, pdu: &Pdu) -> MockResult {
    if pdu.data.len() != 8 || pdu.data[0] != 7 || pdu.data[1] != FILE_REF_TYPE {
        return Err(protocol_error("malformed read file record request"));
    }
    let rec_num = be_u16(&pdu.data, 4);
    let rec_len = be_u16(&pdu.data, 6);
    let (start, end) = record_range(device, rec_num, rec_len)?;

    device.ops.push(DeviceOp::ReadRecords {
        page: device.page_number,
        rec_num,
        rec_len,
    });

    let resp_len = rec_len * 2 + 1;
    let mut data = Vec::with_capacity(3 + usize::from(rec_len) * 2);
    data.push((resp_len + 1) as u8);
    data.push(resp_len as u8);
    data.push(FILE_REF_TYPE);
    for off in (start..end).step_by(2) {
        // Flash bytes are the little-endian view of the records; words go
        // big-endian on the wire.
        let word = u16::from_le_bytes([device.flash[off], device.flash[off + 1]]);
        data.push((word >> 8) as u8);
        data.push((word & 0xFF) as u8);
    }

    Ok((Some(Pdu::new(function::READ_FILE_RECORD, data)), Vec::new()))
}

fn handle_write_records(device: &mut BootDeviceState, pdu: &Pdu) -> MockResult {
    if pdu.data.len() < 7 || pdu.data[1] != FILE_REF_TYPE {
        return Err(protocol_error("malformed write file record request"));
    }
    let rec_num = be_u16(&pdu.data, 4);
    let rec_len = be_u16(&pdu.data, 6);
    if pdu.data.len() != 8 + usize::from(rec_len) * 2 {
        return Err(protocol_error("write file record length mismatch"));
    }
    let (start, _end) = record_range(device, rec_num, rec_len)?;

    device.ops.push(DeviceOp::WriteRecords {
        page: device.page_number,
        rec_num,
        rec_len,
    });

    for i in 0..usize::from(rec_len) {
        let word = be_u16(&pdu.data, 8 + i * 2);
        let off = start + i * 2;
        device.flash[off] = (word & 0xFF) as u8;
        device.flash[off + 1] = (word >> 8) as u8;
    }

    // Response echoes the request.
    Ok((Some(pdu.clone()), Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_serves_geometry_registers() {
        let transport = MockTransport::connected();
        let reply = transport
            .send_read(
                DataUnit::with_count(RegisterClass::InputRegisters, 0x0001, 2),
                1,
            )
            .unwrap();
        transport.pump_one();
        assert_eq!(reply.values(), vec![256, 2048]);
    }

    #[test]
    fn test_mock_file_record_read() {
        let transport = MockTransport::connected();
        transport.seed_flash(0, &[0x11, 0x22, 0x33, 0x44]);

        // Read two records of page 0 of file 1.
        let request = Pdu::new(
            function::READ_FILE_RECORD,
            vec![7, FILE_REF_TYPE, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02],
        );
        let reply = transport.send_raw(request, 1).unwrap();
        transport.pump_one();

        let response = reply.raw_response().unwrap();
        // data_len, resp_len, ref_type, then records big-endian (flash
        // bytes are the little-endian view).
        assert_eq!(response.data, vec![6, 5, FILE_REF_TYPE, 0x22, 0x11, 0x44, 0x33]);
    }

    #[test]
    fn test_mock_file_record_write_updates_flash() {
        let transport = MockTransport::connected();

        // Write one record (word 0x2211, LE bytes 11 22) at record 1.
        let request = Pdu::new(
            function::WRITE_FILE_RECORD,
            vec![9, FILE_REF_TYPE, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x22, 0x11],
        );
        let reply = transport.send_raw(request, 1).unwrap();
        transport.pump_one();

        assert!(reply.error().is_none());
        let state = transport.device_state();
        assert_eq!(&state.flash[2..4], &[0x11, 0x22]);
        assert_eq!(
            state.ops,
            vec![DeviceOp::WriteRecords {
                page: 0,
                rec_num: 1,
                rec_len: 1
            }]
        );
    }
}
