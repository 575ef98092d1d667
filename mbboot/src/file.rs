//! Read/Write File Record transfers, chunked to the link's PDU size.
//!
//! A [`File`] is a device-defined numbered file; a [`FileRegion`] is a
//! record range within it backed by a word buffer. Reading or writing a
//! region issues as many wire exchanges as needed: each chunk carries at
//! most as many records as fit in one PDU after the fixed header
//! overhead of the function in use.
//!
//! Region operations on the same file queue up; a failing region is
//! dropped from the queue and reported without blocking the ones behind
//! it.
//!
//! The region's byte view packs words little-endian (an odd final byte
//! is the low byte of the last word); the wire carries record words
//! big-endian.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::warn;

use crate::device::Device;
use crate::error::Error;
use crate::message::Message;
use crate::protocol::{FILE_REF_TYPE, Pdu, function};
use crate::signal::Signal;

const COMPONENT: &str = "File";

/// Fixed PDU overhead of a Read File Record exchange: function code,
/// data length, response length and reference type.
const READ_OVERHEAD: usize = 4;

/// Fixed PDU overhead of a Write File Record exchange: function code,
/// data length, reference type, file number, record number and record
/// length.
const WRITE_OVERHEAD: usize = 9;

/// Events a file emits, carrying the affected region.
#[derive(Debug, Default)]
pub struct FileEvents {
    /// A region read completed.
    pub region_read: Signal<Rc<FileRegion>>,
    /// A region write completed.
    pub region_written: Signal<Rc<FileRegion>>,
    /// A region operation failed.
    pub error: Signal<(Rc<FileRegion>, Error)>,
}

/// Events a region emits.
#[derive(Debug, Default)]
pub struct FileRegionEvents {
    /// The region's buffer holds the data read from the device.
    pub data_read: Signal<()>,
    /// The region's buffer was written to the device.
    pub data_written: Signal<()>,
    /// The operation on this region failed.
    pub error: Signal<Error>,
}

/// A record range within a device file, backed by a word buffer.
pub struct FileRegion {
    weak_self: Weak<Self>,
    file: RefCell<Weak<File>>,
    record_number: Cell<u16>,
    records: RefCell<Vec<u16>>,
    events: FileRegionEvents,
}

impl FileRegion {
    /// Create a region of `count` records starting at `record_number`.
    pub fn new(file: &Rc<File>, record_number: u16, count: u16) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            file: RefCell::new(Rc::downgrade(file)),
            record_number: Cell::new(record_number),
            records: RefCell::new(vec![0; usize::from(count)]),
            events: FileRegionEvents::default(),
        })
    }

    /// Event channels.
    pub fn events(&self) -> &FileRegionEvents {
        &self.events
    }

    /// Start record number within the file.
    pub fn record_number(&self) -> u16 {
        self.record_number.get()
    }

    /// Set the start record number.
    pub fn set_record_number(&self, record_number: u16) {
        self.record_number.set(record_number);
    }

    /// Number of records in the region.
    pub fn records_count(&self) -> u16 {
        self.records.borrow().len() as u16
    }

    /// Resize the region.
    pub fn set_records_count(&self, count: u16) {
        self.records.borrow_mut().resize(usize::from(count), 0);
    }

    /// The record words.
    pub fn records(&self) -> Vec<u16> {
        self.records.borrow().clone()
    }

    /// Replace the record words.
    pub fn set_records(&self, records: Vec<u16>) {
        *self.records.borrow_mut() = records;
    }

    /// Little-endian byte view of the records.
    pub fn data(&self) -> Vec<u8> {
        let records = self.records.borrow();
        let mut bytes = Vec::with_capacity(records.len() * 2);
        for &word in records.iter() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Fill the records from a little-endian byte view, resizing to the
    /// number of records needed to hold all bytes. An odd final byte
    /// becomes the low byte of the last word.
    pub fn set_data(&self, data: &[u8]) {
        let recs_count = (data.len() + 1) / 2;
        let whole = data.len() / 2;

        let mut records = self.records.borrow_mut();
        records.resize(recs_count, 0);

        for i in 0..whole {
            records[i] = u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]);
        }

        if recs_count != whole {
            records[recs_count - 1] = u16::from(data[data.len() - 1]);
        }
    }

    /// Launch a read of this region through its file.
    pub fn read(&self) -> bool {
        let Some(this) = self.weak_self.upgrade() else {
            return false;
        };
        match self.file.borrow().upgrade() {
            Some(file) => file.read_region(&this),
            None => false,
        }
    }

    /// Launch a write of this region through its file.
    pub fn write(&self) -> bool {
        let Some(this) = self.weak_self.upgrade() else {
            return false;
        };
        match self.file.borrow().upgrade() {
            Some(file) => file.write_region(&this),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpDirection {
    Read,
    Write,
}

/// A queued region operation with its chunk cursor.
struct RegionOp {
    region: Rc<FileRegion>,
    direction: OpDirection,
    cur_index: u16,
    cur_count: u16,
}

impl RegionOp {
    fn new(region: Rc<FileRegion>, direction: OpDirection) -> Self {
        Self {
            region,
            direction,
            cur_index: 0,
            cur_count: 0,
        }
    }

    fn done(&self) -> bool {
        u32::from(self.cur_index) + u32::from(self.cur_count)
            >= u32::from(self.region.records_count())
    }

    fn remaining(&self) -> u16 {
        self.region.records_count().saturating_sub(self.cur_index)
    }

    /// Records per chunk, bounded by the PDU size minus the function's
    /// fixed header overhead.
    fn max_records(&self, max_pdu: usize) -> u16 {
        let overhead = match self.direction {
            OpDirection::Read => READ_OVERHEAD,
            OpDirection::Write => WRITE_OVERHEAD,
        };
        (max_pdu.saturating_sub(overhead) / 2).min(usize::from(u16::MAX)) as u16
    }

    /// Advance past the previous chunk and size the next one.
    fn advance(&mut self, max_pdu: usize) {
        self.cur_index += self.cur_count;
        self.cur_count = self.remaining().min(self.max_records(max_pdu));
    }

    /// Record number on the wire: the region's start record plus the
    /// chunk offset.
    fn wire_record(&self) -> u16 {
        self.region.record_number().wrapping_add(self.cur_index)
    }

    /// Build the request for the current chunk, or `None` when the chunk
    /// is empty or out of range.
    fn request(&self, file_number: u16) -> Option<Pdu> {
        if self.cur_count == 0 {
            return None;
        }

        match self.direction {
            OpDirection::Read => {
                let mut data = Vec::with_capacity(8);
                data.push(7); // ref_type + file_num + rec_num + rec_len
                data.push(FILE_REF_TYPE);
                data.extend_from_slice(&file_number.to_be_bytes());
                data.extend_from_slice(&self.wire_record().to_be_bytes());
                data.extend_from_slice(&self.cur_count.to_be_bytes());
                Some(Pdu::new(function::READ_FILE_RECORD, data))
            },
            OpDirection::Write => {
                let last = usize::from(self.cur_index) + usize::from(self.cur_count);
                let records = self.region.records();
                if last > records.len() {
                    return None;
                }

                let mut data = Vec::with_capacity(8 + usize::from(self.cur_count) * 2);
                data.push(7 + (self.cur_count * 2) as u8);
                data.push(FILE_REF_TYPE);
                data.extend_from_slice(&file_number.to_be_bytes());
                data.extend_from_slice(&self.wire_record().to_be_bytes());
                data.extend_from_slice(&self.cur_count.to_be_bytes());
                for &word in &records[usize::from(self.cur_index)..last] {
                    data.extend_from_slice(&word.to_be_bytes());
                }
                Some(Pdu::new(function::WRITE_FILE_RECORD, data))
            },
        }
    }

    /// Validate a read response chunk and store its records into the
    /// region buffer at the chunk offset.
    fn store_read(&self, pdu: &Pdu) -> bool {
        if self.direction != OpDirection::Read {
            return false;
        }
        if pdu.data.len() < 3 {
            return false;
        }

        let data_len = pdu.data[0];
        let resp_len = pdu.data[1];
        let ref_type = pdu.data[2];

        if ref_type != FILE_REF_TYPE {
            return false;
        }
        // Only single sub-requests are issued, so the group length must
        // account for the whole response.
        if resp_len != data_len.wrapping_sub(1) {
            return false;
        }

        let record_bytes = usize::from(resp_len).saturating_sub(1);
        if record_bytes != usize::from(self.cur_count) * 2 {
            return false;
        }
        if pdu.data.len() < 3 + record_bytes {
            return false;
        }

        let last = usize::from(self.cur_index) + usize::from(self.cur_count);
        if last > usize::from(self.region.records_count()) {
            return false;
        }

        let mut records = self.region.records.borrow_mut();
        for i in 0..usize::from(self.cur_count) {
            let off = 3 + i * 2;
            records[usize::from(self.cur_index) + i] =
                u16::from(pdu.data[off]) << 8 | u16::from(pdu.data[off + 1]);
        }

        true
    }
}

/// A numbered file on the device, transferring regions chunk by chunk.
pub struct File {
    weak_self: Weak<Self>,
    device: Rc<Device>,
    file_number: Cell<u16>,
    queue: RefCell<VecDeque<RegionOp>>,
    events: FileEvents,
}

impl File {
    /// Create a handle to file `file_number` on `device`.
    pub fn new(device: Rc<Device>, file_number: u16) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            device,
            file_number: Cell::new(file_number),
            queue: RefCell::new(VecDeque::new()),
            events: FileEvents::default(),
        })
    }

    /// Event channels.
    pub fn events(&self) -> &FileEvents {
        &self.events
    }

    /// The device-defined file number.
    pub fn file_number(&self) -> u16 {
        self.file_number.get()
    }

    /// Change the file number.
    pub fn set_file_number(&self, file_number: u16) {
        self.file_number.set(file_number);
    }

    /// Queue a read of `region`; starts immediately if no operation is in
    /// progress on this file. Fails when the device has no valid link.
    pub fn read_region(&self, region: &Rc<FileRegion>) -> bool {
        self.queue_op(region, OpDirection::Read)
    }

    /// Queue a write of `region`; starts immediately if no operation is
    /// in progress on this file. Fails when the device has no valid link.
    pub fn write_region(&self, region: &Rc<FileRegion>) -> bool {
        self.queue_op(region, OpDirection::Write)
    }

    fn queue_op(&self, region: &Rc<FileRegion>, direction: OpDirection) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        let need_start = {
            let mut queue = self.queue.borrow_mut();
            let was_empty = queue.is_empty();
            queue.push_back(RegionOp::new(Rc::clone(region), direction));
            was_empty
        };

        if need_start {
            self.do_next_region_op();
        }

        true
    }

    /// Advance the head operation's cursor and dispatch its next chunk,
    /// dropping operations whose chunk cannot be formed.
    fn do_next_region_op(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        loop {
            {
                let mut queue = self.queue.borrow_mut();
                let Some(op) = queue.front_mut() else {
                    return false;
                };
                op.advance(self.device.max_pdu_size());
            }

            if self.process_head() {
                break;
            }

            let failed = self.queue.borrow_mut().pop_front();
            if let Some(op) = failed {
                self.region_op_fail(&op, Error::general(COMPONENT, "invalid file operation"));
            }
        }

        true
    }

    /// Build and send the message for the head operation's current chunk.
    fn process_head(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        let request = {
            let queue = self.queue.borrow();
            let Some(op) = queue.front() else {
                return false;
            };
            op.request(self.file_number.get())
        };

        let Some(request) = request else {
            return false;
        };

        let msg = Message::raw(request);

        let weak = self.weak_self.clone();
        let weak_msg = Rc::downgrade(&msg);
        msg.events().success.connect(move |()| {
            if let (Some(file), Some(msg)) = (weak.upgrade(), weak_msg.upgrade()) {
                file.on_region_msg_success(&msg);
            }
        });
        let weak = self.weak_self.clone();
        msg.events().error.connect(move |error| {
            if let Some(file) = weak.upgrade() {
                file.on_region_msg_error(error.clone());
            }
        });

        self.device.send_msg(&msg)
    }

    fn on_region_msg_success(&self, msg: &Message) {
        if !msg.is_sent() {
            return;
        }

        if self.queue.borrow().is_empty() {
            warn!("File: chunk completion with empty queue");
            return;
        }

        let Some(reply) = msg.reply() else {
            warn!("File: chunk completion with no reply");
            self.fail_head(Error::state(COMPONENT, "reply is missing"));
            return;
        };

        if reply.error().is_some() {
            self.fail_head(Error::state(COMPONENT, "reply has an error"));
            return;
        }

        let stored = {
            let queue = self.queue.borrow();
            let op = &queue[0];
            match op.direction {
                OpDirection::Read => reply
                    .raw_response()
                    .is_some_and(|pdu| op.store_read(&pdu)),
                OpDirection::Write => true,
            }
        };

        if !stored {
            self.fail_head(Error::general(COMPONENT, "invalid read result"));
            return;
        }

        let completed = {
            let mut queue = self.queue.borrow_mut();
            if queue[0].done() {
                queue.pop_front()
            } else {
                None
            }
        };

        if let Some(op) = completed {
            self.region_op_success(&op);
        }

        self.do_next_region_op();
    }

    fn on_region_msg_error(&self, error: Error) {
        if self.queue.borrow().is_empty() {
            warn!("File: chunk error with empty queue");
            return;
        }

        self.fail_head(error);
    }

    /// Drop the head operation, report its failure and move on to the
    /// next queued operation.
    fn fail_head(&self, error: Error) {
        let failed = self.queue.borrow_mut().pop_front();
        if let Some(op) = failed {
            self.region_op_fail(&op, error);
        }
        self.do_next_region_op();
    }

    fn region_op_success(&self, op: &RegionOp) {
        match op.direction {
            OpDirection::Read => {
                op.region.events.data_read.emit(&());
                self.events.region_read.emit(&op.region);
            },
            OpDirection::Write => {
                op.region.events.data_written.emit(&());
                self.events.region_written.emit(&op.region);
            },
        }
    }

    fn region_op_fail(&self, op: &RegionOp, error: Error) {
        op.region.events.error.emit(&error);
        self.events
            .error
            .emit(&(Rc::clone(&op.region), error));
    }
}
