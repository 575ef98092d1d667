//! Firmware update orchestrator.
//!
//! Turns an arbitrary (address, length) byte range into a sequence of
//! page-aligned, word-aligned file-record operations against the
//! bootloader's memory map: per page, a chain writes the page-number
//! register, (for writes) triggers the page erase coil, then transfers
//! the page file region. The requested range may start and end on odd
//! addresses; the word containing each edge is transferred whole and the
//! extra byte clipped (reads) or padded with the erased-flash value
//! (writes).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::chain::{OperationChain, Step};
use crate::device::Device;
use crate::error::Error;
use crate::file::{File, FileRegion};
use crate::protocol::RegisterClass;
use crate::register::Register;
use crate::signal::Signal;

const COMPONENT: &str = "FirmwareEngine";

// Bootloader memory map.

/// Input register holding the flash size in kilobytes.
pub const INPUT_REG_FLASH_SIZE: u16 = 0x0001;
/// Input register holding the flash page size in bytes.
pub const INPUT_REG_PAGE_SIZE: u16 = 0x0002;
/// Holding register selecting the current page.
pub const HOLD_REG_PAGE_NUMBER: u16 = 0x0001;
/// Coil triggering erasure of the selected page.
pub const COIL_PAGE_ERASE: u16 = 0x0001;
/// File number of the page-transfer file.
pub const FILE_PAGE: u16 = 0x0001;
/// Base address of the device's flash in its memory map.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Flash geometry read from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    /// Flash size in kilobytes.
    pub flash_size_kb: u32,
    /// Page size in bytes (a power of two).
    pub page_size: u32,
}

impl Geometry {
    /// Whether both values have been read.
    pub fn is_known(&self) -> bool {
        self.flash_size_kb != 0 && self.page_size != 0
    }

    /// Flash size in bytes.
    pub fn flash_size_bytes(&self) -> u32 {
        self.flash_size_kb * 1024
    }

    /// Number of pages.
    pub fn pages_count(&self) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        self.flash_size_bytes() / self.page_size
    }

    /// Page number containing `addr`. Addresses below the flash base are
    /// treated as offsets into flash.
    pub fn page_number(&self, mut addr: u32) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        if addr >= FLASH_BASE {
            addr -= FLASH_BASE;
        }
        addr / self.page_size
    }

    /// Memory-map address of page `page`.
    pub fn page_address(&self, page: u32) -> u32 {
        FLASH_BASE + page * self.page_size
    }

    /// `addr` rounded down to its page start (page size is a power of
    /// two).
    pub fn page_aligned_address(&self, addr: u32) -> u32 {
        addr & !(self.page_size - 1)
    }
}

/// Direction of the running iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpType {
    Read,
    Write,
}

/// Cursor of one read/write iteration over a byte range.
///
/// `completed` counts payload bytes already transferred; the remaining
/// fields describe the chunk currently on the wire: the page it lies in,
/// the record range covering it, and how many edge bytes of that record
/// range fall outside the requested byte range (`skip_before` and
/// `skip_after`, each 0 or 1 since records are 2-byte words).
#[derive(Debug, Default)]
struct IterCursor {
    running: bool,
    buffer: Vec<u8>,

    address: u32,
    size: u32,
    completed: u32,

    page: u32,
    rec_num: u32,
    rec_count: u32,
    skip_before: u32,
    skip_after: u32,
}

impl IterCursor {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Recompute the chunk for the current byte offset. Every record of
    /// the chunk lies within one page, and the record range fully covers
    /// the chunk's byte range including partial boundary words.
    fn update(&mut self, geom: Geometry) {
        let op_addr = self.address + self.completed;

        self.page = geom.page_number(op_addr);

        let page_addr = geom.page_address(self.page);
        let page_addr_next = geom.page_address(self.page + 1);

        self.rec_num = (op_addr - page_addr) / 2;
        self.skip_before = op_addr % 2;

        let op_size = (self.size - self.completed).min(page_addr_next - op_addr);
        let op_addr_end = op_addr + op_size;
        self.skip_after = op_addr_end % 2;

        let rec_end = (op_addr_end - page_addr + self.skip_after) / 2;
        self.rec_count = rec_end - self.rec_num;
    }

    fn begin(&mut self, geom: Geometry, address: u32, size: u32) {
        self.reset();

        self.address = address;
        self.size = size;

        self.update(geom);

        self.running = true;
    }

    fn end(&mut self) {
        self.running = false;
    }

    fn done(&self) -> bool {
        self.completed >= self.size
    }

    /// Payload bytes covered by the current chunk.
    fn step_size(&self) -> u32 {
        self.rec_count * 2 - self.skip_before - self.skip_after
    }

    fn next(&mut self, geom: Geometry) {
        self.completed += self.step_size();
        self.update(geom);
    }

    /// Append a read chunk to the output buffer, clipping the boundary
    /// words' extra bytes to the requested range.
    fn append_read(&mut self, chunk: &[u8]) {
        let skip = (self.skip_before + self.skip_after) as usize;
        if chunk.len() > skip {
            let end = chunk.len() - self.skip_after as usize;
            self.buffer
                .extend_from_slice(&chunk[self.skip_before as usize..end]);
        }
    }

    /// The current chunk's wire payload: the source bytes for its range,
    /// with the boundary words' extra bytes padded with the erased-flash
    /// value.
    fn write_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.rec_count as usize * 2);
        payload.resize(self.skip_before as usize, 0xFF);

        let start = self.completed as usize;
        let end = (self.completed + self.step_size()) as usize;
        payload.extend_from_slice(&self.buffer[start..end.min(self.buffer.len())]);

        payload.resize(payload.len() + self.skip_after as usize, 0xFF);
        payload
    }
}

/// Lazily created device objects shared by the iterations.
#[derive(Default)]
struct OpObjects {
    reg_flash_size: Option<Rc<Register>>,
    reg_page_size: Option<Rc<Register>>,
    reg_page_num: Option<Rc<Register>>,
    coil_page_erase: Option<Rc<Register>>,
    file_page: Option<Rc<File>>,
    region_page: Option<Rc<FileRegion>>,
    conf_chain: Option<Rc<OperationChain>>,
    iter_chain: Option<Rc<OperationChain>>,
}

/// Events the engine emits.
#[derive(Debug, Default)]
pub struct FirmwareEvents {
    /// The flash geometry was read.
    pub conf_read: Signal<()>,
    /// Reading the flash geometry failed.
    pub conf_read_error: Signal<Error>,

    /// A data read completed; carries the accumulated bytes.
    pub data_read: Signal<Vec<u8>>,
    /// A data read failed.
    pub data_read_error: Signal<Error>,
    /// A data read was canceled.
    pub data_read_canceled: Signal<()>,

    /// A data write completed.
    pub data_written: Signal<()>,
    /// A data write failed.
    pub data_write_error: Signal<Error>,
    /// A data write was canceled.
    pub data_write_canceled: Signal<()>,

    /// Progress bounds for the running iteration: (min, max) in bytes.
    pub progress_range: Signal<(u32, u32)>,
    /// Bytes completed so far.
    pub progress: Signal<u32>,
}

/// Orchestrates firmware reads and writes over the bootloader's Modbus
/// surface.
pub struct FirmwareEngine {
    weak_self: Weak<Self>,
    device: Rc<Device>,
    objects: RefCell<OpObjects>,
    cursor: RefCell<IterCursor>,
    op_type: Cell<Option<OpType>>,
    events: FirmwareEvents,
}

impl FirmwareEngine {
    /// Create an engine for `device`.
    pub fn new(device: Rc<Device>) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            device,
            objects: RefCell::new(OpObjects::default()),
            cursor: RefCell::new(IterCursor::default()),
            op_type: Cell::new(None),
            events: FirmwareEvents::default(),
        })
    }

    /// Event channels.
    pub fn events(&self) -> &FirmwareEvents {
        &self.events
    }

    /// Whether the flash geometry has been read.
    pub fn is_conf_read(&self) -> bool {
        self.objects
            .borrow()
            .conf_chain
            .as_ref()
            .is_some_and(|chain| chain.is_done())
    }

    /// Whether a read/write iteration is in progress.
    pub fn is_executing(&self) -> bool {
        self.objects
            .borrow()
            .iter_chain
            .as_ref()
            .is_some_and(|chain| chain.is_executing())
    }

    /// Flash size in kilobytes (0 until the geometry is read).
    pub fn flash_size(&self) -> u32 {
        self.objects
            .borrow()
            .reg_flash_size
            .as_ref()
            .map_or(0, |reg| u32::from(reg.value()))
    }

    /// Page size in bytes (0 until the geometry is read).
    pub fn page_size(&self) -> u32 {
        self.objects
            .borrow()
            .reg_page_size
            .as_ref()
            .map_or(0, |reg| u32::from(reg.value()))
    }

    /// The device's flash geometry.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            flash_size_kb: self.flash_size(),
            page_size: self.page_size(),
        }
    }

    /// Number of flash pages.
    pub fn pages_count(&self) -> u32 {
        self.geometry().pages_count()
    }

    /// Page number containing `addr`.
    pub fn page_number(&self, addr: u32) -> u32 {
        self.geometry().page_number(addr)
    }

    /// Memory-map address of page `page`.
    pub fn page_address(&self, page: u32) -> u32 {
        self.geometry().page_address(page)
    }

    /// `addr` rounded down to its page start.
    pub fn page_aligned_address(&self, addr: u32) -> u32 {
        self.geometry().page_aligned_address(addr)
    }

    /// Base address of the requested byte range.
    pub fn data_address(&self) -> u32 {
        self.cursor.borrow().address
    }

    /// Total size of the requested byte range.
    pub fn data_size(&self) -> u32 {
        self.cursor.borrow().size
    }

    /// The iteration buffer: accumulated bytes of a read, source bytes of
    /// a write.
    pub fn data(&self) -> Vec<u8> {
        self.cursor.borrow().buffer.clone()
    }

    /// Read the flash geometry: a two-step chain reading the flash-size
    /// and page-size input registers. Completion arrives via the
    /// `conf_read`/`conf_read_error` events.
    pub fn conf_read(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }

        let chain = {
            let mut objects = self.objects.borrow_mut();

            if objects.reg_flash_size.is_none() {
                objects.reg_flash_size = Some(Register::single(
                    Rc::clone(&self.device),
                    RegisterClass::InputRegisters,
                    INPUT_REG_FLASH_SIZE,
                ));
            }
            if objects.reg_page_size.is_none() {
                objects.reg_page_size = Some(Register::single(
                    Rc::clone(&self.device),
                    RegisterClass::InputRegisters,
                    INPUT_REG_PAGE_SIZE,
                ));
            }

            if objects.conf_chain.is_none() {
                let chain = OperationChain::new();

                for reg in [
                    objects.reg_flash_size.as_ref().unwrap(),
                    objects.reg_page_size.as_ref().unwrap(),
                ] {
                    let reg_exec = Rc::clone(reg);
                    chain.append(Step::new(
                        reg.events().data_read.clone(),
                        reg.events().error.clone(),
                        move || reg_exec.read(),
                    ));
                }

                let weak = self.weak_self.clone();
                chain.events().success.connect(move |()| {
                    if let Some(engine) = weak.upgrade() {
                        engine.events.conf_read.emit(&());
                    }
                });
                let weak = self.weak_self.clone();
                chain.events().fail.connect(move |error| {
                    if let Some(engine) = weak.upgrade() {
                        engine.events.conf_read_error.emit(error);
                    }
                });

                objects.conf_chain = Some(chain);
            }

            Rc::clone(objects.conf_chain.as_ref().unwrap())
        };

        if !chain.exec() {
            self.events
                .conf_read_error
                .emit(&Error::general(COMPONENT, "error executing configuration chain"));
            return false;
        }

        true
    }

    /// Read `size` bytes starting at `address`. Rejected while the
    /// geometry is unknown, an iteration is executing, or a prior
    /// cursor is still running. The result arrives via `data_read`.
    pub fn read_data(&self, address: u32, size: u32) -> bool {
        if !self.begin_allowed() {
            return false;
        }
        if !self.range_valid(address, size) {
            return false;
        }

        self.create_read_objects();
        self.build_iter_chain(OpType::Read);

        let geom = self.geometry();
        {
            let mut cursor = self.cursor.borrow_mut();
            cursor.begin(geom, address, size);
        }

        self.events.progress_range.emit(&(0, size));
        self.events.progress.emit(&0);

        self.iter_chain_next();

        true
    }

    /// Write `bytes` starting at `address`. Rejected while the geometry
    /// is unknown, an iteration is executing, or a prior cursor is still
    /// running. Every touched page is erased before it is rewritten;
    /// completion arrives via `data_written`.
    pub fn write_data(&self, address: u32, bytes: &[u8]) -> bool {
        if !self.begin_allowed() {
            return false;
        }
        if !self.range_valid(address, bytes.len() as u32) {
            return false;
        }

        self.create_write_objects();
        self.build_iter_chain(OpType::Write);

        let geom = self.geometry();
        let size = bytes.len() as u32;
        {
            let mut cursor = self.cursor.borrow_mut();
            cursor.begin(geom, address, size);
            cursor.buffer = bytes.to_vec();
        }

        self.events.progress_range.emit(&(0, size));
        self.events.progress.emit(&0);

        self.iter_chain_next();

        true
    }

    /// Request cancellation of the running iteration; honored at the
    /// next page boundary.
    pub fn cancel(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }
        let chain = {
            let objects = self.objects.borrow();
            match objects.iter_chain.as_ref() {
                Some(chain) => Rc::clone(chain),
                None => return false,
            }
        };
        if !chain.is_executing() {
            return false;
        }
        if !self.cursor.borrow().running {
            return false;
        }

        chain.cancel()
    }

    /// A non-empty byte range lying entirely within the device's flash.
    fn range_valid(&self, address: u32, size: u32) -> bool {
        if size == 0 {
            return false;
        }
        let Some(end) = address.checked_add(size) else {
            return false;
        };
        address >= FLASH_BASE && end <= FLASH_BASE + self.geometry().flash_size_bytes()
    }

    fn begin_allowed(&self) -> bool {
        if !self.device.is_valid() {
            return false;
        }
        if self.is_executing() {
            return false;
        }
        if self.cursor.borrow().running {
            return false;
        }
        if !self.geometry().is_known() {
            debug!("FirmwareEngine: read/write before geometry is known");
            return false;
        }
        true
    }

    fn create_op_objects(&self) {
        let mut objects = self.objects.borrow_mut();

        if objects.reg_page_num.is_none() {
            objects.reg_page_num = Some(Register::single(
                Rc::clone(&self.device),
                RegisterClass::HoldingRegisters,
                HOLD_REG_PAGE_NUMBER,
            ));
        }

        if objects.file_page.is_none() {
            objects.file_page = Some(File::new(Rc::clone(&self.device), FILE_PAGE));
        }

        if objects.region_page.is_none() {
            objects.region_page = Some(FileRegion::new(objects.file_page.as_ref().unwrap(), 0, 0));
        }

        if objects.iter_chain.is_none() {
            objects.iter_chain = Some(OperationChain::new());
        }
    }

    fn create_read_objects(&self) {
        self.create_op_objects();
    }

    fn create_write_objects(&self) {
        self.create_op_objects();

        let mut objects = self.objects.borrow_mut();
        if objects.coil_page_erase.is_none() {
            let coil = Register::single(
                Rc::clone(&self.device),
                RegisterClass::Coils,
                COIL_PAGE_ERASE,
            );
            coil.set_value(1);
            objects.coil_page_erase = Some(coil);
        }
    }

    /// (Re)build the iteration chain when the direction changed or the
    /// chain is empty; its events are (re)connected on creation of the
    /// chain only, the steps on every rebuild.
    fn build_iter_chain(&self, op_type: OpType) {
        let objects = self.objects.borrow();
        let chain = Rc::clone(objects.iter_chain.as_ref().unwrap());

        let needs_rebuild = self.op_type.get() != Some(op_type) || chain.is_empty();

        if self.op_type.get().is_none() {
            // First use: hook the chain outcome to the engine.
            let weak = self.weak_self.clone();
            chain.events().success.connect(move |()| {
                if let Some(engine) = weak.upgrade() {
                    engine.iter_chain_success();
                }
            });
            let weak = self.weak_self.clone();
            chain.events().fail.connect(move |error| {
                if let Some(engine) = weak.upgrade() {
                    engine.iter_chain_fail(error.clone());
                }
            });
            let weak = self.weak_self.clone();
            chain.events().canceled.connect(move |()| {
                if let Some(engine) = weak.upgrade() {
                    engine.iter_chain_canceled();
                }
            });
        }

        if needs_rebuild {
            chain.clear();

            let reg_page_num = Rc::clone(objects.reg_page_num.as_ref().unwrap());
            let page_num_exec = Rc::clone(&reg_page_num);
            chain.append(Step::new(
                reg_page_num.events().data_written.clone(),
                reg_page_num.events().error.clone(),
                move || page_num_exec.write(),
            ));

            if op_type == OpType::Write {
                let coil = Rc::clone(objects.coil_page_erase.as_ref().unwrap());
                let coil_exec = Rc::clone(&coil);
                chain.append(Step::new(
                    coil.events().data_written.clone(),
                    coil.events().error.clone(),
                    move || coil_exec.write(),
                ));
            }

            let region = Rc::clone(objects.region_page.as_ref().unwrap());
            let region_exec = Rc::clone(&region);
            match op_type {
                OpType::Read => {
                    chain.append(Step::new(
                        region.events().data_read.clone(),
                        region.events().error.clone(),
                        move || region_exec.read(),
                    ));
                },
                OpType::Write => {
                    chain.append(Step::new(
                        region.events().data_written.clone(),
                        region.events().error.clone(),
                        move || region_exec.write(),
                    ));
                },
            }
        }

        drop(objects);
        self.op_type.set(Some(op_type));
    }

    /// Push the cursor's chunk into the shared objects and execute the
    /// chain for one page chunk.
    fn iter_chain_next(&self) {
        let chain = {
            let objects = self.objects.borrow();
            let cursor = self.cursor.borrow();

            let reg_page_num = objects.reg_page_num.as_ref().unwrap();
            reg_page_num.set_value(cursor.page as u16);

            let region = objects.region_page.as_ref().unwrap();
            region.set_record_number(cursor.rec_num as u16);
            region.set_records_count(cursor.rec_count as u16);

            if self.op_type.get() == Some(OpType::Write) {
                region.set_data(&cursor.write_payload());
            }

            Rc::clone(objects.iter_chain.as_ref().unwrap())
        };

        if !chain.exec() {
            self.iter_chain_fail(Error::general(COMPONENT, "error executing iteration chain"));
        }
    }

    fn iter_chain_success(&self) {
        let Some(op_type) = self.op_type.get() else {
            warn!("FirmwareEngine: iteration completion without an operation");
            return;
        };

        let geom = self.geometry();
        let (progress, finished) = {
            let mut cursor = self.cursor.borrow_mut();

            if op_type == OpType::Read {
                let chunk = {
                    let objects = self.objects.borrow();
                    objects.region_page.as_ref().unwrap().data()
                };
                cursor.append_read(&chunk);
            }

            cursor.next(geom);

            let finished = cursor.done();
            if finished {
                cursor.end();
            }
            (cursor.completed, finished)
        };

        self.events.progress.emit(&progress);

        if finished {
            match op_type {
                OpType::Read => {
                    let buffer = self.cursor.borrow().buffer.clone();
                    self.events.data_read.emit(&buffer);
                },
                OpType::Write => self.events.data_written.emit(&()),
            }
        } else {
            self.iter_chain_next();
        }
    }

    fn iter_chain_fail(&self, error: Error) {
        let index = self
            .objects
            .borrow()
            .iter_chain
            .as_ref()
            .map_or(0, |chain| chain.current_index());
        debug!("FirmwareEngine: iteration chain failed at step {index}");

        self.cursor.borrow_mut().end();

        match self.op_type.get() {
            Some(OpType::Read) => self.events.data_read_error.emit(&error),
            Some(OpType::Write) => self.events.data_write_error.emit(&error),
            None => warn!("FirmwareEngine: iteration failure without an operation"),
        }
    }

    fn iter_chain_canceled(&self) {
        self.cursor.borrow_mut().end();

        match self.op_type.get() {
            Some(OpType::Read) => self.events.data_read_canceled.emit(&()),
            Some(OpType::Write) => self.events.data_write_canceled.emit(&()),
            None => warn!("FirmwareEngine: iteration cancel without an operation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkQueue;
    use crate::testsupport::{BootDeviceConfig, DeviceOp, MockTransport};
    use crate::transport::Transport;

    fn setup() -> (Rc<MockTransport>, Rc<FirmwareEngine>) {
        let transport = MockTransport::with_device(BootDeviceConfig {
            flash_size_kb: 256,
            page_size: 2048,
        });
        let link = LinkQueue::new(Rc::clone(&transport) as Rc<dyn Transport>);
        let device = Device::new(link, 1);
        let engine = FirmwareEngine::new(device);
        (transport, engine)
    }

    fn setup_configured() -> (Rc<MockTransport>, Rc<FirmwareEngine>) {
        let (transport, engine) = setup();
        assert!(engine.conf_read());
        transport.pump_all();
        assert!(engine.is_conf_read());
        (transport, engine)
    }

    #[test]
    fn test_conf_read_reads_geometry() {
        let (transport, engine) = setup();

        let conf = Rc::new(Cell::new(false));
        let conf_clone = Rc::clone(&conf);
        engine.events().conf_read.connect(move |()| conf_clone.set(true));

        assert!(!engine.is_conf_read());
        assert!(engine.conf_read());
        transport.pump_all();

        assert!(conf.get());
        assert!(engine.is_conf_read());
        assert_eq!(engine.flash_size(), 256);
        assert_eq!(engine.page_size(), 2048);
        assert_eq!(engine.pages_count(), 128);
    }

    #[test]
    fn test_page_math_roundtrip() {
        let geom = Geometry {
            flash_size_kb: 256,
            page_size: 2048,
        };
        for page in [0, 1, 7, 127] {
            assert_eq!(geom.page_number(geom.page_address(page)), page);
        }
        assert_eq!(geom.page_aligned_address(0x0800_0801), 0x0800_0800);
        assert_eq!(geom.page_number(0x0800_0801), 1);
    }

    #[test]
    fn test_read_write_rejected_before_conf() {
        let (_transport, engine) = setup();
        assert!(!engine.read_data(FLASH_BASE, 16));
        assert!(!engine.write_data(FLASH_BASE, &[0u8; 16]));
    }

    #[test]
    fn test_out_of_range_requests_rejected() {
        let (_transport, engine) = setup_configured();
        // Below the flash base.
        assert!(!engine.read_data(0, 16));
        // Beyond the end of flash.
        assert!(!engine.read_data(FLASH_BASE + 256 * 1024 - 8, 16));
        assert!(!engine.write_data(FLASH_BASE + 256 * 1024, &[1]));
        // Empty range.
        assert!(!engine.read_data(FLASH_BASE, 0));
    }

    #[test]
    fn test_read_aligned_range() {
        let (transport, engine) = setup_configured();
        transport.seed_flash(0, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        engine
            .events()
            .data_read
            .connect(move |data| *sink.borrow_mut() = Some(data.clone()));

        assert!(engine.read_data(FLASH_BASE, 8));
        transport.pump_all();

        assert_eq!(result.borrow().as_deref(), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
    }

    #[test]
    fn test_read_odd_address_clips_edges() {
        // readData(0x08000801, 4): one page, leading skip 1, trailing
        // skip 1, exactly 4 bytes after trimming.
        let (transport, engine) = setup_configured();
        let mut page1 = vec![0u8; 16];
        for (i, byte) in page1.iter_mut().enumerate() {
            *byte = 0xA0 + i as u8;
        }
        transport.seed_flash(2048, &page1);

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        engine
            .events()
            .data_read
            .connect(move |data| *sink.borrow_mut() = Some(data.clone()));

        assert!(engine.read_data(0x0800_0801, 4));
        transport.pump_all();

        // Bytes at offsets 1..5 of page 1.
        assert_eq!(result.borrow().as_deref(), Some(&[0xA1, 0xA2, 0xA3, 0xA4][..]));

        // The wire carried 3 whole records of page 1 starting at record 0.
        let records: Vec<_> = transport
            .device_state()
            .ops
            .into_iter()
            .filter(|op| matches!(op, DeviceOp::ReadRecords { .. }))
            .collect();
        assert_eq!(
            records,
            vec![DeviceOp::ReadRecords {
                page: 1,
                rec_num: 0,
                rec_len: 3
            }]
        );
    }

    #[test]
    fn test_write_spans_pages_with_erase_order() {
        let (transport, engine) = setup_configured();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let written = Rc::new(Cell::new(false));
        let written_clone = Rc::clone(&written);
        engine
            .events()
            .data_written
            .connect(move |()| written_clone.set(true));

        assert!(engine.write_data(FLASH_BASE, &payload));
        transport.pump_all();
        assert!(written.get());

        // Three pages, each set+erased before any of its records are
        // written, in order.
        let ops: Vec<DeviceOp> = transport
            .device_state()
            .ops
            .into_iter()
            .filter(|op| {
                matches!(
                    op,
                    DeviceOp::SetPage(_) | DeviceOp::ErasePage(_) | DeviceOp::WriteRecords { .. }
                )
            })
            .collect();

        let mut current_page = None;
        let mut pages_seen = Vec::new();
        let mut i = 0;
        while i < ops.len() {
            match ops[i] {
                DeviceOp::SetPage(page) => {
                    assert_eq!(ops[i + 1], DeviceOp::ErasePage(page));
                    current_page = Some(page);
                    pages_seen.push(page);
                    i += 2;
                },
                DeviceOp::WriteRecords { page, .. } => {
                    assert_eq!(Some(page), current_page);
                    i += 1;
                },
                DeviceOp::ErasePage(_) => panic!("erase without preceding page select"),
                _ => unreachable!(),
            }
        }
        assert_eq!(pages_seen, vec![0, 1, 2]);

        // The flash holds the payload.
        assert_eq!(&transport.device_state().flash[..5000], &payload[..]);
    }

    #[test]
    fn test_write_then_read_roundtrip_odd_edges() {
        let (transport, engine) = setup_configured();

        let payload: Vec<u8> = (0..4998u32).map(|i| (i % 247) as u8).collect();
        let address = FLASH_BASE + 2048 + 1; // odd start, odd end

        assert!(engine.write_data(address, &payload));
        transport.pump_all();

        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        engine
            .events()
            .data_read
            .connect(move |data| *sink.borrow_mut() = Some(data.clone()));

        assert!(engine.read_data(address, payload.len() as u32));
        transport.pump_all();

        assert_eq!(result.borrow().as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_progress_is_byte_granular() {
        let (transport, engine) = setup_configured();

        let ranges = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&ranges);
        engine
            .events()
            .progress_range
            .connect(move |range| sink.borrow_mut().push(*range));
        let progress = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&progress);
        engine
            .events()
            .progress
            .connect(move |value| sink.borrow_mut().push(*value));

        assert!(engine.write_data(FLASH_BASE, &vec![0x5A; 5000]));
        transport.pump_all();

        assert_eq!(*ranges.borrow(), vec![(0, 5000)]);
        assert_eq!(*progress.borrow(), vec![0, 2048, 4096, 5000]);
    }

    #[test]
    fn test_reentrant_iteration_rejected() {
        let (transport, engine) = setup_configured();

        assert!(engine.read_data(FLASH_BASE, 64));
        assert!(engine.is_executing());
        assert!(!engine.read_data(FLASH_BASE, 64));
        assert!(!engine.write_data(FLASH_BASE, &[0u8; 4]));

        transport.pump_all();
        assert!(!engine.is_executing());
    }

    #[test]
    fn test_error_aborts_iteration() {
        let (transport, engine) = setup_configured();

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        engine
            .events()
            .data_write_error
            .connect(move |e| sink.borrow_mut().push(e.clone()));

        assert!(engine.write_data(FLASH_BASE, &vec![1u8; 4096]));

        // First exchange (page select of page 0) fails.
        transport.fail_next(
            crate::transport::ExchangeError::new(
                crate::error::TransportErrorCode::Timeout,
                "no response",
            ),
            None,
        );
        transport.pump_all();

        assert_eq!(errors.borrow().len(), 1);
        assert!(!engine.is_executing());
        // No erase or write reached the device.
        assert!(
            transport
                .device_state()
                .ops
                .iter()
                .all(|op| matches!(op, DeviceOp::ReadRegister { .. }))
        );

        // The engine accepts a fresh iteration afterwards.
        assert!(engine.write_data(FLASH_BASE, &vec![1u8; 16]));
        transport.pump_all();
    }

    #[test]
    fn test_cancel_honored_at_page_boundary() {
        let (transport, engine) = setup_configured();

        let canceled = Rc::new(Cell::new(false));
        let canceled_clone = Rc::clone(&canceled);
        engine
            .events()
            .data_write_canceled
            .connect(move |()| canceled_clone.set(true));

        assert!(engine.write_data(FLASH_BASE, &vec![0xEE; 4096]));
        assert!(engine.cancel());

        transport.pump_all();

        assert!(canceled.get());
        assert!(!engine.is_executing());

        // Only the first page's chain ran; cancellation took effect at
        // the boundary.
        let pages: Vec<u16> = transport
            .device_state()
            .ops
            .iter()
            .filter_map(|op| match op {
                DeviceOp::SetPage(page) => Some(*page),
                _ => None,
            })
            .collect();
        assert_eq!(pages, vec![0]);

        // A new iteration can start after the cancel.
        assert!(engine.write_data(FLASH_BASE, &vec![0xEE; 16]));
        transport.pump_all();
    }

    #[test]
    fn test_cancel_rejected_when_idle() {
        let (_transport, engine) = setup_configured();
        assert!(!engine.cancel());
    }
}
