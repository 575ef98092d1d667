//! Modbus wire types shared by the core and the transport.
//!
//! A [`Pdu`] is the function-code-plus-payload portion of an exchange,
//! independent of transport framing. A [`DataUnit`] describes a block of
//! registers of one [`RegisterClass`] for the common register read/write
//! requests the transport knows how to encode itself.

use byteorder::{BigEndian, ByteOrder};

/// Maximum size of a protocol data unit in bytes (fixed protocol
/// constant).
pub const MAX_PDU_SIZE: usize = 253;

/// File-record reference type. The only reference type this device
/// dialect supports.
pub const FILE_REF_TYPE: u8 = 0x06;

/// Standard Modbus function codes used by this crate.
pub mod function {
    /// Read Coils.
    pub const READ_COILS: u8 = 0x01;
    /// Read Discrete Inputs.
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    /// Read Holding Registers.
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    /// Read Input Registers.
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    /// Write Single Coil.
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    /// Write Single Register.
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    /// Write Multiple Coils.
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    /// Write Multiple Registers.
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    /// Read File Record.
    pub const READ_FILE_RECORD: u8 = 0x14;
    /// Write File Record.
    pub const WRITE_FILE_RECORD: u8 = 0x15;

    /// Bit set on the function code of an exception response.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// A protocol data unit: function code plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Function code.
    pub function: u8,
    /// Payload following the function code.
    pub data: Vec<u8>,
}

impl Pdu {
    /// Create a PDU from a function code and payload.
    pub fn new(function: u8, data: Vec<u8>) -> Self {
        Self { function, data }
    }

    /// Whether this PDU is an exception response.
    pub fn is_exception(&self) -> bool {
        self.function & function::EXCEPTION_FLAG != 0
    }

    /// The exception code, if this is an exception response.
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Total encoded length in bytes (function code + payload).
    pub fn len(&self) -> usize {
        1 + self.data.len()
    }

    /// Whether the PDU carries no payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Class of device memory a register block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    /// Read/write single-bit flags.
    Coils,
    /// Read-only single-bit inputs.
    DiscreteInputs,
    /// Read/write 16-bit registers.
    HoldingRegisters,
    /// Read-only 16-bit registers.
    InputRegisters,
}

impl RegisterClass {
    /// Function code used to read this class.
    pub fn read_function(self) -> u8 {
        match self {
            Self::Coils => function::READ_COILS,
            Self::DiscreteInputs => function::READ_DISCRETE_INPUTS,
            Self::HoldingRegisters => function::READ_HOLDING_REGISTERS,
            Self::InputRegisters => function::READ_INPUT_REGISTERS,
        }
    }

    /// Whether values of this class are single bits.
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    /// Whether this class accepts writes.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Coils | Self::HoldingRegisters)
    }
}

/// A block of register values of one class.
///
/// Bit classes (coils, discrete inputs) still store one word per entry;
/// any non-zero word writes the bit as ON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUnit {
    /// Register class.
    pub class: RegisterClass,
    /// Start address of the block.
    pub address: u16,
    /// One word per register/bit.
    pub values: Vec<u16>,
}

impl DataUnit {
    /// A block of `count` zeroed values (the shape of a read request).
    pub fn with_count(class: RegisterClass, address: u16, count: u16) -> Self {
        Self {
            class,
            address,
            values: vec![0; usize::from(count)],
        }
    }

    /// A block carrying `values` (the shape of a write request).
    pub fn with_values(class: RegisterClass, address: u16, values: Vec<u16>) -> Self {
        Self {
            class,
            address,
            values,
        }
    }

    /// Number of registers/bits in the block.
    pub fn count(&self) -> u16 {
        self.values.len() as u16
    }
}

/// Append a big-endian word to a buffer (wire field order).
pub fn put_u16_be(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Read a big-endian word at `offset`, if in range.
pub fn get_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(BigEndian::read_u16)
}
