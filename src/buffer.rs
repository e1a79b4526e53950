//! Growable byte store for emitted machine code.
//!
//! A [`CodeBuffer`] only grows at its tail (the write cursor, or "high-water
//! mark"); bytes below the cursor can be overwritten in place but the cursor
//! never moves backwards. Multi-byte values are written in the byte order
//! fixed at construction. Once [`CodeBuffer::close`] has run, the buffer is
//! frozen: any further write is an encoder bug and panics.

use crate::result::{CodegenError, CodegenResult};
use crate::{CodeOffset, trace};
use smallvec::SmallVec;
use target_lexicon::Endianness;

/// Width of a single value written to or read from a [`CodeBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataWidth {
    /// One byte.
    B1,
    /// Two bytes.
    B2,
    /// Four bytes.
    B4,
    /// Eight bytes.
    B8,
}

impl DataWidth {
    /// Number of bytes covered by this width.
    pub const fn bytes(self) -> CodeOffset {
        match self {
            DataWidth::B1 => 1,
            DataWidth::B2 => 2,
            DataWidth::B4 => 4,
            DataWidth::B8 => 8,
        }
    }
}

/// Convert a buffer length to a code offset. Offsets are 32 bits wide; a
/// buffer growing past that is fatal.
fn offset_of(len: usize) -> CodeOffset {
    CodeOffset::try_from(len)
        .unwrap_or_else(|_| panic!("code buffer grew past {} bytes", CodeOffset::MAX))
}

/// A buffer of emitted code bytes.
///
/// This struct uses a `SmallVec` so that small functions are emitted without
/// any heap allocation. As such, it is about a kilobyte large; keep it
/// short-lived or reuse it through [`CodeBuffer::reset`].
#[derive(Clone, Debug)]
pub struct CodeBuffer {
    /// The written bytes. `data.len()` is the write cursor.
    data: SmallVec<[u8; 1024]>,
    /// Byte order of multi-byte values.
    endianness: Endianness,
    /// The architecture no-op used to pad for alignment.
    padding: SmallVec<[u8; 4]>,
    /// Size of the code at close; `None` while the buffer is open.
    final_size: Option<CodeOffset>,
}

impl CodeBuffer {
    /// Create an empty buffer writing values in `endianness` byte order and
    /// padding with copies of `padding`.
    pub fn new(endianness: Endianness, padding: &[u8]) -> CodeBuffer {
        CodeBuffer::with_capacity(endianness, padding, 0)
    }

    /// Like [`CodeBuffer::new`] but reserves room for `capacity` bytes up front.
    pub fn with_capacity(endianness: Endianness, padding: &[u8], capacity: usize) -> CodeBuffer {
        assert!(!padding.is_empty(), "padding sequence must not be empty");
        let mut data = SmallVec::new();
        data.reserve(capacity);
        CodeBuffer {
            data,
            endianness,
            padding: SmallVec::from_slice(padding),
            final_size: None,
        }
    }

    /// Byte order of multi-byte values in this buffer.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Current offset from start of buffer; the write cursor.
    pub fn cur_offset(&self) -> CodeOffset {
        offset_of(self.data.len())
    }

    /// Has [`CodeBuffer::close`] been called?
    pub fn is_closed(&self) -> bool {
        self.final_size.is_some()
    }

    /// The bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    fn check_open(&self) {
        assert!(!self.is_closed(), "cannot emit after close");
    }

    /// Check that `n` more bytes keep every offset addressable.
    fn check_room(&self, n: usize) {
        offset_of(self.data.len() + n);
    }

    fn encode(&self, width: DataWidth, value: u64) -> SmallVec<[u8; 8]> {
        let n = width.bytes() as usize;
        match self.endianness {
            Endianness::Little => SmallVec::from_slice(&value.to_le_bytes()[..n]),
            Endianness::Big => SmallVec::from_slice(&value.to_be_bytes()[8 - n..]),
        }
    }

    /// Append the low `width` bytes of `value` at the write cursor.
    pub fn emit(&mut self, width: DataWidth, value: u64) {
        self.check_open();
        self.check_room(width.bytes() as usize);
        let bytes = self.encode(width, value);
        self.data.extend_from_slice(&bytes);
    }

    /// Add a byte.
    pub fn put1(&mut self, value: u8) {
        self.emit(DataWidth::B1, value.into());
    }

    /// Add 2 bytes.
    pub fn put2(&mut self, value: u16) {
        self.emit(DataWidth::B2, value.into());
    }

    /// Add 4 bytes.
    pub fn put4(&mut self, value: u32) {
        self.emit(DataWidth::B4, value.into());
    }

    /// Add 8 bytes.
    pub fn put8(&mut self, value: u64) {
        self.emit(DataWidth::B8, value);
    }

    /// Add a slice of bytes, verbatim.
    pub fn put_data(&mut self, data: &[u8]) {
        self.check_open();
        self.check_room(data.len());
        self.data.extend_from_slice(data);
    }

    /// Overwrite `width` bytes at `offset` with the low bytes of `value`.
    ///
    /// The whole range must already have been written; the write cursor does
    /// not move.
    pub fn emit_at(&mut self, width: DataWidth, value: u64, offset: CodeOffset) {
        self.check_open();
        let end = offset as u64 + u64::from(width.bytes());
        assert!(
            end <= u64::from(self.cur_offset()),
            "patch at offset {offset} of width {} beyond write cursor {}",
            width.bytes(),
            self.cur_offset()
        );
        let bytes = self.encode(width, value);
        self.data[offset as usize..end as usize].copy_from_slice(&bytes);
    }

    /// Read back `width` already-written bytes at `offset`.
    pub fn read(&self, width: DataWidth, offset: CodeOffset) -> u64 {
        let n = width.bytes() as usize;
        let start = offset as usize;
        assert!(
            start + n <= self.data.len(),
            "read at offset {offset} of width {n} beyond write cursor {}",
            self.cur_offset()
        );
        let bytes = &self.data[start..start + n];
        match self.endianness {
            Endianness::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            Endianness::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }

    /// Read back one byte.
    pub fn read_u8(&self, offset: CodeOffset) -> u8 {
        self.read(DataWidth::B1, offset) as u8
    }

    /// Read back two bytes.
    pub fn read_u16(&self, offset: CodeOffset) -> u16 {
        self.read(DataWidth::B2, offset) as u16
    }

    /// Read back four bytes.
    pub fn read_u32(&self, offset: CodeOffset) -> u32 {
        self.read(DataWidth::B4, offset) as u32
    }

    /// Read back eight bytes.
    pub fn read_u64(&self, offset: CodeOffset) -> u64 {
        self.read(DataWidth::B8, offset)
    }

    /// Pad with the no-op sequence until the cursor is a multiple of
    /// `align_to`, which must be a power of two.
    pub fn align_to(&mut self, align_to: CodeOffset) {
        trace!("CodeBuffer: align to {}", align_to);
        assert!(
            align_to.is_power_of_two(),
            "{} is not a power of two",
            align_to
        );
        self.check_open();
        let gap = (align_to - (self.cur_offset() & (align_to - 1))) & (align_to - 1);
        assert!(
            gap as usize % self.padding.len() == 0,
            "cannot pad {gap} bytes with {}-byte no-ops",
            self.padding.len()
        );
        self.check_room(gap as usize);
        while self.cur_offset() & (align_to - 1) != 0 {
            self.data.extend_from_slice(&self.padding);
        }
    }

    /// Freeze the buffer and return its contents.
    ///
    /// If `alignment` is nonzero the code is first padded to a multiple of it.
    /// With `trim` the result is exactly [`CodeBuffer::cur_offset`] bytes long;
    /// without it the whole backing storage is returned, zero-filled past the
    /// cursor. The returned vector is a copy: nothing done to the buffer
    /// afterwards can change it.
    pub fn close(&mut self, trim: bool, alignment: CodeOffset) -> CodegenResult<Vec<u8>> {
        self.check_open();
        if alignment > 0 {
            self.align_to(alignment);
        }
        let size = CodeOffset::try_from(self.data.len()).map_err(|_| CodegenError::CodeTooLarge)?;
        self.final_size = Some(size);
        trace!("CodeBuffer: closed at {} bytes (trim: {})", size, trim);

        let mut code = self.data.to_vec();
        if !trim {
            code.resize(self.data.capacity().max(self.data.len()), 0);
        }
        Ok(code)
    }

    /// Size of the code as of [`CodeBuffer::close`].
    pub fn final_code_size(&self) -> CodeOffset {
        self.final_size.expect("final code size requested before close")
    }

    /// Clear content and cursor so the buffer can be reused for an unrelated
    /// compilation. The byte order and padding are kept.
    pub fn reset(&mut self) {
        self.data.clear();
        self.final_size = None;
    }
}
