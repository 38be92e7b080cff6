// src/kernel/process/binary_reader.rs
//! Little-endian field reader for executable images
//!
//! Image buffers come from storage and carry no alignment guarantee for their
//! inner structures, so headers are decoded field by field instead of by
//! casting pointers.

/// Cursor over a byte slice
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a reader positioned at the start of `data`
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Create a reader over `data[offset..offset + len]`
    ///
    /// Returns `None` if the window does not fit in `data`.
    pub fn window(data: &'a [u8], offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        data.get(offset..end).map(Self::new)
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.offset.checked_add(N)?;
        let bytes: [u8; N] = self.data.get(self.offset..end)?.try_into().ok()?;
        self.offset = end;
        Some(bytes)
    }

    /// Read a u16
    pub fn read_u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    /// Read a u32
    pub fn read_u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    /// Read a u64
    pub fn read_u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    /// Read a fixed-size byte array
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take()
    }

    /// Skip `count` bytes (the end of the data is a valid position)
    pub fn skip(&mut self, count: usize) -> Option<()> {
        let end = self.offset.checked_add(count)?;
        if end > self.data.len() {
            return None;
        }
        self.offset = end;
        Some(())
    }
}
