//! Raw image source
//!
//! The loader only needs a named, page-aligned byte buffer. Where the bytes
//! come from (ramdisk, block device, boot module) is the caller's business.

use core::fmt;

use crate::kernel::mm::types::is_page_aligned;
use crate::kernel::process::elf_loader::ElfError;

/// A named, page-aligned executable image
#[derive(Clone, Copy)]
pub struct File<'a> {
    name: &'a str,
    buf: &'a [u8],
}

impl<'a> File<'a> {
    /// Wrap an image buffer
    ///
    /// # Errors
    ///
    /// [`ElfError::ImageNotPageAligned`] if `buf` does not start on a page boundary.
    pub fn new(name: &'a str, buf: &'a [u8]) -> Result<Self, ElfError> {
        if !is_page_aligned(buf.as_ptr() as u64) {
            return Err(ElfError::ImageNotPageAligned);
        }
        Ok(Self { name, buf })
    }

    /// File name, for logs
    pub const fn name(&self) -> &'a str {
        self.name
    }

    /// Image bytes
    pub const fn buf(&self) -> &'a [u8] {
        self.buf
    }

    /// Image size in bytes
    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the image is empty
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl fmt::Debug for File<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("len", &self.buf.len())
            .finish()
    }
}
