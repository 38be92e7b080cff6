// src/kernel/process/elf_loader.rs
//! ELF (Executable and Linkable Format) header parsing
//!
//! Only statically linked, non-relocatable ELF64 executables for x86_64 are
//! accepted. Headers are decoded with [`BinaryReader`] and never by casting
//! pointers into the image.
//!
//! # Validation order
//!
//! 1. File size (at least one ELF header)
//! 2. Magic number
//! 3. Class (64-bit)
//! 4. Data encoding (little endian)
//! 5. OS ABI (System V)
//! 6. File type (`ET_EXEC`)
//! 7. Machine (x86-64)

use core::fmt;

use bitflags::bitflags;

use crate::constants::MAX_PROGRAM_HEADERS;
use crate::kernel::mm::segment::SegmentKind;
use crate::kernel::process::binary_reader::BinaryReader;

/// ELF magic number (0x7F 'E' 'L' 'F')
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident[EI_CLASS]` for 64-bit objects
pub const ELFCLASS64: u8 = 2;
/// `e_ident[EI_DATA]` for little-endian objects
pub const ELFDATA2LSB: u8 = 1;
/// `e_ident[EI_OSABI]` for System V
pub const ELFOSABI_SYSV: u8 = 0;
/// Executable file type
pub const ET_EXEC: u16 = 2;
/// AMD x86-64
pub const EM_X86_64: u16 = 62;
/// Loadable segment
pub const PT_LOAD: u32 = 1;

/// Size of the ELF64 file header
pub const ELF64_HEADER_SIZE: usize = 64;
/// Size of one ELF64 program header
pub const ELF64_PHDR_SIZE: usize = 56;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_OSABI: usize = 7;

bitflags! {
    /// Program header permission flags (`p_flags`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProgramFlags: u32 {
        /// Execute permission
        const X = 1 << 0;
        /// Write permission
        const W = 1 << 1;
        /// Read permission
        const R = 1 << 2;
    }
}

/// ELF parsing and structural errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Invalid magic number
    InvalidMagic,
    /// Unsupported class (not 64-bit)
    UnsupportedClass,
    /// Unsupported endianness
    UnsupportedEndian,
    /// Unsupported OS ABI (not System V)
    UnsupportedAbi,
    /// Not an executable (`e_type != ET_EXEC`)
    NotExecutable,
    /// Unsupported architecture
    UnsupportedArch,
    /// File too small for its headers
    FileTooSmall,
    /// Image buffer does not start on a page boundary
    ImageNotPageAligned,
    /// Program header table entry size or location is invalid
    InvalidProgramHeader,
    /// More program headers than the loader can hold
    TooManyProgramHeaders,
    /// Loadable segment that is neither code nor data
    UnclassifiableSegment {
        /// Program header index
        index: usize,
        /// Raw `p_flags`
        flags: u32,
    },
    /// Loadable segment that is both writable and executable
    WritableAndExecutable {
        /// Program header index
        index: usize,
    },
    /// Second code or data segment
    DuplicateSegment(SegmentKind),
    /// No code or no data segment
    MissingSegment(SegmentKind),
    /// Segment bytes lie outside the image, or `p_filesz > p_memsz`
    SegmentOutOfBounds {
        /// Program header index
        index: usize,
    },
    /// Segment offset and address disagree modulo the page size
    MisalignedSegment {
        /// Program header index
        index: usize,
    },
    /// User image segment reaches into the kernel half
    SegmentInKernelHalf {
        /// Program header index
        index: usize,
    },
    /// Entry point is not inside the code segment
    EntryOutsideCode,
}

impl ElfError {
    /// Whether this error comes from the file header identification checks
    #[must_use]
    pub const fn is_format_error(self) -> bool {
        matches!(
            self,
            Self::InvalidMagic
                | Self::UnsupportedClass
                | Self::UnsupportedEndian
                | Self::UnsupportedAbi
                | Self::NotExecutable
                | Self::UnsupportedArch
        )
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "not an ELF image"),
            Self::UnsupportedClass => write!(f, "not a 64-bit ELF image"),
            Self::UnsupportedEndian => write!(f, "not a little-endian ELF image"),
            Self::UnsupportedAbi => write!(f, "OS ABI is not System V"),
            Self::NotExecutable => write!(f, "not an executable"),
            Self::UnsupportedArch => write!(f, "machine is not x86-64"),
            Self::FileTooSmall => write!(f, "image is truncated"),
            Self::ImageNotPageAligned => write!(f, "image buffer is not page aligned"),
            Self::InvalidProgramHeader => write!(f, "invalid program header table"),
            Self::TooManyProgramHeaders => {
                write!(f, "more than {MAX_PROGRAM_HEADERS} program headers")
            }
            Self::UnclassifiableSegment { index, flags } => {
                write!(f, "phdr[{index}]: cannot classify flags {flags:#x}")
            }
            Self::WritableAndExecutable { index } => {
                write!(f, "phdr[{index}]: segment is both writable and executable")
            }
            Self::DuplicateSegment(kind) => write!(f, "more than one {kind} segment"),
            Self::MissingSegment(kind) => write!(f, "no {kind} segment"),
            Self::SegmentOutOfBounds { index } => {
                write!(f, "phdr[{index}]: segment bytes out of bounds")
            }
            Self::MisalignedSegment { index } => {
                write!(f, "phdr[{index}]: offset and address are not congruent")
            }
            Self::SegmentInKernelHalf { index } => {
                write!(f, "phdr[{index}]: segment reaches into the kernel half")
            }
            Self::EntryOutsideCode => write!(f, "entry point is outside the code segment"),
        }
    }
}

/// ELF header (64-bit), the fields the loader uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub e_machine: u16,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Decode and validate the file header
    ///
    /// A pure function of the first 64 bytes of `data`.
    ///
    /// # Errors
    ///
    /// The first failing check, in the order listed in the module docs.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        let mut r = BinaryReader::window(data, 0, ELF64_HEADER_SIZE).ok_or(ElfError::FileTooSmall)?;
        let ident: [u8; 16] = r.read_array().ok_or(ElfError::FileTooSmall)?;

        if ident[..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if ident[EI_CLASS] != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass);
        }
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEndian);
        }
        if ident[EI_OSABI] != ELFOSABI_SYSV {
            return Err(ElfError::UnsupportedAbi);
        }

        let e_type = r.read_u16().ok_or(ElfError::FileTooSmall)?;
        let e_machine = r.read_u16().ok_or(ElfError::FileTooSmall)?;
        if e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if e_machine != EM_X86_64 {
            return Err(ElfError::UnsupportedArch);
        }

        let _e_version = r.read_u32().ok_or(ElfError::FileTooSmall)?;
        let e_entry = r.read_u64().ok_or(ElfError::FileTooSmall)?;
        let e_phoff = r.read_u64().ok_or(ElfError::FileTooSmall)?;
        // e_shoff, e_flags, e_ehsize
        r.skip(8 + 4 + 2).ok_or(ElfError::FileTooSmall)?;
        let e_phentsize = r.read_u16().ok_or(ElfError::FileTooSmall)?;
        let e_phnum = r.read_u16().ok_or(ElfError::FileTooSmall)?;

        Ok(Self { e_type, e_machine, e_entry, e_phoff, e_phentsize, e_phnum })
    }

    /// Decode the program header table
    ///
    /// # Errors
    ///
    /// - [`ElfError::TooManyProgramHeaders`] if `e_phnum` exceeds [`MAX_PROGRAM_HEADERS`]
    /// - [`ElfError::InvalidProgramHeader`] if the entry size is wrong or the table
    ///   does not fit in `data`
    pub fn program_headers(&self, data: &[u8]) -> Result<ProgramHeaders, ElfError> {
        let count = usize::from(self.e_phnum);
        if count > MAX_PROGRAM_HEADERS {
            return Err(ElfError::TooManyProgramHeaders);
        }
        if usize::from(self.e_phentsize) != ELF64_PHDR_SIZE {
            return Err(ElfError::InvalidProgramHeader);
        }
        let offset = usize::try_from(self.e_phoff).map_err(|_| ElfError::InvalidProgramHeader)?;
        let mut r = BinaryReader::window(data, offset, count * ELF64_PHDR_SIZE)
            .ok_or(ElfError::InvalidProgramHeader)?;

        let mut table = ProgramHeaders { entries: [Elf64ProgramHeader::default(); MAX_PROGRAM_HEADERS], len: 0 };
        for slot in table.entries.iter_mut().take(count) {
            *slot = Elf64ProgramHeader::read(&mut r).ok_or(ElfError::InvalidProgramHeader)?;
        }
        table.len = count;
        Ok(table)
    }
}

/// Program header (64-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf64ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment file offset
    pub p_offset: u64,
    /// Segment virtual address
    pub p_vaddr: u64,
    /// Segment physical address
    pub p_paddr: u64,
    /// Segment size in file
    pub p_filesz: u64,
    /// Segment size in memory
    pub p_memsz: u64,
    /// Segment alignment
    pub p_align: u64,
}

impl Elf64ProgramHeader {
    fn read(r: &mut BinaryReader<'_>) -> Option<Self> {
        Some(Self {
            p_type: r.read_u32()?,
            p_flags: r.read_u32()?,
            p_offset: r.read_u64()?,
            p_vaddr: r.read_u64()?,
            p_paddr: r.read_u64()?,
            p_filesz: r.read_u64()?,
            p_memsz: r.read_u64()?,
            p_align: r.read_u64()?,
        })
    }

    /// Check if this segment is loadable
    pub const fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Permission flags (unknown bits are dropped)
    pub const fn flags(&self) -> ProgramFlags {
        ProgramFlags::from_bits_truncate(self.p_flags)
    }
}

/// Decoded program header table, bounded by [`MAX_PROGRAM_HEADERS`]
#[derive(Debug, Clone)]
pub struct ProgramHeaders {
    entries: [Elf64ProgramHeader; MAX_PROGRAM_HEADERS],
    len: usize,
}

impl ProgramHeaders {
    /// Number of entries
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over the entries
    pub fn iter(&self) -> impl Iterator<Item = &Elf64ProgramHeader> {
        self.entries[..self.len].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> [u8; ELF64_HEADER_SIZE] {
        let mut h = [0u8; ELF64_HEADER_SIZE];
        h[..4].copy_from_slice(&ELF_MAGIC);
        h[EI_CLASS] = ELFCLASS64;
        h[EI_DATA] = ELFDATA2LSB;
        h[6] = 1;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes());
        h[32..40].copy_from_slice(&64u64.to_le_bytes());
        h[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
        h
    }

    #[test]
    fn test_elf_magic() {
        assert_eq!(ELF_MAGIC, [0x7F, b'E', b'L', b'F']);
    }

    #[test]
    fn parses_valid_header() {
        let h = Elf64Header::parse(&header()).unwrap();
        assert_eq!(h.e_entry, 0x40_1000);
        assert_eq!(h.e_phoff, 64);
        assert_eq!(h.e_phnum, 0);
    }

    #[test]
    fn checks_run_in_order() {
        let mut h = header();
        h[EI_CLASS] = 1;
        h[16] = 3;
        // class is checked before type
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::UnsupportedClass));

        let mut h = header();
        h[EI_OSABI] = 3;
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::UnsupportedAbi));

        let mut h = header();
        h[18] = 3;
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::UnsupportedArch));

        assert_eq!(Elf64Header::parse(&header()[..63]), Err(ElfError::FileTooSmall));
    }

    #[test]
    fn too_many_program_headers_is_rejected() {
        let mut h = Elf64Header::parse(&header()).unwrap();
        h.e_phnum = (MAX_PROGRAM_HEADERS + 1) as u16;
        assert_eq!(
            h.program_headers(&[0; 4096]).unwrap_err(),
            ElfError::TooManyProgramHeaders
        );
    }

    #[test]
    fn program_table_must_fit() {
        let mut h = Elf64Header::parse(&header()).unwrap();
        h.e_phnum = 2;
        h.e_phoff = 4096 - ELF64_PHDR_SIZE as u64;
        assert_eq!(
            h.program_headers(&[0; 4096]).unwrap_err(),
            ElfError::InvalidProgramHeader
        );
    }

    #[test]
    fn format_errors() {
        assert!(ElfError::InvalidMagic.is_format_error());
        assert!(ElfError::NotExecutable.is_format_error());
        assert!(!ElfError::FileTooSmall.is_format_error());
        assert!(!ElfError::MissingSegment(SegmentKind::Data).is_format_error());
    }
}
