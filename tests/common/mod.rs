//! Host-side test fixtures
//!
//! `Machine` is a block of page-aligned host memory that plays the role of
//! physical RAM. Physical address `PHYS_BASE + n` is byte `n` of the block.
//! The volatile frame allocator owns the first part and the rest is handed
//! to the persistent-memory manager, so real page tables, segments and
//! records are built exactly as on hardware.

#![allow(dead_code)]

use pmos::constants::PAGE_SIZE;
use pmos::kernel::mm::frame::PhysRange;
use pmos::kernel::mm::{AddressSpace, ContiguousFrameAllocator, PersistentMemoryManager, PhysWindow};
use pmos::kernel::process::elf_loader::{
    ELF64_HEADER_SIZE, ELF64_PHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELFOSABI_SYSV, ELF_MAGIC,
    EM_X86_64, ET_EXEC, PT_LOAD,
};
use pmos::kernel::process::ProcessControl;
use pmos::{KernelContext, LoaderConfig, MemoryContext};
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

/// First physical address of the fake RAM
pub const PHYS_BASE: u64 = 0x10_0000;

/// One page of host memory, aligned like a physical frame
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; PAGE_SIZE as usize]);

fn zeroed_pages(count: usize) -> Vec<Page> {
    vec![Page([0; PAGE_SIZE as usize]); count]
}

/// Fake physical memory with a volatile and a persistent part
pub struct Machine {
    mem: Vec<Page>,
    volatile_pages: u64,
    pmem_pages: u64,
    pub window: PhysWindow,
    pub frames: ContiguousFrameAllocator,
    pub processes: ProcessControl,
    pub config: LoaderConfig,
    pub kernel_root: Option<PhysFrame>,
}

impl Machine {
    pub fn new(volatile_pages: u64, pmem_pages: u64) -> Self {
        let mem = zeroed_pages((volatile_pages + pmem_pages) as usize);
        let offset = mem.as_ptr() as u64 - PHYS_BASE;
        // SAFETY: every physical address the tests use lies inside `mem`,
        // which lives as long as the machine
        let window = unsafe { PhysWindow::new(VirtAddr::new(offset)) };
        let frames = volatile_allocator(volatile_pages);
        Self {
            mem,
            volatile_pages,
            pmem_pages,
            window,
            frames,
            processes: ProcessControl::new(),
            config: LoaderConfig::default(),
            kernel_root: None,
        }
    }

    /// A machine with enough room for a few processes
    pub fn standard() -> Self {
        Self::new(512, 256)
    }

    pub fn pmem_base(&self) -> PhysAddr {
        PhysAddr::new(PHYS_BASE + self.volatile_pages * PAGE_SIZE)
    }

    pub fn pmem_size(&self) -> u64 {
        self.pmem_pages * PAGE_SIZE
    }

    /// Open (or format) the persistent part
    pub fn open_pmem(&self) -> PersistentMemoryManager {
        // SAFETY: the persistent part belongs to no one else
        unsafe { PersistentMemoryManager::open(self.window, self.pmem_base(), self.pmem_size()) }
            .expect("open pmem")
    }

    /// Build a kernel address space whose upper half new tables will share
    pub fn install_kernel_space(&mut self) -> AddressSpace {
        let space = AddressSpace::create(&mut self.frames, self.window, None).expect("kernel pml4");
        self.kernel_root = Some(space.root());
        space
    }

    pub fn kctx(&mut self) -> KernelContext<'_> {
        let window = self.window;
        // SAFETY: the kernel table is never loaded in CR3 on the host
        let kernel_space = self.kernel_root.map(|root| unsafe { AddressSpace::from_root(root, window) });
        KernelContext::new(
            MemoryContext::new(window, &mut self.frames, kernel_space),
            &mut self.processes,
            self.config,
        )
    }

    /// Power loss: volatile memory and the process table are gone, the
    /// persistent part survives untouched
    pub fn reboot(&mut self) {
        for page in &mut self.mem[..self.volatile_pages as usize] {
            page.0.fill(0);
        }
        self.frames = volatile_allocator(self.volatile_pages);
        self.processes = ProcessControl::new();
        self.kernel_root = None;
    }

    /// Address space whose root is `cr3`
    pub fn space(&self, cr3: u64) -> AddressSpace {
        let root = PhysFrame::from_start_address(PhysAddr::new(cr3)).expect("aligned cr3");
        // SAFETY: nothing is ever loaded in CR3 on the host
        unsafe { AddressSpace::from_root(root, self.window) }
    }

    /// Read `len` bytes of physical memory
    pub fn read_phys(&self, phys: PhysAddr, len: usize) -> Vec<u8> {
        let ptr = self.window.to_virt(phys).as_ptr::<u8>();
        // SAFETY: the range lies inside `mem`
        unsafe { core::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    /// Write bytes to physical memory
    pub fn write_phys(&mut self, phys: PhysAddr, bytes: &[u8]) {
        // SAFETY: the range lies inside `mem` and no reference to it is live
        let dst = unsafe { self.window.bytes_mut(phys, bytes.len()) };
        dst.copy_from_slice(bytes);
    }

    /// Read through a page table, as the process would see it
    pub fn read_virt(&self, cr3: u64, virt: u64, len: usize) -> Vec<u8> {
        let (phys, _) = self.translate(cr3, virt).expect("mapped");
        self.read_phys(phys, len)
    }

    /// Write through a page table, as the process would
    pub fn write_virt(&mut self, cr3: u64, virt: u64, bytes: &[u8]) {
        let (phys, flags) = self.translate(cr3, virt).expect("mapped");
        assert!(flags.contains(PageTableFlags::WRITABLE), "write to read-only page");
        self.write_phys(phys, bytes);
    }

    pub fn translate(&self, cr3: u64, virt: u64) -> Option<(PhysAddr, PageTableFlags)> {
        self.space(cr3).translate(VirtAddr::new(virt))
    }

    pub fn is_persistent(&self, phys: PhysAddr) -> bool {
        let base = self.pmem_base().as_u64();
        (base..base + self.pmem_size()).contains(&phys.as_u64())
    }
}

fn volatile_allocator(pages: u64) -> ContiguousFrameAllocator {
    ContiguousFrameAllocator::new(&[PhysRange::new(PHYS_BASE, PHYS_BASE + pages * PAGE_SIZE)])
        .expect("one range")
}

/// A page-aligned image buffer
pub struct Image {
    pages: Vec<Page>,
    len: usize,
}

impl Image {
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `pages` holds at least `len` initialised bytes
        unsafe { core::slice::from_raw_parts(self.pages.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` is exclusive
        unsafe { core::slice::from_raw_parts_mut(self.pages.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

/// One `PT_LOAD` entry of a built image
#[derive(Clone)]
pub struct Segment {
    pub flags: u32,
    pub vaddr: u64,
    pub bytes: Vec<u8>,
    pub memsz: u64,
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const CODE_VADDR: u64 = 0x40_0000;
pub const DATA_VADDR: u64 = 0x60_0010;
pub const DATA_MEMSZ: u64 = 0x2000;

/// Small ELF64 executable writer
pub struct ElfBuilder {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub entry: u64,
    pub segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn empty() -> Self {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        ident[6] = 1;
        ident[7] = ELFOSABI_SYSV;
        Self { ident, e_type: ET_EXEC, e_machine: EM_X86_64, entry: CODE_VADDR, segments: Vec::new() }
    }

    /// Code at `CODE_VADDR`, data at `DATA_VADDR` with a `.bss` tail
    pub fn standard() -> Self {
        Self::empty()
            .segment(PF_R | PF_X, CODE_VADDR, code_bytes(), 0)
            .segment(PF_R | PF_W, DATA_VADDR, data_bytes(), DATA_MEMSZ)
    }

    /// Add a segment; `memsz == 0` means `memsz = bytes.len()`
    pub fn segment(mut self, flags: u32, vaddr: u64, bytes: Vec<u8>, memsz: u64) -> Self {
        let memsz = if memsz == 0 { bytes.len() as u64 } else { memsz };
        self.segments.push(Segment { flags, vaddr, bytes, memsz });
        self
    }

    pub fn build(&self) -> Image {
        let phdr_end = ELF64_HEADER_SIZE + self.segments.len() * ELF64_PHDR_SIZE;
        let mut cursor = round_up(phdr_end as u64);
        let mut offsets = Vec::new();
        for seg in &self.segments {
            let offset = cursor + seg.vaddr % PAGE_SIZE;
            offsets.push(offset);
            cursor = round_up(offset + seg.bytes.len() as u64);
        }

        let len = cursor.max(PAGE_SIZE) as usize;
        let mut image = Image { pages: zeroed_pages(len / PAGE_SIZE as usize), len };
        let buf = image.bytes_mut();

        buf[..16].copy_from_slice(&self.ident);
        put16(buf, 16, self.e_type);
        put16(buf, 18, self.e_machine);
        put32(buf, 20, 1);
        put64(buf, 24, self.entry);
        put64(buf, 32, ELF64_HEADER_SIZE as u64);
        put16(buf, 52, ELF64_HEADER_SIZE as u16);
        put16(buf, 54, ELF64_PHDR_SIZE as u16);
        put16(buf, 56, self.segments.len() as u16);

        for (i, (seg, &offset)) in self.segments.iter().zip(&offsets).enumerate() {
            let at = ELF64_HEADER_SIZE + i * ELF64_PHDR_SIZE;
            put32(buf, at, PT_LOAD);
            put32(buf, at + 4, seg.flags);
            put64(buf, at + 8, offset);
            put64(buf, at + 16, seg.vaddr);
            put64(buf, at + 24, seg.vaddr);
            put64(buf, at + 32, seg.bytes.len() as u64);
            put64(buf, at + 40, seg.memsz);
            put64(buf, at + 48, PAGE_SIZE);
            let start = offset as usize;
            buf[start..start + seg.bytes.len()].copy_from_slice(&seg.bytes);
        }
        image
    }
}

/// `nop` sled ending in `jmp $`
pub fn code_bytes() -> Vec<u8> {
    let mut code = vec![0x90; 0x120];
    code.extend_from_slice(&[0xEB, 0xFE]);
    code
}

pub fn data_bytes() -> Vec<u8> {
    (0..0x20).map(|i| 0xA0 + i as u8).collect()
}

fn round_up(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn put16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
