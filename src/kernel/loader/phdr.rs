// src/kernel/loader/phdr.rs
//! プログラムヘッダの分類
//!
//! 検証済みの ELF ヘッダから `PT_LOAD` エントリを取り出し、コードとデータの
//! 2 つのセグメントに振り分けます。結果は呼び出し元の [`ProcessMappingInfo`]
//! と、ロード中だけ生存する [`ParsedImage`] に書き込まれます。

use x86_64::VirtAddr;

use crate::constants::USER_SPACE_END;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::fs::File;
use crate::kernel::mm::segment::{ProcessMappingInfo, SegmentKind, SegmentMapping};
use crate::kernel::mm::types::{ceil_to_page, floor_to_page, is_page_aligned, MemoryError};
use crate::kernel::process::elf_loader::{
    Elf64Header, Elf64ProgramHeader, ElfError, ProgramFlags,
};

/// 1 つのセグメントについて、イメージからコピーする内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhdrInfo<'a> {
    /// プログラムヘッダの番号
    pub index: usize,
    /// コピー元のバイト列（ちょうど `copy_size` バイト）
    pub data: &'a [u8],
    /// ページ境界に切り下げた仮想アドレス
    pub vaddr: VirtAddr,
    /// マップするバイト数（ページ境界に切り上げ済み）
    pub map_size: u64,
    /// コピーするバイト数（残りはゼロ埋め）
    pub copy_size: u64,
}

/// 検証済みイメージ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedImage<'a> {
    /// エントリポイント
    pub entry: VirtAddr,
    /// コードセグメント
    pub code: PhdrInfo<'a>,
    /// データセグメント
    pub data: PhdrInfo<'a>,
}

impl<'a> ParsedImage<'a> {
    /// 種類に対応するセグメント（スタックはイメージに含まれない）
    pub fn segment(&self, kind: SegmentKind) -> Option<&PhdrInfo<'a>> {
        match kind {
            SegmentKind::Code => Some(&self.code),
            SegmentKind::Data => Some(&self.data),
            SegmentKind::Stack => None,
        }
    }

    /// ユーザ空間に置けるイメージかを確認する
    ///
    /// コードとデータがどちらも下位半分に収まり、エントリがコードセグメント内に
    /// あること。上位半分はすべてのアドレス空間でカーネルと共有されています。
    ///
    /// # Errors
    ///
    /// [`ElfError::SegmentInKernelHalf`] または [`ElfError::EntryOutsideCode`]。
    pub fn check_user_half(&self) -> Result<(), ElfError> {
        for info in [&self.code, &self.data] {
            let end = info.vaddr.as_u64().checked_add(info.map_size);
            if !end.is_some_and(|end| end <= USER_SPACE_END) {
                return Err(ElfError::SegmentInKernelHalf { index: info.index });
            }
        }
        let start = self.code.vaddr.as_u64();
        let entry = self.entry.as_u64();
        if entry < start || entry - start >= self.code.map_size {
            return Err(ElfError::EntryOutsideCode);
        }
        Ok(())
    }
}

/// イメージを検証し、コードとデータのセグメントを取り出す
///
/// `map_info` はクリアされ、コードとデータの仮想範囲が書き込まれます
/// （物理アドレスは未割り当て、スタックは空のまま）。
/// 割り当てや書き込みは一切行わないので、同じイメージに対して何度呼んでも
/// 同じ結果になります。
///
/// # Errors
///
/// 形式エラーと構造エラーは [`ElfError`]、正規でないアドレスは [`MemoryError`]。
pub fn parse_program_headers<'a>(
    file: &File<'a>,
    map_info: &mut ProcessMappingInfo,
) -> KernelResult<ParsedImage<'a>> {
    let buf = file.buf();
    let header = Elf64Header::parse(buf)?;
    let phdrs = header.program_headers(buf)?;

    let mut code: Option<PhdrInfo<'a>> = None;
    let mut data: Option<PhdrInfo<'a>> = None;

    for (index, phdr) in phdrs.iter().enumerate() {
        if !phdr.is_load() || phdr.p_memsz == 0 {
            continue;
        }
        let kind = classify(index, phdr)?;
        let info = segment_info(buf, index, phdr)?;
        let slot = match kind {
            SegmentKind::Code => &mut code,
            _ => &mut data,
        };
        if slot.is_some() {
            return Err(ElfError::DuplicateSegment(kind).into());
        }
        log::trace!(
            "{}: phdr[{}] {} vaddr={:#x} map={:#x} copy={:#x}",
            file.name(),
            index,
            kind,
            info.vaddr.as_u64(),
            info.map_size,
            info.copy_size
        );
        *slot = Some(info);
    }

    let code = code.ok_or(ElfError::MissingSegment(SegmentKind::Code))?;
    let data = data.ok_or(ElfError::MissingSegment(SegmentKind::Data))?;
    let entry = VirtAddr::try_new(header.e_entry).map_err(|_| {
        KernelError::with_context(ErrorKind::Memory(MemoryError::InvalidAddress), "entry point")
    })?;

    map_info.clear();
    map_info.code = SegmentMapping::new(code.vaddr, code.map_size)?;
    map_info.data = SegmentMapping::new(data.vaddr, data.map_size)?;

    Ok(ParsedImage { entry, code, data })
}

/// `PT_LOAD` エントリを権限フラグで分類する
fn classify(index: usize, phdr: &Elf64ProgramHeader) -> Result<SegmentKind, ElfError> {
    let flags = phdr.flags();
    let exec = flags.contains(ProgramFlags::X);
    let write = flags.contains(ProgramFlags::W);
    match (exec, write) {
        (true, false) => Ok(SegmentKind::Code),
        (false, true) => Ok(SegmentKind::Data),
        (true, true) => Err(ElfError::WritableAndExecutable { index }),
        (false, false) => Err(ElfError::UnclassifiableSegment { index, flags: phdr.p_flags }),
    }
}

/// コピー範囲とマップ範囲を計算する
fn segment_info<'a>(
    buf: &'a [u8],
    index: usize,
    phdr: &Elf64ProgramHeader,
) -> KernelResult<PhdrInfo<'a>> {
    if !is_page_aligned(phdr.p_align)
        || !is_page_aligned(phdr.p_offset.wrapping_sub(phdr.p_vaddr))
    {
        return Err(ElfError::MisalignedSegment { index }.into());
    }
    if phdr.p_filesz > phdr.p_memsz {
        return Err(ElfError::SegmentOutOfBounds { index }.into());
    }

    let out_of_bounds = || KernelError::from(ElfError::SegmentOutOfBounds { index });
    let file_end = phdr.p_offset.checked_add(phdr.p_filesz).ok_or_else(out_of_bounds)?;
    if file_end > buf.len() as u64 {
        return Err(out_of_bounds());
    }

    let vaddr = floor_to_page(phdr.p_vaddr);
    let delta = phdr.p_vaddr - vaddr;
    let vaddr = VirtAddr::try_new(vaddr).map_err(|_| {
        KernelError::with_context(ErrorKind::Memory(MemoryError::InvalidAddress), "segment address")
    })?;
    let map_size = ceil_to_page(phdr.p_memsz.checked_add(delta).ok_or(MemoryError::AddressOverflow)?)?;
    let copy_size = phdr.p_filesz + delta;

    // p_offset と p_vaddr はページ内オフセットが等しいので p_offset >= delta
    let start = (phdr.p_offset - delta) as usize;
    let data = &buf[start..file_end as usize];

    Ok(PhdrInfo { index, data, vaddr, map_size, copy_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phdr(flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> Elf64ProgramHeader {
        Elf64ProgramHeader {
            p_type: crate::kernel::process::elf_loader::PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: 0x1000,
        }
    }

    #[test]
    fn classification() {
        let r = ProgramFlags::R.bits();
        let w = ProgramFlags::W.bits();
        let x = ProgramFlags::X.bits();
        assert_eq!(classify(0, &phdr(r | x, 0, 0, 0, 1)), Ok(SegmentKind::Code));
        assert_eq!(classify(0, &phdr(r | w, 0, 0, 0, 1)), Ok(SegmentKind::Data));
        assert_eq!(
            classify(2, &phdr(r | w | x, 0, 0, 0, 1)),
            Err(ElfError::WritableAndExecutable { index: 2 })
        );
        assert_eq!(
            classify(3, &phdr(r, 0, 0, 0, 1)),
            Err(ElfError::UnclassifiableSegment { index: 3, flags: r })
        );
    }

    #[test]
    fn sizes_follow_page_offset() {
        let buf = [0xAAu8; 0x3000];
        // vaddr 0x40_1234, offset 0x1234: delta 0x234
        let info = segment_info(&buf, 0, &phdr(6, 0x1234, 0x40_1234, 0x100, 0x2000)).unwrap();
        assert_eq!(info.vaddr, VirtAddr::new(0x40_1000));
        assert_eq!(info.copy_size, 0x334);
        assert_eq!(info.map_size, 0x3000);
        assert_eq!(info.data.len() as u64, info.copy_size);
        assert!(info.copy_size <= info.map_size);
    }

    fn image(code: u64, data: u64, entry: u64) -> ParsedImage<'static> {
        let info = |index, vaddr| PhdrInfo {
            index,
            data: &[],
            vaddr: VirtAddr::new(vaddr),
            map_size: 0x2000,
            copy_size: 0,
        };
        ParsedImage { entry: VirtAddr::new(entry), code: info(0, code), data: info(1, data) }
    }

    #[test]
    fn user_half_check() {
        assert_eq!(image(0x40_0000, 0x60_0000, 0x40_1fff).check_user_half(), Ok(()));
        assert_eq!(
            image(0xFFFF_8000_0040_0000, 0x60_0000, 0xFFFF_8000_0040_0000).check_user_half(),
            Err(ElfError::SegmentInKernelHalf { index: 0 })
        );
        // ends exactly at the boundary
        assert_eq!(
            image(0x40_0000, USER_SPACE_END - 0x2000, 0x40_0000).check_user_half(),
            Ok(())
        );
        assert_eq!(
            image(0x40_0000, 0x60_0000, 0x40_2000).check_user_half(),
            Err(ElfError::EntryOutsideCode)
        );
        assert_eq!(
            image(0x40_0000, 0x60_0000, 0x60_0000).check_user_half(),
            Err(ElfError::EntryOutsideCode)
        );
    }

    #[test]
    fn rejects_bad_geometry() {
        let buf = [0u8; 0x2000];
        assert_eq!(
            segment_info(&buf, 1, &phdr(6, 0x1010, 0x40_1000, 0x10, 0x10)).unwrap_err(),
            KernelError::from(ElfError::MisalignedSegment { index: 1 })
        );
        assert_eq!(
            segment_info(&buf, 1, &phdr(6, 0x1000, 0x40_1000, 0x20, 0x10)).unwrap_err(),
            KernelError::from(ElfError::SegmentOutOfBounds { index: 1 })
        );
        assert_eq!(
            segment_info(&buf, 1, &phdr(6, 0x1000, 0x40_1000, 0x1001, 0x2000)).unwrap_err(),
            KernelError::from(ElfError::SegmentOutOfBounds { index: 1 })
        );
    }
}
