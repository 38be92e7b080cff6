// src/kernel/loader/mod.rs
//! プロセスローダ
//!
//! 検証済みの ELF イメージから実行可能なアドレス空間を組み立てます。
//!
//! - エフェメラル: 揮発性 RAM を裏付けとし、プロセス表に登録する
//! - 永続: 永続メモリを裏付けとし、2 スロットのレコードをコミットしてから復元する
//! - カーネル: カーネル自身のアドレス空間に展開し、エントリへジャンプする
//!
//! どの経路でも、イメージの検証はメモリを 1 ページも確保する前に終わります。
//! 失敗したロードは何も登録しません（確保済みのフレームは回収されません）。

pub mod config;
pub mod phdr;

use x86_64::structures::paging::{FrameAllocator, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use crate::arch::x86_64::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::kernel::context::KernelContext;
use crate::kernel::core::{KernelError, KernelResult, ResultExt};
use crate::kernel::fs::File;
use crate::kernel::mm::frame::PageSource;
use crate::kernel::mm::paging::AddressSpace;
use crate::kernel::mm::pmem::PersistentMemoryManager;
use crate::kernel::mm::segment::{ProcessMappingInfo, SegmentKind, SegmentMapping};
use crate::kernel::mm::types::{pages_to_bytes, PhysWindow};
use crate::kernel::process::context::{ExecutionContext, INITIAL_RFLAGS};
use crate::kernel::process::ProcessId;

pub use config::LoaderConfig;
pub use phdr::{parse_program_headers, ParsedImage, PhdrInfo};

/// 展開済みのカーネルイメージ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    /// エントリポイント
    pub entry: VirtAddr,
    /// メインスタックの上端
    pub stack_top: VirtAddr,
    /// コード・データ・スタックの配置
    pub map_info: ProcessMappingInfo,
}

/// イメージの置き場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// プロセス専用の下位半分
    User,
    /// 呼び出し元が渡したアドレス空間（制限なし）
    Kernel,
}

/// 検証を行い、失敗をログに残す
fn parse<'a>(
    file: &File<'a>,
    map_info: &mut ProcessMappingInfo,
    placement: Placement,
) -> KernelResult<ParsedImage<'a>> {
    parse_program_headers(file, map_info)
        .and_then(|image| {
            if placement == Placement::User {
                image.check_user_half()?;
            }
            Ok(image)
        })
        .inspect_err(|e| {
            if e.is_format_error() {
                log::warn!("{}: rejected: {}", file.name(), e);
            } else {
                log::error!("{}: invalid image: {}", file.name(), e);
            }
        })
}

/// スタック用のセグメント（裏付けは未割り当て）
fn stack_segment(base: VirtAddr, pages: u64) -> KernelResult<SegmentMapping> {
    let size = pages_to_bytes(pages)?;
    SegmentMapping::new(base, size).context("stack segment")
}

/// 1 つのセグメントに内容をコピーしてマップする
///
/// 先頭 `src.len()` バイトをコピーし、残りをゼロで埋めてから登録します。
fn load_and_map_segment<A>(
    window: &PhysWindow,
    space: &mut AddressSpace,
    segment: &SegmentMapping,
    src: &[u8],
    flags: PageTableFlags,
    frames: &mut A,
) -> KernelResult<()>
where
    A: FrameAllocator<Size4KiB> + ?Sized,
{
    // SAFETY: 裏付けはこのロードのために確保したばかりで、どこからも参照されていない
    unsafe { segment.fill_from(window, src)? };
    segment.map(space, flags, frames)
}

/// 3 つのセグメントに内容をコピーしてマップする
fn load_and_map<A>(
    window: &PhysWindow,
    space: &mut AddressSpace,
    map_info: &ProcessMappingInfo,
    image: &ParsedImage<'_>,
    base: PageTableFlags,
    frames: &mut A,
) -> KernelResult<()>
where
    A: FrameAllocator<Size4KiB> + ?Sized,
{
    map_info.validate()?;
    for kind in [SegmentKind::Code, SegmentKind::Data, SegmentKind::Stack] {
        let src = image.segment(kind).map_or(&[][..], |info| info.data);
        let flags = ProcessMappingInfo::flags_for(kind, base);
        load_and_map_segment(window, space, map_info.segment(kind), src, flags, frames)?;
    }
    Ok(())
}

/// ELF イメージを読み込み、エフェメラルプロセスを作成する
///
/// # Errors
///
/// - イメージの形式・構造エラー（何も確保しない）
/// - フレームの枯渇などのメモリエラー（何も登録しない）
pub fn load_elf_and_create_ephemeral_process(
    file: &File<'_>,
    kctx: &mut KernelContext<'_>,
) -> KernelResult<ProcessId> {
    let mut map_info = ProcessMappingInfo::empty();
    let image = parse(file, &mut map_info, Placement::User)?;
    let config = kctx.config;
    let memory = &mut kctx.memory;
    let window = memory.window;

    let mut space = memory.create_page_table()?;

    memory.frames.alloc_segment(&mut map_info.code).context("code segment")?;
    memory.frames.alloc_segment(&mut map_info.data).context("data segment")?;
    map_info.stack = stack_segment(config.user_stack_base, config.user_stack_pages)?;
    memory.frames.alloc_segment(&mut map_info.stack).context("stack segment")?;

    log::info!("{}: ephemeral process\n{}", file.name(), map_info);
    load_and_map(
        &window,
        &mut space,
        &map_info,
        &image,
        PageTableFlags::USER_ACCESSIBLE,
        &mut *memory.frames,
    )?;

    let kernel_rsp = memory.alloc_kernel_stack(config.kernel_stack_pages)?;

    let mut ctx = ExecutionContext::empty();
    ctx.map_info = map_info;
    ctx.set_registers(
        image.entry,
        USER_CODE_SELECTOR,
        map_info.stack.virt_end(),
        USER_DATA_SELECTOR,
        space.cr3(),
        INITIAL_RFLAGS,
        kernel_rsp.as_u64(),
    );

    Ok(kctx.processes.create_ephemeral(ctx))
}

/// ELF イメージを読み込み、永続プロセスを作成する
///
/// スロット 0 を完成させ、スロット 1 にデータとスタックの別の裏付けを与えてから
/// 両方を書き戻し、スロット 0 をコミットします。その後レコードから復元し、
/// スロット 0 のページテーブルのデータとスタックを作業スロットへ付け替えます。
///
/// # Errors
///
/// - イメージの形式・構造エラー（何も確保しない）
/// - 永続メモリの枯渇などのメモリエラー
pub fn load_elf_and_create_persistent_process(
    file: &File<'_>,
    kctx: &mut KernelContext<'_>,
    pmem: &mut PersistentMemoryManager,
) -> KernelResult<ProcessId> {
    let mut map_info = ProcessMappingInfo::empty();
    let image = parse(file, &mut map_info, Placement::User)?;
    let config = kctx.config;

    let mut record = pmem.alloc_persistent_process_info()?;
    let memory = &mut kctx.memory;
    let window = memory.window;
    let mut space = memory.create_page_table()?;

    map_info.stack = stack_segment(config.user_stack_base, config.user_stack_pages)?;
    pmem.alloc_segment(&mut map_info.code).context("code segment")?;
    pmem.alloc_segment(&mut map_info.data).context("data segment")?;
    pmem.alloc_segment(&mut map_info.stack).context("stack segment")?;

    log::info!("{}: persistent process\n{}", file.name(), map_info);
    load_and_map(
        &window,
        &mut space,
        &map_info,
        &image,
        PageTableFlags::USER_ACCESSIBLE,
        &mut *memory.frames,
    )?;

    let info = record.get_mut();
    let ctx = info.context_mut(0);
    ctx.map_info = map_info;
    ctx.set_registers(
        image.entry,
        USER_CODE_SELECTOR,
        map_info.stack.virt_end(),
        USER_DATA_SELECTOR,
        space.cr3(),
        INITIAL_RFLAGS,
        0,
    );

    let mut working = *ctx;
    pmem.alloc_segment(&mut working.map_info.data).context("working data segment")?;
    pmem.alloc_segment(&mut working.map_info.stack).context("working stack segment")?;
    *info.context_mut(1) = working;

    info.persist_segments(0, &window)?;
    info.persist_slot(0);
    info.persist_slot(1);
    info.commit_slot(0)?;

    // スロット 0 用に作ったページテーブルをそのまま作業スロットへ付け替える
    kctx.processes
        .restore_onto(record, space, &mut kctx.memory, config.kernel_stack_pages)
}

/// カーネルイメージを `space` に展開する
///
/// ユーザ空間と同じ解析を行い、揮発性 RAM を裏付けに使います。
/// マッピングには `USER_ACCESSIBLE` を付けません。
///
/// # Errors
///
/// [`load_elf_and_create_ephemeral_process`] と同じ。
pub fn prepare_kernel_image(
    file: &File<'_>,
    kctx: &mut KernelContext<'_>,
    space: &mut AddressSpace,
) -> KernelResult<KernelImage> {
    let mut map_info = ProcessMappingInfo::empty();
    let image = parse(file, &mut map_info, Placement::Kernel)?;
    let config = kctx.config;
    let memory = &mut kctx.memory;
    let window = memory.window;

    memory.frames.alloc_segment(&mut map_info.code).context("kernel code segment")?;
    memory.frames.alloc_segment(&mut map_info.data).context("kernel data segment")?;
    map_info.stack = stack_segment(config.kernel_main_stack_base, config.kernel_main_stack_pages)?;
    memory.frames.alloc_segment(&mut map_info.stack).context("kernel stack segment")?;

    log::info!("{}: kernel image\n{}", file.name(), map_info);
    load_and_map(
        &window,
        space,
        &map_info,
        &image,
        PageTableFlags::empty(),
        &mut *memory.frames,
    )?;

    Ok(KernelImage {
        entry: image.entry,
        stack_top: map_info.stack.virt_end(),
        map_info,
    })
}

/// カーネルイメージを現在のアドレス空間に展開し、そのエントリへジャンプする
///
/// `handoff` は新しいカーネルの第 1 引数として渡されます。
///
/// # Panics
///
/// 展開に失敗した場合。起動を続ける手段がないため致命的です。
#[cfg(target_arch = "x86_64")]
pub fn load_kernel_elf(file: &File<'_>, kctx: &mut KernelContext<'_>, handoff: u64) -> ! {
    let Some(mut space) = kctx.memory.kernel_space.take() else {
        panic!("{}: kernel address space is not known", file.name());
    };
    let loaded = prepare_kernel_image(file, kctx, &mut space);
    kctx.memory.kernel_space = Some(space);

    let image = match loaded {
        Ok(image) => image,
        Err(e) => panic!("{}: failed to load kernel image: {}", file.name(), e),
    };
    log::info!("Entry address: {:#x}", image.entry.as_u64());

    // SAFETY: エントリとスタックは現在のアドレス空間にマップ済みで、
    // スタックの上端はページ境界にある
    unsafe { crate::arch::x86_64::jump_to_kernel(image.entry, handoff, image.stack_top) }
}

/// 永続メモリに記録されたプロセスをすべて復元する
///
/// 一度もコミットされていないレコードは警告を出して読み飛ばします。
/// 復元したプロセスの ID を返します。
///
/// # Errors
///
/// 永続メモリのヘッダが壊れている場合、またはページテーブルの構築に失敗した場合。
pub fn recover_persistent_processes(
    kctx: &mut KernelContext<'_>,
    pmem: &PersistentMemoryManager,
) -> KernelResult<alloc::vec::Vec<ProcessId>> {
    let mut restored = alloc::vec::Vec::new();
    for phys in pmem.record_addrs() {
        if kctx.processes.owns_record(phys) {
            continue;
        }
        // SAFETY: このレコードを所有するプロセスは登録されていない
        let record = unsafe { pmem.record(phys)? };
        if record.get().valid_index().is_none() {
            log::warn!("pmem: record at {:#x} was never committed, skipping", phys.as_u64());
            continue;
        }
        let pid = kctx
            .processes
            .restore_from_persistent_process_info(
                record,
                &mut kctx.memory,
                kctx.config.kernel_stack_pages,
            )
            .map_err(|e| {
                log::error!("pmem: failed to restore record at {:#x}: {}", phys.as_u64(), e);
                KernelError::with_context(*e.kind(), "recover persistent process")
            })?;
        restored.push(pid);
    }
    log::info!("pmem: {} persistent processes recovered", restored.len());
    Ok(restored)
}
