// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Digging a suspended coroutine's saved registers out of its stack region.
//!
//! The path is: stack region -> control block at the top of the region ->
//! fiber activation record -> RSP/RBP/RIP. Every step reads raw debuggee
//! memory against the layout contracts in [`crate::format`]; any mismatch
//! means "no coroutine here" and the region is skipped.

use scroll::{Pread, LE};
use tracing::trace;

use crate::format::{
    self, CoroState, UnwindRegisters, CORO_CONTROL_BLOCK, CORO_CONTROL_BLOCK_WITH_MAGIC,
    FCONTEXT_SAVE_AREA_SIZE, FIBER_UCONTEXT_OFFSET, UCONTEXT_SIZE,
};
use crate::settings::{ContextImplementation, Settings};
use crate::traits::{CommandOutput, Process, RegionInfo};

/// Tries to interpret `region` as the stack of a suspended coroutine and
/// recover the registers it would resume with.
///
/// Returns `None` when the region holds no (valid) coroutine; diagnostics for
/// the interesting failure modes are appended to `out`.
pub fn try_find_coro_registers<P: Process>(
    process: &P,
    settings: &Settings,
    region: &RegionInfo,
    out: &mut CommandOutput,
) -> Option<UnwindRegisters> {
    let block_size = format::control_block_size(settings.with_magic);
    let block_address = format::control_block_address(region.end, block_size);

    let fiber = read_fiber_pointer(process, settings, region, block_address, out)?;
    if fiber == 0 {
        trace!(%region, "control block holds no fiber");
        return None;
    }

    match settings.context_implementation {
        ContextImplementation::Ucontext => registers_from_ucontext(process, fiber, out),
        ContextImplementation::Fcontext => registers_from_fcontext(process, fiber, out),
    }
}

/// Reads the control block at `block_address` and returns its fiber pointer,
/// validating the integrity tag when the runtime carries one.
fn read_fiber_pointer<P: Process>(
    process: &P,
    settings: &Settings,
    region: &RegionInfo,
    block_address: u64,
    out: &mut CommandOutput,
) -> Option<u64> {
    let block_size = format::control_block_size(settings.with_magic) as usize;
    let mut buffer = vec![0u8; block_size];
    if let Err(err) = process.read_memory(block_address, &mut buffer) {
        out.append_message(&format!(
            "Failed to read Coro::control_block from process memory: {err}"
        ));
        return None;
    }

    let (fiber, state) = if settings.with_magic {
        let block: CORO_CONTROL_BLOCK_WITH_MAGIC = buffer.pread_with(0, LE).ok()?;
        let expected = format::expected_magic(block_address, settings.mmap_size(), region.end);
        if block.magic != expected {
            out.append_message(&format!(
                "Magic doesn't match: expected {expected}, got {}",
                block.magic
            ));
            return None;
        }
        (block.fiber, block.state)
    } else {
        let block: CORO_CONTROL_BLOCK = buffer.pread_with(0, LE).ok()?;
        (block.fiber, block.state)
    };

    trace!(
        %region,
        block_address,
        fiber,
        state = ?CoroState::from_bits_truncate(state),
        "control block read"
    );
    Some(fiber)
}

/// ucontext backend: the activation record embeds a `ucontext_t` right past
/// its first word; the registers sit in `uc_mcontext.gregs`.
fn registers_from_ucontext<P: Process>(
    process: &P,
    fiber: u64,
    out: &mut CommandOutput,
) -> Option<UnwindRegisters> {
    let mut buffer = vec![0u8; UCONTEXT_SIZE];
    if let Err(err) = process.read_memory(fiber + FIBER_UCONTEXT_OFFSET, &mut buffer) {
        out.append_message(&format!(
            "Failed to read ucontext from process memory: {err}"
        ));
        return None;
    }

    let regs = UnwindRegisters::from_ucontext(&buffer).ok()?;
    trace!(rsp = regs.rsp, rbp = regs.rbp, rip = regs.rip, "ucontext registers");
    Some(regs)
}

/// fcontext backend: the fiber pointer is the fcontext itself, pointing at
/// the 64-byte save area `jump_fcontext` filled when the coroutine suspended.
fn registers_from_fcontext<P: Process>(
    process: &P,
    fiber: u64,
    out: &mut CommandOutput,
) -> Option<UnwindRegisters> {
    let mut buffer = vec![0u8; FCONTEXT_SAVE_AREA_SIZE as usize];
    if let Err(err) = process.read_memory(fiber, &mut buffer) {
        out.append_message(&format!(
            "Failed to read fcontext from process memory: {err}"
        ));
        return None;
    }

    let regs = UnwindRegisters::from_fcontext(fiber, &buffer).ok()?;
    trace!(rsp = regs.rsp, rbp = regs.rbp, rip = regs.rip, "fcontext registers");
    Some(regs)
}
