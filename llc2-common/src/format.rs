//! Layout definitions for the userver coroutine runtime.
//!
//! Types defined here must match what the debuggee's runtime actually puts in memory:
//! the [Boost.Coroutine2][coro2] control block stored near the top of every coroutine
//! stack mapping, the [Boost.Context][fcontext] fcontext register save area, the glibc
//! x86_64 `ucontext_t`, and the libstdc++ `std::string` object. None of these layouts
//! are covered by a stability promise of their upstreams; they are empirically pinned
//! by the runtime builds this plugin supports (x86_64 SysV, glibc, libstdc++).
//!
//! [coro2]: https://www.boost.org/doc/libs/release/libs/coroutine2/
//! [fcontext]: https://www.boost.org/doc/libs/release/libs/context/
#![allow(non_camel_case_types)]

use bitflags::bitflags;
use scroll::ctx::SizeWith;
use scroll::{Pread, SizeWith, LE};

/// Page size of the debuggee. Coroutine stack mappings are multiples of this,
/// with one page at the bottom reserved as a guard page.
pub const PAGE_SIZE: u64 = 4096;

/// Alignment of the coroutine control block within its stack mapping.
pub const CONTROL_BLOCK_ALIGN: u64 = 64;

/// The constant the runtime folds into the control-block integrity tag.
pub const CORO_MAGIC: u64 = 0x12345678;

/// The control block Boost.Coroutine2 allocates at the top of the coroutine stack,
/// as built by runtimes that stamp an integrity tag in front of it.
///
/// Field offsets (x86_64):
///
/// | offset | field  |
/// |--------|--------|
/// | 0x00   | magic  |
/// | 0x08   | fiber  |
/// | 0x10   | other (the pull side of the coroutine pair) |
/// | 0x18   | state (4 bytes + 4 bytes padding) |
/// | 0x20   | except (`std::exception_ptr`) |
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct CORO_CONTROL_BLOCK_WITH_MAGIC {
    /// Must satisfy [`expected_magic`] for the block to be trusted.
    pub magic: u64,
    /// Pointer to the fiber activation record holding the saved machine state.
    pub fiber: u64,
    pub other: u64,
    pub state: u32,
    pub _padding: u32,
    pub except: u64,
}

/// Same control block, as laid out by runtimes built without the integrity tag.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct CORO_CONTROL_BLOCK {
    /// Pointer to the fiber activation record holding the saved machine state.
    pub fiber: u64,
    pub other: u64,
    pub state: u32,
    pub _padding: u32,
    pub except: u64,
}

bitflags! {
    /// Coroutine lifecycle bits stored in the control block's `state` field.
    pub struct CoroState: u32 {
        const COMPLETE = 1 << 1;
        const UNWIND = 1 << 2;
        const DESTROY = 1 << 3;
    }
}

/// Size in bytes of the control block variant selected by `with_magic`.
pub fn control_block_size(with_magic: bool) -> u64 {
    if with_magic {
        CORO_CONTROL_BLOCK_WITH_MAGIC::size_with(&LE) as u64
    } else {
        CORO_CONTROL_BLOCK::size_with(&LE) as u64
    }
}

/// Address of the control block within a coroutine stack mapping ending at
/// `region_end`.
///
/// The runtime reserves `block_size + CONTROL_BLOCK_ALIGN` bytes below the top
/// of the mapping and places the block at the first 64-byte boundary inside the
/// reservation, i.e. at the highest aligned address that still leaves room for
/// the whole block.
pub fn control_block_address(region_end: u64, block_size: u64) -> u64 {
    let reserved = region_end - block_size - CONTROL_BLOCK_ALIGN;
    (reserved + CONTROL_BLOCK_ALIGN - 1) & !(CONTROL_BLOCK_ALIGN - 1)
}

/// The integrity tag a valid control block at `block_address` must carry.
///
/// `mmap_size` is the full mapping size including the guard page; the tag
/// folds in the block's own address and the space remaining between it and
/// the top of the mapping, so random stack garbage practically never
/// validates.
pub fn expected_magic(block_address: u64, mmap_size: u64, region_end: u64) -> u64 {
    let remaining_size = mmap_size - (region_end - block_address);
    CORO_MAGIC ^ block_address ^ remaining_size
}

/// The 64-byte register save area `jump_fcontext` leaves at the address the
/// fcontext pointer refers to (x86_64 SysV Boost.Context convention):
///
/// | offset | contents            |
/// |--------|---------------------|
/// | 0x00   | fc_mxcsr, fc_x87_cw |
/// | 0x08   | R12                 |
/// | 0x10   | R13                 |
/// | 0x18   | R14                 |
/// | 0x20   | R15                 |
/// | 0x28   | RBX                 |
/// | 0x30   | RBP                 |
/// | 0x38   | RIP                 |
///
/// After the jump the stack pointer sits right past the save area, at
/// `fcontext + FCONTEXT_SAVE_AREA_SIZE`.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct FCONTEXT_SAVE_AREA {
    pub fc_mxcsr: u32,
    pub fc_x87_cw: u32,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Size of [`FCONTEXT_SAVE_AREA`]; also the RSP displacement after a jump.
pub const FCONTEXT_SAVE_AREA_SIZE: u64 = 0x40;

/// Offset of the embedded `ucontext_t` from the fiber activation-record pointer.
///
/// Empirically determined for the runtime's activation-record layout; the word
/// being skipped is not documented anywhere.
pub const FIBER_UCONTEXT_OFFSET: u64 = 8;

/// `sizeof(ucontext_t)` on x86_64 glibc.
pub const UCONTEXT_SIZE: usize = 968;

/// Offset of `uc_mcontext.gregs` within `ucontext_t` on x86_64 glibc
/// (past `uc_flags`, `uc_link` and the 24-byte `uc_stack`).
pub const UCONTEXT_GREGS_OFFSET: usize = 0x28;

/// glibc general-register indices for the registers unwinding needs.
pub const GREG_RBP: usize = 10;
pub const GREG_RSP: usize = 15;
pub const GREG_RIP: usize = 16;

/// The libstdc++ `std::string` object: data pointer, then size, then a 16-byte
/// union of the SSO buffer and the heap capacity. Only the first two words
/// matter for reading the string out of a foreign address space.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct STD_STRING_REPR {
    pub data: u64,
    pub size: u64,
}

/// `sizeof(std::string)` on x86_64 libstdc++, SSO tail included.
pub const STD_STRING_SIZEOF: usize = 32;

/// The three registers that fully describe a suspended coroutine's resumption
/// point on x86_64: stack pointer, frame pointer, instruction pointer.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct UnwindRegisters {
    pub rsp: i64,
    pub rbp: i64,
    pub rip: i64,
}

impl UnwindRegisters {
    /// Extracts the unwind registers from a raw `ucontext_t` image.
    pub fn from_ucontext(bytes: &[u8]) -> Result<UnwindRegisters, scroll::Error> {
        let greg =
            |index: usize| bytes.pread_with::<i64>(UCONTEXT_GREGS_OFFSET + index * 8, LE);
        Ok(UnwindRegisters {
            rsp: greg(GREG_RSP)?,
            rbp: greg(GREG_RBP)?,
            rip: greg(GREG_RIP)?,
        })
    }

    /// Extracts the unwind registers from the fcontext save area read at
    /// `fcontext`. RSP is not part of the save area; the jump leaves it
    /// pointing right past it.
    pub fn from_fcontext(fcontext: u64, bytes: &[u8]) -> Result<UnwindRegisters, scroll::Error> {
        let area: FCONTEXT_SAVE_AREA = bytes.pread_with(0, LE)?;
        Ok(UnwindRegisters {
            rsp: (fcontext + FCONTEXT_SAVE_AREA_SIZE) as i64,
            rbp: area.rbp as i64,
            rip: area.rip as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_sizes() {
        assert_eq!(control_block_size(true), 40);
        assert_eq!(control_block_size(false), 32);
    }

    #[test]
    fn control_block_address_is_highest_aligned_slot() {
        // 0x10040000 - 40 - 64 = 0x1003ff98, aligned up to 0x1003ffc0.
        assert_eq!(control_block_address(0x10040000, 40), 0x1003ffc0);
        // Same slot for the 32-byte variant: alignment dominates.
        assert_eq!(control_block_address(0x10040000, 32), 0x1003ffc0);
        // An unaligned region end still lands on a 64-byte boundary below it.
        let p = control_block_address(0x10040070, 40);
        assert_eq!(p % CONTROL_BLOCK_ALIGN, 0);
        assert!(p + 40 <= 0x10040070);
        assert!(p + 40 + CONTROL_BLOCK_ALIGN > 0x10040070);
    }

    #[test]
    fn magic_folds_address_and_remaining_space() {
        let region_end = 0x10040000;
        let mmap_size = 266240;
        let p = control_block_address(region_end, control_block_size(true));
        let expected = expected_magic(p, mmap_size, region_end);
        assert_eq!(expected, CORO_MAGIC ^ p ^ (mmap_size - (region_end - p)));
        // A block that moved relative to the top of its mapping carries a
        // different tag.
        assert_ne!(expected, expected_magic(p, mmap_size, region_end + 0x1000));
    }

    #[test]
    fn fcontext_save_area_decodes() {
        let mut bytes = [0u8; FCONTEXT_SAVE_AREA_SIZE as usize];
        bytes[0x30..0x38].copy_from_slice(&0xDEADBEEF00000000u64.to_le_bytes());
        bytes[0x38..0x40].copy_from_slice(&0xCAFEBABE00000000u64.to_le_bytes());

        let regs = UnwindRegisters::from_fcontext(0x20000000, &bytes).unwrap();
        assert_eq!(regs.rsp, 0x20000040);
        assert_eq!(regs.rbp, 0xDEADBEEF00000000u64 as i64);
        assert_eq!(regs.rip, 0xCAFEBABE00000000u64 as i64);
    }

    #[test]
    fn ucontext_gregs_decode() {
        let mut bytes = vec![0u8; UCONTEXT_SIZE];
        let put = |bytes: &mut [u8], index: usize, value: u64| {
            let at = UCONTEXT_GREGS_OFFSET + index * 8;
            bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
        };
        put(&mut bytes, GREG_RSP, 0x7f0000001000);
        put(&mut bytes, GREG_RBP, 0x7f0000002000);
        put(&mut bytes, GREG_RIP, 0x401234);

        let regs = UnwindRegisters::from_ucontext(&bytes).unwrap();
        assert_eq!(regs.rsp, 0x7f0000001000);
        assert_eq!(regs.rbp, 0x7f0000002000);
        assert_eq!(regs.rip, 0x401234);
    }

    #[test]
    fn std_string_repr_decodes() {
        let mut bytes = [0u8; STD_STRING_SIZEOF];
        bytes[0..8].copy_from_slice(&0x7f0000003000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&11u64.to_le_bytes());

        let repr: STD_STRING_REPR = bytes.pread_with(0, LE).unwrap();
        assert_eq!(repr.data, 0x7f0000003000);
        assert_eq!(repr.size, 11);
    }

    #[test]
    fn state_bits() {
        let state = CoroState::from_bits_truncate(0b0110);
        assert!(state.contains(CoroState::COMPLETE));
        assert!(state.contains(CoroState::UNWIND));
        assert!(!state.contains(CoroState::DESTROY));
    }
}
