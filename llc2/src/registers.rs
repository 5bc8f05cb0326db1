// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Swapping the selected thread's registers to a coroutine's saved state, and
//! putting them back no matter how the command exits.

use tracing::warn;

use crate::format::UnwindRegisters;
use crate::traits::{CommandOutput, Frame, Thread, Value};

/// Scoped ownership of the selected frame's RSP/RBP/RIP.
///
/// The first [`install`](Self::install) snapshots the real registers; further
/// installs only overwrite, so a whole `bt` run across many coroutines still
/// restores the one original state. Dropping the guard writes the snapshot
/// back and repoints the PC, unconditionally.
pub struct FrameRegistersGuard<'t, T: Thread> {
    thread: &'t T,
    saved: Option<UnwindRegisters>,
}

impl<'t, T: Thread> FrameRegistersGuard<'t, T> {
    pub fn new(thread: &'t T) -> FrameRegistersGuard<'t, T> {
        FrameRegistersGuard { thread, saved: None }
    }

    /// Points the frame's registers at `regs`. Individual register-write
    /// failures are reported and skipped; the snapshot keeps whatever the
    /// host returned for the untouched registers.
    pub fn install(&mut self, regs: &UnwindRegisters, out: &mut CommandOutput) {
        let Some(frame) = self.thread.selected_frame() else {
            out.append_message("Failed to get selected frame");
            return;
        };
        let Some(registers) = frame.general_purpose_registers() else {
            out.append_message("Failed to get General Purpose Registers");
            return;
        };

        let old = UnwindRegisters {
            rsp: update_register(&registers, "rsp", regs.rsp, out),
            rbp: update_register(&registers, "rbp", regs.rbp, out),
            rip: update_register(&registers, "rip", regs.rip, out),
        };
        if self.saved.is_none() {
            self.saved = Some(old);
        }

        if let Err(err) = frame.set_pc(regs.rip as u64) {
            out.append_message(&format!("Failed to set PC: {err}"));
        }
    }
}

impl<'t, T: Thread> Drop for FrameRegistersGuard<'t, T> {
    fn drop(&mut self) {
        let Some(old) = self.saved.take() else {
            return;
        };

        let Some(frame) = self.thread.selected_frame() else {
            warn!("selected frame gone, cannot restore registers");
            return;
        };
        let Some(registers) = frame.general_purpose_registers() else {
            warn!("register set gone, cannot restore registers");
            return;
        };

        for (name, value) in [("rsp", old.rsp), ("rbp", old.rbp), ("rip", old.rip)] {
            let Some(register) = registers.child_member(name) else {
                warn!(name, "register not found during restore");
                continue;
            };
            if let Err(err) = register.write_signed(value) {
                warn!(name, error = %err, "register restore failed");
            }
        }
        if let Err(err) = frame.set_pc(old.rip as u64) {
            warn!(error = %err, "PC restore failed");
        }
    }
}

/// Writes one named register and returns its previous value (0 when the host
/// cannot produce one, matching the host convention for unreadable values).
fn update_register<V: Value>(
    registers: &V,
    name: &str,
    value: i64,
    out: &mut CommandOutput,
) -> i64 {
    let Some(register) = registers.child_member(name) else {
        out.append_message(&format!("Failed to update '{name}' register"));
        return 0;
    };

    let previous = register.value_as_signed().unwrap_or(0);
    if register.write_signed(value).is_err() {
        out.append_message(&format!("Failed to update '{name}' register"));
    }

    previous
}
