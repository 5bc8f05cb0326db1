//! The capability traits llc2 expects a debugger host to provide.
//!
//! llc2 never talks to a debugger directly; it is written against this narrow
//! surface so the engine can be driven by any host able to answer these
//! questions about a stopped process (and by a synthetic host in tests):
//!
//! * [Debugger][] - the session root: selected target, terminal width.
//! * [Target][] - owns the debuggee process.
//! * [Process][] - memory-region enumeration and raw memory reads.
//! * [Thread][] - the selected thread's frame list.
//! * [Frame][] - frame descriptions, variable lookup, register access, PC updates.
//! * [Value][] - a node in the host's variable tree: type names, members,
//!   dereferencing, address-of, and register-slot writes.
//!
//! [CommandOutput][] stands in for the host's command-return object: everything
//! a command wants the user to see is appended there, success/failure travels
//! back separately as a `bool`.

use std::fmt;

/// An error reported by the debugger host, carrying the host's own message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> HostError {
        HostError(message.into())
    }
}

/// One mapped memory region of the debuggee, `[begin, end)` in the debuggee's
/// virtual address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub begin: u64,
    pub end: u64,
}

impl RegionInfo {
    /// Length of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

/// The debugger session the commands run inside.
pub trait Debugger {
    type Target: Target;

    /// The currently selected target, if any.
    fn selected_target(&self) -> Option<Self::Target>;

    /// Width of the user's terminal in columns.
    fn terminal_width(&self) -> usize;
}

/// A debug target (an executable plus its launched process).
pub trait Target {
    type Process: Process;

    /// The launched process, if any.
    fn process(&self) -> Option<Self::Process>;
}

/// A stopped debuggee process.
pub trait Process {
    type Thread: Thread;

    /// Enumerates the process's memory mappings. Order is host-defined;
    /// entries the host failed to describe come back as errors so callers can
    /// report them without aborting the enumeration.
    fn memory_regions(&self) -> Vec<Result<RegionInfo, HostError>>;

    /// Reads `buffer.len()` bytes of debuggee memory starting at `address`.
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<(), HostError>;

    /// The currently selected thread, if any.
    fn selected_thread(&self) -> Option<Self::Thread>;
}

/// The selected thread of a stopped process.
pub trait Thread {
    type Frame: Frame;

    /// Number of frames the host's unwinder currently reports.
    fn num_frames(&self) -> usize;

    /// The frame at `index`, 0 being the innermost.
    fn frame_at(&self, index: usize) -> Option<Self::Frame>;

    /// The frame whose registers the host considers current.
    fn selected_frame(&self) -> Option<Self::Frame>;
}

/// One stack frame of the selected thread.
pub trait Frame {
    type Value: Value;

    /// The host's one-line description of the frame (module, function,
    /// source location), without a trailing newline.
    fn description(&self) -> Option<String>;

    /// Looks up a variable visible in this frame by name.
    fn find_variable(&self, name: &str) -> Option<Self::Value>;

    /// The frame's in-scope arguments and/or locals.
    fn variables(&self, arguments: bool, locals: bool) -> Vec<Self::Value>;

    /// The "General Purpose Registers" value set of this frame; individual
    /// registers are its children (`rsp`, `rbp`, `rip`).
    fn general_purpose_registers(&self) -> Option<Self::Value>;

    /// Repoints the frame's program counter.
    fn set_pc(&self, pc: u64) -> Result<(), HostError>;
}

/// A node in the host's variable tree.
pub trait Value: Sized {
    /// The host's full description of the value (name, type, contents),
    /// without a trailing newline.
    fn description(&self) -> Option<String>;

    /// The display name of the value's type, e.g.
    /// `userver::engine::impl::TaskContext *`.
    fn display_type_name(&self) -> Option<String>;

    fn value_as_unsigned(&self) -> Option<u64>;

    fn value_as_signed(&self) -> Option<i64>;

    /// The address the value itself lives at in the debuggee.
    fn address_of(&self) -> Option<u64>;

    /// Follows a pointer-typed value to what it points at.
    fn dereference(&self) -> Option<Self>;

    /// A named struct member of this value.
    fn child_member(&self, name: &str) -> Option<Self>;

    /// Overwrites the value (register slots only, in practice).
    fn write_signed(&self, value: i64) -> Result<(), HostError>;
}

/// Convenience alias for the frame type a [`Process`]'s thread produces.
pub type FrameOf<P> = <<P as Process>::Thread as Thread>::Frame;

/// Accumulates the user-visible output of one command, mirroring the host's
/// command-return object.
#[derive(Debug, Default)]
pub struct CommandOutput {
    text: String,
}

impl CommandOutput {
    pub fn new() -> CommandOutput {
        CommandOutput::default()
    }

    /// Appends a line of output (a newline is added).
    pub fn append_message(&mut self, message: &str) {
        self.text.push_str(message);
        self.text.push('\n');
    }

    /// Appends raw text, no newline.
    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Everything appended so far.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_len() {
        let region = RegionInfo { begin: 0x1000, end: 0x3000 };
        assert_eq!(region.len(), 0x2000);
        assert!(!region.is_empty());
        assert_eq!(region.to_string(), "[0x1000, 0x3000)");
    }

    #[test]
    fn command_output_accumulates() {
        let mut out = CommandOutput::new();
        out.append_message("first");
        out.append("second");
        assert_eq!(out.text(), "first\nsecond");
    }
}
