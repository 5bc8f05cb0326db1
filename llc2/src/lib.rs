//! llc2 - backtraces for sleeping userver coroutines.
//!
//! The userver engine parks every suspended coroutine on its own mmap'd stack,
//! with a Boost.Coroutine2 control block near the top of the mapping pointing
//! at the saved machine state. A plain `bt` in a debugger only ever shows the
//! coroutines that are *running*; everything that is asleep is invisible.
//!
//! This crate recovers the sleepers: it scans the debuggee's memory mappings
//! for coroutine-stack-sized regions, digs the control block and the fiber
//! save area out of each one, swaps the selected thread's RSP/RBP/RIP to the
//! coroutine's saved values so the host's own unwinder produces the sleeping
//! stack, renders it, and puts the real registers back.
//!
//! The crate is written against the host-capability traits in
//! [`llc2_common::traits`] rather than any concrete debugger API; the thin
//! plugin shim that registers the `llc2 init` / `llc2 bt` commands with a real
//! debugger lives with the host, not here.
//!
//! ```no_run
//! use llc2::traits::{CommandOutput, Debugger};
//!
//! fn on_bt_command<D: Debugger>(debugger: &D, args: &[&str]) -> (bool, String) {
//!     let mut out = CommandOutput::new();
//!     let ok = llc2::commands::backtrace(debugger, args, &mut out);
//!     (ok, out.text().to_string())
//! }
//! ```

pub mod commands;
pub mod context;
pub mod regions;
pub mod registers;
pub mod render;
pub mod settings;

pub use llc2_common::format;
pub use llc2_common::traits;

pub use commands::{backtrace, init};
pub use settings::{ContextImplementation, Settings};
