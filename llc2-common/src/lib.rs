//! This crate defines the [bit-exact layouts](format/index.html) of the userver coroutine
//! runtime structures that llc2 digs out of debuggee memory, as well as
//! [the capability traits](traits/index.html) llc2 expects a debugger host to provide.
//!
//! You probably don't want to use this crate directly, the [llc2][llc2] crate provides
//! the actual functionality of backtracing sleeping coroutines using the contracts
//! defined in this crate.
//!
//! [llc2]: https://crates.io/crates/llc2

pub mod format;
pub mod traits;
