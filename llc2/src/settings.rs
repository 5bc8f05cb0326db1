// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The process-wide plugin configuration, written once by `llc2 init` and read
//! by everything else.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use clap::Parser;

use crate::format::PAGE_SIZE;

/// The smallest coroutine stack any sane runtime configuration uses.
pub const MIN_STACK_SIZE: u64 = 16 * 1024;

/// Which context-switching backend the debuggee's engine was built with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextImplementation {
    Ucontext,
    Fcontext,
}

impl fmt::Display for ContextImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextImplementation::Ucontext => f.write_str("ucontext"),
            ContextImplementation::Fcontext => f.write_str("fcontext"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown context implementation '{0}', expected 'ucontext' or 'fcontext'")]
pub struct UnknownContextImplementation(String);

impl FromStr for ContextImplementation {
    type Err = UnknownContextImplementation;

    fn from_str(s: &str) -> Result<ContextImplementation, UnknownContextImplementation> {
        match s {
            "ucontext" => Ok(ContextImplementation::Ucontext),
            "fcontext" => Ok(ContextImplementation::Fcontext),
            other => Err(UnknownContextImplementation(other.to_string())),
        }
    }
}

/// Everything `llc2 init` learned about the debuggee's coroutine setup.
///
/// Immutable once stored; the next `init` replaces the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Coroutine stack size the debuggee was configured with, in bytes.
    pub stack_size: u64,
    pub context_implementation: ContextImplementation,
    /// Whether the runtime stamps the integrity tag into control blocks.
    pub with_magic: bool,
    /// Reserved filter expression; parsed and stored, not consumed yet.
    pub filter_by: Option<String>,
    /// Reserved truncation marker; parsed and stored, not consumed yet.
    pub truncate_at: Option<String>,
}

impl Settings {
    /// Total bytes mmap'd per coroutine: the stack rounded up to whole pages,
    /// plus one guard page at the bottom.
    pub fn mmap_size(&self) -> u64 {
        let pages = (self.stack_size + PAGE_SIZE - 1) / PAGE_SIZE;
        (pages + 1) * PAGE_SIZE
    }

    /// Bytes usable as stack, i.e. the mapping minus the guard page. This is
    /// the length coroutine stack regions show up with in the region list.
    pub fn real_stack_size(&self) -> u64 {
        self.mmap_size() - PAGE_SIZE
    }

    /// Renders the settings back into the argument vector `parse_init_args`
    /// would accept to reproduce them.
    pub fn to_init_args(&self) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.stack_size.to_string(),
            "-c".to_string(),
            self.context_implementation.to_string(),
        ];
        if self.with_magic {
            args.push("-m".to_string());
        }
        if let Some(filter_by) = &self.filter_by {
            args.push("-f".to_string());
            args.push(filter_by.clone());
        }
        if let Some(truncate_at) = &self.truncate_at {
            args.push("-t".to_string());
            args.push(truncate_at.clone());
        }
        args
    }
}

#[derive(Parser, Debug)]
#[clap(name = "llc2 init")]
struct InitArgs {
    /// Coroutine stack size in bytes.
    #[clap(short = 's', long = "stack_size")]
    stack_size: u64,

    /// Context switching backend: ucontext or fcontext.
    #[clap(short = 'c', long = "context_implementation", default_value = "ucontext")]
    context_implementation: ContextImplementation,

    /// The runtime stamps an integrity tag into control blocks.
    #[clap(short = 'm', long = "with_magic")]
    with_magic: bool,

    /// Reserved: only backtrace coroutines matching this filter.
    #[clap(short = 'f', long = "filter_by")]
    filter_by: Option<String>,

    /// Reserved: truncate backtraces at frames matching this marker.
    #[clap(short = 't', long = "truncate_at")]
    truncate_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Options(#[from] clap::Error),
    #[error("stack size {0} is out of range")]
    InvalidStackSize(u64),
}

/// Parses and validates `llc2 init` options into a [`Settings`] snapshot.
pub fn parse_init_args(args: &[&str]) -> Result<Settings, SettingsError> {
    let parsed = InitArgs::try_parse_from(std::iter::once("llc2").chain(args.iter().copied()))?;

    if parsed.stack_size == 0
        || parsed.stack_size == u64::MAX
        || parsed.stack_size < MIN_STACK_SIZE
    {
        return Err(SettingsError::InvalidStackSize(parsed.stack_size));
    }

    Ok(Settings {
        stack_size: parsed.stack_size,
        context_implementation: parsed.context_implementation,
        with_magic: parsed.with_magic,
        filter_by: parsed.filter_by,
        truncate_at: parsed.truncate_at,
    })
}

static STORE: RwLock<Option<Arc<Settings>>> = RwLock::new(None);

/// The active settings, or `None` before the first successful `init`.
pub fn get() -> Option<Arc<Settings>> {
    STORE.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Atomically replaces (or clears) the active settings.
pub fn replace(settings: Option<Settings>) {
    *STORE.write().unwrap_or_else(|e| e.into_inner()) = settings.map(Arc::new);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        parse_init_args(&["-s", "262144", "-c", "fcontext", "-m"]).unwrap()
    }

    #[test]
    fn derived_sizes() {
        let settings = valid();
        assert_eq!(settings.mmap_size(), 266240);
        assert_eq!(settings.real_stack_size(), 262144);

        // An uneven stack size rounds up to whole pages before the guard page
        // is added.
        let settings = parse_init_args(&["-s", "20000"]).unwrap();
        assert_eq!(settings.mmap_size(), 6 * 4096);
        assert_eq!(settings.real_stack_size(), 5 * 4096);
    }

    #[test]
    fn stack_size_bounds() {
        assert!(parse_init_args(&["-s", "16384"]).is_ok());
        assert!(matches!(
            parse_init_args(&["-s", "16383"]),
            Err(SettingsError::InvalidStackSize(16383))
        ));
        assert!(matches!(
            parse_init_args(&["-s", "0"]),
            Err(SettingsError::InvalidStackSize(0))
        ));
        assert!(matches!(
            parse_init_args(&["-s", &u64::MAX.to_string()]),
            Err(SettingsError::InvalidStackSize(u64::MAX))
        ));
        // -s is mandatory.
        assert!(parse_init_args(&[]).is_err());
    }

    #[test]
    fn context_implementation_is_checked() {
        assert_eq!(
            parse_init_args(&["-s", "262144"]).unwrap().context_implementation,
            ContextImplementation::Ucontext
        );
        assert!(parse_init_args(&["-s", "262144", "-c", "libco"]).is_err());
    }

    #[test]
    fn reserved_options_are_stored() {
        let settings =
            parse_init_args(&["-s", "262144", "-f", "handler", "-t", "EventLoop"]).unwrap();
        assert_eq!(settings.filter_by.as_deref(), Some("handler"));
        assert_eq!(settings.truncate_at.as_deref(), Some("EventLoop"));
    }

    #[test]
    fn init_args_round_trip() {
        for settings in [
            valid(),
            parse_init_args(&["-s", "65536"]).unwrap(),
            parse_init_args(&["-s", "262144", "-f", "handler", "-t", "EventLoop"]).unwrap(),
        ] {
            let args = settings.to_init_args();
            let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            assert_eq!(parse_init_args(&args).unwrap(), settings);
        }
    }

    #[test]
    fn store_replace_and_clear() {
        replace(Some(valid()));
        assert_eq!(get().unwrap().stack_size, 262144);
        replace(None);
        assert!(get().is_none());
    }
}
