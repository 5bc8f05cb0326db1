// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The `llc2 init` and `llc2 bt` command entry points.
//!
//! Hosts call [`init`] and [`backtrace`] with the raw argument tokens of the
//! command line and a [`CommandOutput`] to fill; the returned `bool` is the
//! command's success flag. Both run inside a catch-all wrapper so that no
//! internal failure ever propagates into the host.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use clap::Parser;
use tracing::debug;

use crate::context;
use crate::regions;
use crate::registers::FrameRegistersGuard;
use crate::render::{self, RenderOptions, Sentinels};
use crate::settings;
use crate::traits::{CommandOutput, Debugger, Process, Target};

/// The expected ways a command can fail; the display string is exactly what
/// the user sees.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to parse init options")]
    InvalidInitOptions,
    #[error("Failed to parse bt options")]
    InvalidBtOptions,
    #[error("LLC2 plugin is not initialized")]
    Uninitialized,
    #[error("No target selected")]
    NoTarget,
    #[error("No process launched")]
    NoProcess,
    #[error("No thread selected")]
    NoThread,
}

/// Runs a command body, converting expected errors into their message and
/// anything escaping (including panics) into a one-line apology, so the host
/// only ever sees output plus a success flag.
fn run_command<F>(out: &mut CommandOutput, body: F) -> bool
where
    F: FnOnce(&mut CommandOutput) -> Result<(), CommandError>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(&mut *out))) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            out.append_message(&err.to_string());
            false
        }
        Err(payload) => {
            let cause = payload
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| payload.downcast_ref::<&str>().copied())
                .unwrap_or("<cause unknown>");
            out.append_message(&format!("Something went terribly wrong: {cause}"));
            false
        }
    }
}

/// `llc2 init` - (re)configure the plugin for the debuggee at hand.
///
/// A failed init leaves the plugin unconfigured on purpose: stale settings
/// from a previous debuggee are worse than no settings.
pub fn init(args: &[&str], out: &mut CommandOutput) -> bool {
    run_command(out, |out| init_inner(args, out))
}

fn init_inner(args: &[&str], out: &mut CommandOutput) -> Result<(), CommandError> {
    settings::replace(None);

    let settings = settings::parse_init_args(args).map_err(|err| {
        debug!(error = %err, "init options rejected");
        CommandError::InvalidInitOptions
    })?;

    out.append_message("LLC2 plugin initialized. Settings:");
    out.append_message(&format!("stack_size: {}", settings.stack_size));
    out.append_message(&format!(
        "context implementation: {}",
        settings.context_implementation
    ));
    out.append_message(&format!("with magic: {}", settings.with_magic));
    out.append_message(&format!(
        "filter by: {}",
        settings.filter_by.as_deref().unwrap_or("(null)")
    ));
    out.append_message(&format!(
        "truncate at: {}",
        settings.truncate_at.as_deref().unwrap_or("(null)")
    ));

    settings::replace(Some(settings));
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(name = "llc2 bt")]
struct BtArgs {
    /// Also dump every frame's arguments and locals.
    #[clap(short = 'f', long = "full")]
    full: bool,

    /// Only backtrace the coroutine whose stack begins at this hex address.
    #[clap(short = 's', long = "stack_address")]
    stack_address: Option<String>,
}

/// Parses the `-s` token. The whole token must be hex (an optional `0x`
/// prefix aside); anything else deactivates the filter rather than failing
/// the command.
fn parse_stack_address(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

/// `llc2 bt` - find every sleeping coroutine and print its backtrace.
pub fn backtrace<D: Debugger>(debugger: &D, args: &[&str], out: &mut CommandOutput) -> bool {
    run_command(out, |out| backtrace_inner(debugger, args, out))
}

fn backtrace_inner<D: Debugger>(
    debugger: &D,
    args: &[&str],
    out: &mut CommandOutput,
) -> Result<(), CommandError> {
    let bt_args = BtArgs::try_parse_from(std::iter::once("llc2").chain(args.iter().copied()))
        .map_err(|err| {
            debug!(error = %err, "bt options rejected");
            CommandError::InvalidBtOptions
        })?;
    let stack_filter = bt_args.stack_address.as_deref().and_then(parse_stack_address);

    let settings = settings::get().ok_or(CommandError::Uninitialized)?;

    let options = RenderOptions {
        full: bt_args.full,
        terminal_width: debugger.terminal_width(),
        sentinels: Sentinels::default(),
    };

    let target = debugger.selected_target().ok_or(CommandError::NoTarget)?;
    let process = target.process().ok_or(CommandError::NoProcess)?;
    let thread = process.selected_thread().ok_or(CommandError::NoThread)?;

    let command_timer = Instant::now();

    let memory_regions = regions::process_memory_regions(&process, out);
    let mut guard = FrameRegistersGuard::new(&thread);
    for region in &memory_regions {
        if !regions::is_coroutine_stack(region, settings.real_stack_size()) {
            continue;
        }

        // Not the stack top or bottom as such, just a stable name for this
        // coroutine's mapping.
        let stack_address = region.begin;
        if stack_filter.map_or(false, |filter| filter != stack_address) {
            continue;
        }

        let Some(regs) = context::try_find_coro_registers(&process, &settings, region, out)
        else {
            continue;
        };

        let coro_timer = Instant::now();
        guard.install(&regs, out);
        render::backtrace_coroutine(&process, &thread, stack_address, &options, out);
        out.append_message(&format!(
            "coro backtrace duration: {}ms",
            coro_timer.elapsed().as_millis()
        ));
    }

    // Put the real registers back before reporting the total, so the timer
    // line is the last thing a run prints.
    drop(guard);
    out.append_message(&format!(
        "llc2 bt duration: {}ms",
        command_timer.elapsed().as_millis()
    ));
    Ok(())
}
