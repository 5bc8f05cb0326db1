// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Rendering the backtrace of one sleeping coroutine.
//!
//! By the time this module runs, the register swap guard has already pointed
//! the selected thread at the coroutine's saved state, so the host's unwinder
//! reports the sleeping stack. What's left is recognizing whether the stack
//! really is a parked userver coroutine, trimming the runtime glue off the
//! top, fishing the tracing span out of the sleep frame, and printing.

use scroll::{Pread, LE};
use tracing::trace;

use crate::format::{STD_STRING_REPR, STD_STRING_SIZEOF};
use crate::traits::{CommandOutput, Frame, FrameOf, Process, Thread, Value};

/// Longest string the by-value reader will copy out of the debuggee.
const MAX_STRING_LEN: u64 = 100;

/// What a missing or unreadable span field renders as.
const NONE_PLACEHOLDER: &str = "(none)";

/// The frame-name markers the renderer keys off.
///
/// Defaults are the userver symbols; they are plain data because sentinel
/// detection is only as reliable as the debuggee's inlining decisions, and a
/// rebuilt runtime may need different markers.
#[derive(Debug, Clone)]
pub struct Sentinels {
    /// A frame containing this is the runtime's sleep primitive; its presence
    /// is what makes a stack a sleeping coroutine.
    pub sleep_mark: String,
    /// A frame containing this is the coroutine entry point; it and anything
    /// above it is runtime glue not worth printing.
    pub entry_mark: String,
    /// Display-type suffix of the task context pointer in the sleep frame.
    pub task_context_type: String,
}

impl Default for Sentinels {
    fn default() -> Sentinels {
        Sentinels {
            sleep_mark: "engine::impl::TaskContext::Sleep(".to_string(),
            entry_mark: "utils::impl::WrappedCallImpl<".to_string(),
            task_context_type: "engine::impl::TaskContext *".to_string(),
        }
    }
}

/// How [`backtrace_coroutine`] should print.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Dump each frame's arguments and locals under the frame line.
    pub full: bool,
    /// Terminal width used for centering titles and sizing dash runs.
    pub terminal_width: usize,
    pub sentinels: Sentinels,
}

/// The tracing span of the request the coroutine is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SpanInfo {
    name: String,
    span_id: String,
    trace_id: String,
}

/// Prints the backtrace of the coroutine whose registers are currently
/// installed, if the frames the host reports look like a parked coroutine.
///
/// Produces no output when the sleep sentinel is missing (not a userver
/// coroutine) or sits at frame 0 (the coroutine is mid-switch and already
/// visible in a plain `bt`).
pub fn backtrace_coroutine<P: Process>(
    process: &P,
    thread: &<P as Process>::Thread,
    stack_address: u64,
    options: &RenderOptions,
    out: &mut CommandOutput,
) {
    let num_frames = thread.num_frames();

    let mut has_sleep = false;
    let mut wrapped_call_frame = num_frames;
    let mut descriptions: Vec<Option<String>> = Vec::with_capacity(num_frames);
    let mut span_info: Option<SpanInfo> = None;

    // Capture all descriptions up front: installing the next coroutine's
    // registers invalidates whatever the host would report later.
    for index in 0..num_frames {
        let frame = thread.frame_at(index);
        let description = frame.as_ref().and_then(|f| f.description());
        descriptions.push(description.clone());

        let Some(description) = description else { continue };

        if description.contains(&options.sentinels.sleep_mark) {
            if index == 0 {
                // The coroutine is in the middle of going to sleep: it is
                // running right now and shows up in a plain bt, and its
                // control block may not be fully set up yet.
                trace!(stack_address, "sleep frame at index 0, skipping");
                break;
            }
            has_sleep = true;

            if span_info.is_none() {
                if let Some(frame) = &frame {
                    span_info = extract_span_info(process, frame, &options.sentinels, out);
                }
            }
        }

        if description.contains(&options.sentinels.entry_mark) {
            wrapped_call_frame = index;
            break;
        }
    }

    if !has_sleep {
        return;
    }

    out.append_message(&full_width_line(
        "FOUND SLEEPING COROUTINE",
        options.terminal_width,
        true,
    ));

    let address_line = format!("coro stack address: {stack_address:#x}");
    let underline = "-".repeat(address_line.len());
    out.append_message(&address_line);
    out.append_message(&underline);

    if let Some(span) = &span_info {
        let span_line = format!(
            "Parent span (name, span_id, trace_id): {} | {} | {}",
            span.name, span.span_id, span.trace_id
        );
        let underline = "-".repeat(span_line.len());
        out.append_message(&span_line);
        out.append_message(&underline);
    }

    for index in 0..wrapped_call_frame {
        if let Some(description) = &descriptions[index] {
            out.append_message(description);
        }
        if options.full {
            if let Some(frame) = thread.frame_at(index) {
                dump_variables(&frame, true, false, options.terminal_width, out);
                dump_variables(&frame, false, true, options.terminal_width, out);
            }
        }
    }
}

/// Prints the frame's arguments or locals under a left-aligned header. No
/// header, no output when the frame has none in scope.
fn dump_variables<F: Frame>(
    frame: &F,
    arguments: bool,
    locals: bool,
    terminal_width: usize,
    out: &mut CommandOutput,
) {
    let variables = frame.variables(arguments, locals);
    if variables.is_empty() {
        return;
    }

    let title = if arguments { "FRAME ARGUMENTS" } else { "FRAME LOCALS" };
    out.append_message(&full_width_line(title, terminal_width, false));

    for variable in variables {
        if let Some(description) = variable.description() {
            out.append_message(&description);
        }
    }
}

/// Follows `this -> parent_span_ -> pimpl_ -> {name_, span_id_, trace_id_}`
/// from the sleep frame. Any break in the chain means no span; individual
/// unreadable strings degrade to a placeholder.
fn extract_span_info<P: Process>(
    process: &P,
    frame: &FrameOf<P>,
    sentinels: &Sentinels,
    out: &mut CommandOutput,
) -> Option<SpanInfo> {
    let task_context_ptr = frame.find_variable("this")?;
    let type_name = task_context_ptr.display_type_name()?;
    if !type_name.ends_with(&sentinels.task_context_type) {
        return None;
    }

    let task_context = task_context_ptr.dereference()?;
    let span_ptr = task_context.child_member("parent_span_")?;
    if span_ptr.value_as_unsigned().unwrap_or(0) == 0 {
        return None;
    }

    let span_impl = span_ptr.dereference()?.child_member("pimpl_")?.dereference()?;

    let mut read_member = |name: &str| {
        span_impl
            .child_member(name)
            .and_then(|member| member.address_of())
            .and_then(|address| read_std_string(process, address, out))
            .unwrap_or_else(|| NONE_PLACEHOLDER.to_string())
    };

    Some(SpanInfo {
        name: read_member("name_"),
        span_id: read_member("span_id_"),
        trace_id: read_member("trace_id_"),
    })
}

/// Reads a `std::string` living at `address` in the debuggee by copying its
/// object representation and chasing the data pointer by hand.
///
/// Debug info for the string type may have been optimized out of the debuggee
/// entirely, so this never asks the host to interpret the type. The length
/// cap keeps a garbage descriptor from triggering a huge read.
fn read_std_string<P: Process>(
    process: &P,
    address: u64,
    out: &mut CommandOutput,
) -> Option<String> {
    if address == 0 {
        return None;
    }

    let mut buffer = [0u8; STD_STRING_SIZEOF];
    if let Err(err) = process.read_memory(address, &mut buffer) {
        out.append_message(&format!(
            "Failed to read std::string from process memory: {err}"
        ));
        return None;
    }

    let repr: STD_STRING_REPR = buffer.pread_with(0, LE).ok()?;
    if repr.size > MAX_STRING_LEN {
        return None;
    }

    let mut data = vec![0u8; repr.size as usize];
    if let Err(err) = process.read_memory(repr.data, &mut data) {
        out.append_message(&format!(
            "Failed to read std::string from process memory: {err}"
        ));
        return None;
    }

    String::from_utf8(data).ok()
}

/// Lays `what` out across the terminal: centered between dash runs, or
/// left-aligned with the dashes trailing. Falls back to the bare text when
/// the terminal is too narrow.
fn full_width_line(what: &str, terminal_width: usize, center: bool) -> String {
    if what.len() + 2 > terminal_width {
        return what.to_string();
    }

    let num_dashes = (terminal_width - what.len() - 2) / 2;
    let dashes = "-".repeat(num_dashes);
    if center {
        format!("{dashes} {what} {dashes}")
    } else {
        format!("{what} {}", "-".repeat(num_dashes * 2))
    }
}
