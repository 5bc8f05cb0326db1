// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic Debugger Hosts for Testing
//!
//! This crate fakes just enough of a debugger to drive llc2 end to end
//! without a live debuggee: a sparse memory map, a region list, a frame
//! stack with variable trees, and a register file that records every write.
//! It exists as an internal dev-dependency of llc2, but is published for the
//! sake of satisfying cargo-publish.
//!
//! Basic usage is to build a [SynthDebugger][] with its `add_*`/`set_*`
//! methods, hand it to the llc2 commands, and then inspect the output and
//! the recorded register traffic.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use llc2_common::traits::{
    CommandOutput, Debugger, Frame, HostError, Process, RegionInfo, Target, Thread, Value,
};
use test_assembler::Section;

/// The synthetic thread's general purpose registers, plus the frame PC the
/// host tracks separately.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub rsp: i64,
    pub rbp: i64,
    pub rip: i64,
    pub pc: u64,
}

#[derive(Default)]
struct ProcessState {
    /// Sparse debuggee memory: base address -> contents.
    memory: BTreeMap<u64, Vec<u8>>,
    /// What region enumeration hands back, in staged order.
    regions: Vec<Result<RegionInfo, HostError>>,
    frames: Vec<FrameData>,
    registers: RegisterFile,
    /// When set, every register write is rejected (but still recorded).
    fail_register_writes: bool,
    register_writes: Vec<(String, i64)>,
    pc_writes: Vec<u64>,
    has_process: bool,
    has_thread: bool,
}

#[derive(Default)]
struct FrameData {
    description: Option<String>,
    arguments: Vec<SynthValue>,
    locals: Vec<SynthValue>,
    variables: Vec<(String, SynthValue)>,
}

/// A writer of synthetic debugger sessions.
pub struct SynthDebugger {
    state: Rc<RefCell<ProcessState>>,
    terminal_width: usize,
    has_target: bool,
}

impl Default for SynthDebugger {
    fn default() -> SynthDebugger {
        SynthDebugger::new()
    }
}

impl SynthDebugger {
    /// A session with a target, a process and a selected thread, an 80-column
    /// terminal, and nothing mapped.
    pub fn new() -> SynthDebugger {
        let state = ProcessState {
            has_process: true,
            has_thread: true,
            ..ProcessState::default()
        };
        SynthDebugger {
            state: Rc::new(RefCell::new(state)),
            terminal_width: 80,
            has_target: true,
        }
    }

    pub fn without_target(mut self) -> SynthDebugger {
        self.has_target = false;
        self
    }

    pub fn without_process(self) -> SynthDebugger {
        self.state.borrow_mut().has_process = false;
        self
    }

    pub fn without_thread(self) -> SynthDebugger {
        self.state.borrow_mut().has_thread = false;
        self
    }

    pub fn set_terminal_width(mut self, width: usize) -> SynthDebugger {
        self.terminal_width = width;
        self
    }

    /// Stages the thread's register file (the PC follows `rip`).
    pub fn set_registers(self, rsp: i64, rbp: i64, rip: i64) -> SynthDebugger {
        self.state.borrow_mut().registers = RegisterFile { rsp, rbp, rip, pc: rip as u64 };
        self
    }

    /// Makes every subsequent register write fail, as a host refusing
    /// register updates would.
    pub fn fail_register_writes(self) -> SynthDebugger {
        self.state.borrow_mut().fail_register_writes = true;
        self
    }

    /// Adds an entry to the region list.
    pub fn add_region(self, begin: u64, end: u64) -> SynthDebugger {
        self.state
            .borrow_mut()
            .regions
            .push(Ok(RegionInfo { begin, end }));
        self
    }

    /// Adds a region-list entry the host fails to describe.
    pub fn add_region_error(self, message: &str) -> SynthDebugger {
        self.state
            .borrow_mut()
            .regions
            .push(Err(HostError::new(message)));
        self
    }

    /// Maps `bytes` at `address` in the synthetic debuggee.
    pub fn add_memory(self, address: u64, bytes: &[u8]) -> SynthDebugger {
        self.state.borrow_mut().memory.insert(address, bytes.to_vec());
        self
    }

    /// Maps an assembled [`Section`] at its start address.
    ///
    /// Returns `None` when the section has no constant start address or its
    /// contents contain undefined labels.
    pub fn add_section(self, section: Section) -> Option<SynthDebugger> {
        let address = section.start().value()?;
        let bytes = section.get_contents()?;
        Some(self.add_memory(address, &bytes))
    }

    /// Appends a frame with just a description to the thread's stack.
    pub fn add_frame(self, description: &str) -> SynthDebugger {
        self.add_frame_with(FrameBuilder::new(description))
    }

    /// Appends a fully specified frame to the thread's stack.
    pub fn add_frame_with(self, frame: FrameBuilder) -> SynthDebugger {
        self.state.borrow_mut().frames.push(frame.data);
        self
    }

    /// The register file as the debuggee would see it right now.
    pub fn registers(&self) -> RegisterFile {
        self.state.borrow().registers
    }

    /// Every register write the session performed, in order.
    pub fn register_writes(&self) -> Vec<(String, i64)> {
        self.state.borrow().register_writes.clone()
    }

    /// Every PC update the session performed, in order.
    pub fn pc_writes(&self) -> Vec<u64> {
        self.state.borrow().pc_writes.clone()
    }
}

/// Builds one synthetic stack frame.
pub struct FrameBuilder {
    data: FrameData,
}

impl FrameBuilder {
    pub fn new(description: &str) -> FrameBuilder {
        FrameBuilder {
            data: FrameData {
                description: Some(description.to_string()),
                ..FrameData::default()
            },
        }
    }

    /// A frame the host has no description for.
    pub fn undescribed() -> FrameBuilder {
        FrameBuilder { data: FrameData::default() }
    }

    pub fn argument(mut self, value: SynthValue) -> FrameBuilder {
        self.data.arguments.push(value);
        self
    }

    pub fn local(mut self, value: SynthValue) -> FrameBuilder {
        self.data.locals.push(value);
        self
    }

    /// A variable findable by name (e.g. `this`).
    pub fn variable(mut self, name: &str, value: SynthValue) -> FrameBuilder {
        self.data.variables.push((name.to_string(), value));
        self
    }
}

/// A node of the synthetic variable tree.
#[derive(Clone)]
pub struct SynthValue {
    kind: Rc<ValueKind>,
}

enum ValueKind {
    Data(ValueData),
    RegisterBank(Rc<RefCell<ProcessState>>),
    Register {
        state: Rc<RefCell<ProcessState>>,
        name: &'static str,
    },
}

#[derive(Default)]
struct ValueData {
    description: Option<String>,
    type_name: Option<String>,
    unsigned: Option<u64>,
    address: Option<u64>,
    pointee: Option<SynthValue>,
    children: Vec<(String, SynthValue)>,
}

impl SynthValue {
    fn data(data: ValueData) -> SynthValue {
        SynthValue { kind: Rc::new(ValueKind::Data(data)) }
    }

    /// A leaf whose only point is how it prints in a variables dump.
    pub fn described(description: &str) -> SynthValue {
        SynthValue::data(ValueData {
            description: Some(description.to_string()),
            ..ValueData::default()
        })
    }

    /// A non-null pointer with a display type, dereferencing to `pointee`.
    pub fn pointer(type_name: &str, value: u64, pointee: SynthValue) -> SynthValue {
        SynthValue::data(ValueData {
            type_name: Some(type_name.to_string()),
            unsigned: Some(value),
            pointee: Some(pointee),
            ..ValueData::default()
        })
    }

    /// A null pointer with a display type.
    pub fn null_pointer(type_name: &str) -> SynthValue {
        SynthValue::data(ValueData {
            type_name: Some(type_name.to_string()),
            unsigned: Some(0),
            ..ValueData::default()
        })
    }

    /// A struct with named members.
    pub fn structure(children: Vec<(&str, SynthValue)>) -> SynthValue {
        SynthValue::data(ValueData {
            children: children
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            ..ValueData::default()
        })
    }

    /// A member object living at `address` in the debuggee.
    pub fn at_address(address: u64) -> SynthValue {
        SynthValue::data(ValueData { address: Some(address), ..ValueData::default() })
    }
}

impl Value for SynthValue {
    fn description(&self) -> Option<String> {
        match &*self.kind {
            ValueKind::Data(data) => data.description.clone(),
            _ => None,
        }
    }

    fn display_type_name(&self) -> Option<String> {
        match &*self.kind {
            ValueKind::Data(data) => data.type_name.clone(),
            _ => None,
        }
    }

    fn value_as_unsigned(&self) -> Option<u64> {
        match &*self.kind {
            ValueKind::Data(data) => data.unsigned,
            ValueKind::Register { state, name } => {
                Some(register_get(&state.borrow().registers, name) as u64)
            }
            ValueKind::RegisterBank(_) => None,
        }
    }

    fn value_as_signed(&self) -> Option<i64> {
        match &*self.kind {
            ValueKind::Data(data) => data.unsigned.map(|value| value as i64),
            ValueKind::Register { state, name } => {
                Some(register_get(&state.borrow().registers, name))
            }
            ValueKind::RegisterBank(_) => None,
        }
    }

    fn address_of(&self) -> Option<u64> {
        match &*self.kind {
            ValueKind::Data(data) => data.address,
            _ => None,
        }
    }

    fn dereference(&self) -> Option<SynthValue> {
        match &*self.kind {
            ValueKind::Data(data) => data.pointee.clone(),
            _ => None,
        }
    }

    fn child_member(&self, name: &str) -> Option<SynthValue> {
        match &*self.kind {
            ValueKind::Data(data) => data
                .children
                .iter()
                .find(|(child, _)| child == name)
                .map(|(_, value)| value.clone()),
            ValueKind::RegisterBank(state) => {
                let name = match name {
                    "rsp" => "rsp",
                    "rbp" => "rbp",
                    "rip" => "rip",
                    _ => return None,
                };
                Some(SynthValue {
                    kind: Rc::new(ValueKind::Register { state: state.clone(), name }),
                })
            }
            ValueKind::Register { .. } => None,
        }
    }

    fn write_signed(&self, value: i64) -> Result<(), HostError> {
        match &*self.kind {
            ValueKind::Register { state, name } => {
                let mut state = state.borrow_mut();
                state.register_writes.push((name.to_string(), value));
                if state.fail_register_writes {
                    return Err(HostError::new("register writes are disabled"));
                }
                register_set(&mut state.registers, name, value);
                Ok(())
            }
            _ => Err(HostError::new("value is not writable")),
        }
    }
}

fn register_get(registers: &RegisterFile, name: &str) -> i64 {
    match name {
        "rsp" => registers.rsp,
        "rbp" => registers.rbp,
        "rip" => registers.rip,
        _ => 0,
    }
}

fn register_set(registers: &mut RegisterFile, name: &str, value: i64) {
    match name {
        "rsp" => registers.rsp = value,
        "rbp" => registers.rbp = value,
        "rip" => registers.rip = value,
        _ => {}
    }
}

/// A synthetic stack frame handle. `index` of `None` is the thread's
/// selected frame, which carries the register file.
#[derive(Clone)]
pub struct SynthFrame {
    state: Rc<RefCell<ProcessState>>,
    index: Option<usize>,
}

impl SynthFrame {
    fn with_data<R>(&self, f: impl FnOnce(&FrameData) -> R) -> Option<R> {
        let state = self.state.borrow();
        state.frames.get(self.index?).map(f)
    }
}

impl Frame for SynthFrame {
    type Value = SynthValue;

    fn description(&self) -> Option<String> {
        self.with_data(|data| data.description.clone()).flatten()
    }

    fn find_variable(&self, name: &str) -> Option<SynthValue> {
        self.with_data(|data| {
            data.variables
                .iter()
                .find(|(variable, _)| variable == name)
                .map(|(_, value)| value.clone())
        })
        .flatten()
    }

    fn variables(&self, arguments: bool, locals: bool) -> Vec<SynthValue> {
        self.with_data(|data| {
            let mut values = Vec::new();
            if arguments {
                values.extend(data.arguments.iter().cloned());
            }
            if locals {
                values.extend(data.locals.iter().cloned());
            }
            values
        })
        .unwrap_or_default()
    }

    fn general_purpose_registers(&self) -> Option<SynthValue> {
        Some(SynthValue {
            kind: Rc::new(ValueKind::RegisterBank(self.state.clone())),
        })
    }

    fn set_pc(&self, pc: u64) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        state.pc_writes.push(pc);
        state.registers.pc = pc;
        Ok(())
    }
}

/// The synthetic selected thread.
pub struct SynthThread {
    state: Rc<RefCell<ProcessState>>,
}

impl Thread for SynthThread {
    type Frame = SynthFrame;

    fn num_frames(&self) -> usize {
        self.state.borrow().frames.len()
    }

    fn frame_at(&self, index: usize) -> Option<SynthFrame> {
        if index < self.state.borrow().frames.len() {
            Some(SynthFrame { state: self.state.clone(), index: Some(index) })
        } else {
            None
        }
    }

    fn selected_frame(&self) -> Option<SynthFrame> {
        Some(SynthFrame { state: self.state.clone(), index: None })
    }
}

/// The synthetic debuggee process.
pub struct SynthProcess {
    state: Rc<RefCell<ProcessState>>,
}

impl Process for SynthProcess {
    type Thread = SynthThread;

    fn memory_regions(&self) -> Vec<Result<RegionInfo, HostError>> {
        self.state.borrow().regions.clone()
    }

    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<(), HostError> {
        let state = self.state.borrow();
        let mapping = state.memory.range(..=address).next_back();
        if let Some((base, bytes)) = mapping {
            let offset = (address - base) as usize;
            if offset + buffer.len() <= bytes.len() {
                buffer.copy_from_slice(&bytes[offset..offset + buffer.len()]);
                return Ok(());
            }
        }
        Err(HostError::new(format!(
            "cannot read {} bytes at {address:#x}",
            buffer.len()
        )))
    }

    fn selected_thread(&self) -> Option<SynthThread> {
        if self.state.borrow().has_thread {
            Some(SynthThread { state: self.state.clone() })
        } else {
            None
        }
    }
}

/// The synthetic debug target.
pub struct SynthTarget {
    state: Rc<RefCell<ProcessState>>,
}

impl Target for SynthTarget {
    type Process = SynthProcess;

    fn process(&self) -> Option<SynthProcess> {
        if self.state.borrow().has_process {
            Some(SynthProcess { state: self.state.clone() })
        } else {
            None
        }
    }
}

impl Debugger for SynthDebugger {
    type Target = SynthTarget;

    fn selected_target(&self) -> Option<SynthTarget> {
        if self.has_target {
            Some(SynthTarget { state: self.state.clone() })
        } else {
            None
        }
    }

    fn terminal_width(&self) -> usize {
        self.terminal_width
    }
}

/// Convenience for tests: runs `body` against a fresh [`CommandOutput`] and
/// returns what it accumulated.
pub fn capture_output(body: impl FnOnce(&mut CommandOutput) -> bool) -> (bool, String) {
    let mut out = CommandOutput::new();
    let ok = body(&mut out);
    (ok, out.text().to_string())
}
