//! Runtime state model.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::hex::{self, Endian};

/// State categories a VM can dump, and the vocabulary used to report which
/// categories a partial snapshot is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ExecutionStateType {
    ProgramCounter = 0x01,
    Breakpoints = 0x02,
    Callstack = 0x03,
    Globals = 0x04,
    Table = 0x05,
    Memory = 0x06,
    BranchTable = 0x07,
    OperandStack = 0x08,
    Callbacks = 0x09,
    Events = 0x0a,
    Error = 0x0b,
}

impl ExecutionStateType {
    /// Every state category, in ascending code order.
    pub const ALL: [Self; 11] = [
        Self::ProgramCounter,
        Self::Breakpoints,
        Self::Callstack,
        Self::Globals,
        Self::Table,
        Self::Memory,
        Self::BranchTable,
        Self::OperandStack,
        Self::Callbacks,
        Self::Events,
        Self::Error,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.code() == code)
    }
}

/// Call-stack frame kinds.
///
/// Guard frames mark re-entry points inserted around proxy calls and event
/// callbacks; they carry neither a function index nor a block key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Function = 0,
    InitExpr = 1,
    Block = 2,
    Loop = 3,
    If = 4,
    ProxyGuard = 254,
    CallbackGuard = 255,
}

impl FrameType {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Function),
            1 => Some(Self::InitExpr),
            2 => Some(Self::Block),
            3 => Some(Self::Loop),
            4 => Some(Self::If),
            254 => Some(Self::ProxyGuard),
            255 => Some(Self::CallbackGuard),
            _ => None,
        }
    }

    /// Guard frames carry no function index and no block key.
    #[must_use]
    pub fn is_guard(self) -> bool {
        matches!(self, Self::ProxyGuard | Self::CallbackGuard)
    }
}

/// One call-stack activation record.
///
/// The frame type decides which optional field is populated: function
/// frames carry `fidx`, guard frames carry neither, every other type
/// carries `block_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub sp: i32,
    pub fp: i32,
    pub ra: u32,
    pub fidx: Option<u32>,
    pub block_key: Option<u32>,
}

impl Frame {
    /// A function-call frame.
    #[must_use]
    pub fn function(fidx: u32, sp: i32, fp: i32, ra: u32) -> Self {
        Self {
            kind: FrameType::Function,
            sp,
            fp,
            ra,
            fidx: Some(fidx),
            block_key: None,
        }
    }

    /// A block/loop/if/init-expression frame keyed by its block.
    #[must_use]
    pub fn block(kind: FrameType, block_key: u32, sp: i32, fp: i32, ra: u32) -> Self {
        Self {
            kind,
            sp,
            fp,
            ra,
            fidx: None,
            block_key: Some(block_key),
        }
    }

    /// A proxy or callback guard frame.
    #[must_use]
    pub fn guard(kind: FrameType, sp: i32, fp: i32, ra: u32) -> Self {
        Self {
            kind,
            sp,
            fp,
            ra,
            fidx: None,
            block_key: None,
        }
    }
}

/// A typed WASM value from the operand stack or the global section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    /// Wire type tag.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::I32(_) => 0,
            Self::I64(_) => 1,
            Self::F32(_) => 2,
            Self::F64(_) => 3,
        }
    }

    /// Type name as it appears in dump replies.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
        }
    }

    /// Hex wire encoding: one type-tag byte, then the value (integers as
    /// signed LEB128, floats as fixed-width little-endian bit patterns).
    #[must_use]
    pub fn encode(self) -> String {
        let mut out = format!("{:02x}", self.tag());
        match self {
            Self::I32(value) => {
                out.push_str(&hex::bytes_to_hex(&hex::encode_sleb128(i64::from(value))));
            }
            Self::I64(value) => {
                out.push_str(&hex::bytes_to_hex(&hex::encode_sleb128(value)));
            }
            Self::F32(value) => out.push_str(&hex::encode_f32(value, Endian::Little)),
            Self::F64(value) => out.push_str(&hex::encode_f64(value, Endian::Little)),
        }
        out
    }
}

/// Linear memory contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Memory {
    pub pages: u32,
    pub max_pages: u32,
    pub init_pages: u32,
    pub bytes: Vec<u8>,
}

/// Function table contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub max: u32,
    pub init: u32,
    pub elements: Vec<u32>,
}

/// Branch table sizing and labels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchTable {
    pub size: u32,
    pub labels: Vec<u32>,
}

/// One queued external event awaiting a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptEvent {
    pub topic: SmolStr,
    pub payload: SmolStr,
}

/// Topic-to-callback-functions mapping, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallbackMapping {
    entries: IndexMap<SmolStr, Vec<u32>>,
}

impl CallbackMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: impl Into<SmolStr>, fidx: u32) {
        self.entries.entry(topic.into()).or_default().push(fidx);
    }

    pub fn set_targets(&mut self, topic: impl Into<SmolStr>, targets: Vec<u32>) {
        self.entries.insert(topic.into(), targets);
    }

    #[must_use]
    pub fn targets(&self, topic: &str) -> &[u32] {
        self.entries.get(topic).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Vec<u32>)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trap/exception details reported by the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub pc: u32,
    pub message: SmolStr,
}

/// A point-in-time capture of VM execution state, partial by construction.
///
/// Every field is optional: a dump reply only carries the categories that
/// were requested. Missing fields stay `None` so that merging and
/// re-serialization preserve what was actually captured.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeState {
    pub pc: Option<u32>,
    /// The VM's module load offset, used to translate between absolute and
    /// relative code addresses when a snapshot moves between VM instances.
    pub start_address: Option<u32>,
    pub breakpoints: Option<BTreeSet<u32>>,
    pub callstack: Option<Vec<Frame>>,
    pub globals: Option<Vec<WasmValue>>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub branch_table: Option<BranchTable>,
    pub stack: Option<Vec<WasmValue>>,
    pub callbacks: Option<CallbackMapping>,
    pub events: Option<Vec<InterruptEvent>>,
    pub error: Option<ExceptionInfo>,
}

impl RuntimeState {
    /// Content hash identifying this snapshot.
    ///
    /// Hashes the canonical wire encoding; a state that cannot be encoded
    /// (frame field mismatch) hashes to 0.
    #[must_use]
    pub fn state_id(&self) -> u32 {
        let Ok(encoded) = super::wire::encode_state(self) else {
            return 0;
        };
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&encoded);
        hasher.finalize()
    }

    /// Program counter, defaulting to 0 when the dump omitted it.
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.pc.unwrap_or(0)
    }

    /// Raw call stack, empty when absent.
    #[must_use]
    pub fn callstack(&self) -> &[Frame] {
        self.callstack.as_deref().unwrap_or(&[])
    }

    /// Pending events, empty when absent.
    #[must_use]
    pub fn events(&self) -> &[InterruptEvent] {
        self.events.as_deref().unwrap_or(&[])
    }

    /// The logical call stack: function frames only, callee last. The raw
    /// stack stays untouched for re-serialization fidelity.
    #[must_use]
    pub fn logical_callstack(&self) -> Vec<&Frame> {
        self.callstack()
            .iter()
            .filter(|frame| frame.kind == FrameType::Function)
            .collect()
    }

    /// Which state categories this snapshot is missing.
    #[must_use]
    pub fn missing_state(&self) -> Vec<ExecutionStateType> {
        ExecutionStateType::ALL
            .into_iter()
            .filter(|ty| !self.has(*ty))
            .collect()
    }

    /// Whether a state category is present.
    #[must_use]
    pub fn has(&self, ty: ExecutionStateType) -> bool {
        match ty {
            ExecutionStateType::ProgramCounter => self.pc.is_some(),
            ExecutionStateType::Breakpoints => self.breakpoints.is_some(),
            ExecutionStateType::Callstack => self.callstack.is_some(),
            ExecutionStateType::Globals => self.globals.is_some(),
            ExecutionStateType::Table => self.table.is_some(),
            ExecutionStateType::Memory => self.memory.is_some(),
            ExecutionStateType::BranchTable => self.branch_table.is_some(),
            ExecutionStateType::OperandStack => self.stack.is_some(),
            ExecutionStateType::Callbacks => self.callbacks.is_some(),
            ExecutionStateType::Events => self.events.is_some(),
            ExecutionStateType::Error => self.error.is_some(),
        }
    }

    /// Fill every missing category from `other`, leaving present fields
    /// untouched. Two piecemeal dumps merge into one snapshot this way.
    pub fn copy_missing_from(&mut self, other: &Self) {
        if self.pc.is_none() {
            self.pc = other.pc;
        }
        if self.start_address.is_none() {
            self.start_address = other.start_address;
        }
        if self.breakpoints.is_none() {
            self.breakpoints.clone_from(&other.breakpoints);
        }
        if self.callstack.is_none() {
            self.callstack.clone_from(&other.callstack);
        }
        if self.globals.is_none() {
            self.globals.clone_from(&other.globals);
        }
        if self.table.is_none() {
            self.table.clone_from(&other.table);
        }
        if self.memory.is_none() {
            self.memory.clone_from(&other.memory);
        }
        if self.branch_table.is_none() {
            self.branch_table.clone_from(&other.branch_table);
        }
        if self.stack.is_none() {
            self.stack.clone_from(&other.stack);
        }
        if self.callbacks.is_none() {
            self.callbacks.clone_from(&other.callbacks);
        }
        if self.events.is_none() {
            self.events.clone_from(&other.events);
        }
        if self.error.is_none() {
            self.error.clone_from(&other.error);
        }
    }

    /// Translate code addresses to a new load offset.
    ///
    /// Rebasing maps pc, frame return addresses, breakpoints and the error
    /// pc from this snapshot's `start_address` to `new_start`. Without a
    /// recorded start address the snapshot is returned unchanged.
    #[must_use]
    pub fn rebased(&self, new_start: u32) -> Self {
        let Some(old_start) = self.start_address else {
            return self.clone();
        };
        let shift = |addr: u32| addr.wrapping_sub(old_start).wrapping_add(new_start);
        let mut out = self.clone();
        out.start_address = Some(new_start);
        out.pc = self.pc.map(shift);
        out.breakpoints = self
            .breakpoints
            .as_ref()
            .map(|set| set.iter().map(|addr| shift(*addr)).collect());
        if let Some(frames) = out.callstack.as_mut() {
            for frame in frames {
                frame.ra = shift(frame.ra);
            }
        }
        if let Some(error) = out.error.as_mut() {
            error.pc = shift(error.pc);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc_only(pc: u32) -> RuntimeState {
        RuntimeState {
            pc: Some(pc),
            ..RuntimeState::default()
        }
    }

    #[test]
    fn missing_state_reports_everything_but_pc() {
        let state = pc_only(5);
        let missing = state.missing_state();
        assert!(!missing.contains(&ExecutionStateType::ProgramCounter));
        assert_eq!(missing.len(), ExecutionStateType::ALL.len() - 1);
    }

    #[test]
    fn copy_missing_fills_exactly_the_gaps() {
        let mut partial = pc_only(5);
        let mut full = pc_only(99);
        full.breakpoints = Some([0x10u32, 0x20].into_iter().collect());
        full.stack = Some(vec![WasmValue::I32(7)]);
        full.callstack = Some(vec![Frame::function(0, -1, -1, 0)]);

        partial.copy_missing_from(&full);
        assert_eq!(partial.pc, Some(5), "present fields stay untouched");
        assert_eq!(partial.breakpoints.as_ref().unwrap().len(), 2);
        assert_eq!(partial.stack.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn logical_callstack_keeps_function_frames_only() {
        let state = RuntimeState {
            callstack: Some(vec![
                Frame::function(1, -1, -1, 0),
                Frame::block(FrameType::Loop, 0x40, 3, 2, 0x51),
                Frame::guard(FrameType::CallbackGuard, 5, 4, 0x60),
                Frame::function(2, 6, 5, 0x70),
            ]),
            ..RuntimeState::default()
        };
        let logical = state.logical_callstack();
        assert_eq!(logical.len(), 2);
        assert_eq!(logical[1].fidx, Some(2));
        assert_eq!(state.callstack().len(), 4, "raw stack preserved");
    }

    #[test]
    fn rebase_shifts_code_addresses() {
        let mut state = pc_only(0x120);
        state.start_address = Some(0x100);
        state.breakpoints = Some([0x104u32].into_iter().collect());
        state.callstack = Some(vec![Frame::function(0, -1, -1, 0x110)]);
        state.error = Some(ExceptionInfo {
            pc: 0x118,
            message: "trap".into(),
        });

        let moved = state.rebased(0x200);
        assert_eq!(moved.pc, Some(0x220));
        assert!(moved.breakpoints.unwrap().contains(&0x204));
        assert_eq!(moved.callstack.unwrap()[0].ra, 0x210);
        assert_eq!(moved.error.unwrap().pc, 0x218);
        assert_eq!(moved.start_address, Some(0x200));
    }

    #[test]
    fn rebase_without_start_address_is_identity() {
        let state = pc_only(0x40);
        assert_eq!(state.rebased(0x999), state);
    }

    #[test]
    fn state_id_tracks_content() {
        let a = pc_only(5);
        let b = pc_only(5);
        let c = pc_only(6);
        assert_eq!(a.state_id(), b.state_id());
        assert_ne!(a.state_id(), c.state_id());
    }
}
