//! Interrupt command vocabulary.
//!
//! Every command sent to a VM is one newline-terminated line starting with a
//! two-hex-digit opcode, optionally followed by a hex payload. A trailing
//! space before the newline is part of the wire format.

use crate::hex::{self, Endian};
use crate::snapshot::state::{ExecutionStateType, InterruptEvent, WasmValue};

/// The closed set of interrupt opcodes understood by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Run = 0x01,
    Halt = 0x02,
    Pause = 0x03,
    Step = 0x04,
    AddBreakpoint = 0x06,
    RemoveBreakpoint = 0x07,
    DumpFull = 0x10,
    DumpLocals = 0x11,
    Dump = 0x12,
    Reset = 0x13,
    UpdateFunction = 0x20,
    UpdateLocal = 0x21,
    UpdateModule = 0x22,
    UpdateGlobal = 0x23,
    UpdateStackValue = 0x24,
    Invoke = 0x40,
    Snapshot = 0x60,
    LoadSnapshot = 0x62,
    MonitorProxies = 0x63,
    ProxyCall = 0x64,
    Proxify = 0x65,
    DumpAllEvents = 0x70,
    DumpEvents = 0x71,
    PopEvent = 0x72,
    PushEvent = 0x73,
    DumpCallbackMapping = 0x74,
    UpdateCallbackMapping = 0x75,
}

impl Opcode {
    /// The raw interrupt code.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The two-hex-digit wire form.
    #[must_use]
    pub fn wire(self) -> String {
        format!("{:02x}", self.code())
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.code())
    }
}

/// One command line ready to be written to the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub payload: String,
}

impl Command {
    /// A bare command with no payload.
    #[must_use]
    pub fn bare(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: String::new(),
        }
    }

    #[must_use]
    pub fn with_payload(opcode: Opcode, payload: impl Into<String>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Render the newline-terminated wire line.
    #[must_use]
    pub fn into_line(self) -> String {
        format!("{}{} \n", self.opcode.wire(), self.payload)
    }
}

/// Acknowledgement substrings the VM answers commands with.
pub mod ack {
    pub const RUN: &str = "GO!";
    pub const HALT: &str = "HALT!";
    pub const PAUSE: &str = "PAUSE!";
    pub const STEP: &str = "STEP!";
    pub const RESET: &str = "RESET!";
    pub const CHANGE_MODULE: &str = "CHANGE Module!";
    pub const CHANGE_CALLBACKS: &str = "CHANGE Callbackmapping!";
    pub const DUMP_MARKER: &str = "DUMP!";
    pub const CHUNK_OK: &str = "OK!";
    pub const CHUNK_DONE: &str = "LOADED!";
    pub const NEW_EVENT: &str = "new pushed event";
    pub const BREAKPOINT_HIT_PREFIX: &str = "AT ";

    /// The ack line for adding or removing the breakpoint at `addr`.
    #[must_use]
    pub fn breakpoint(addr: u32) -> String {
        format!("BP 0x{addr:x}!")
    }
}

/// Build a dump request: a two-hex-digit count followed by the requested
/// state-type codes, sorted ascending.
#[must_use]
pub fn dump_request(types: &[ExecutionStateType]) -> Command {
    let mut codes: Vec<u8> = types.iter().map(|ty| ty.code()).collect();
    codes.sort_unstable();
    codes.dedup();
    let mut payload = format!("{:02x}", codes.len());
    for code in codes {
        payload.push_str(&format!("{code:02x}"));
    }
    Command::with_payload(Opcode::Dump, payload)
}

/// Build a breakpoint add/remove request.
///
/// The payload is one hex nibble holding the address length in bytes,
/// followed by the address itself in uppercase hex.
#[must_use]
pub fn breakpoint_request(opcode: Opcode, addr: u32) -> Command {
    let hex = format!("{addr:X}");
    let hex = if hex.len() % 2 == 0 {
        hex
    } else {
        format!("0{hex}")
    };
    Command::with_payload(opcode, format!("{:X}{hex}", hex.len() / 2))
}

/// Build an invoke request: 4-byte function index, then LEB128 arguments.
#[must_use]
pub fn invoke_request(fidx: u32, args: &[WasmValue]) -> Command {
    let mut payload = hex::encode_int(u64::from(fidx), 4, Endian::Big);
    for arg in args {
        payload.push_str(&arg.encode());
    }
    Command::with_payload(Opcode::Invoke, payload)
}

/// Build a proxy-monitor request: topic count, then length-prefixed topics.
#[must_use]
pub fn monitor_proxies_request(topics: &[&str]) -> Command {
    let mut payload = hex::encode_int(topics.len() as u64, 4, Endian::Big);
    for topic in topics {
        payload.push_str(&hex::encode_int(topic.len() as u64, 4, Endian::Big));
        payload.push_str(&hex::encode_str(topic));
    }
    Command::with_payload(Opcode::MonitorProxies, payload)
}

/// Build a push-event request carrying a topic and payload.
#[must_use]
pub fn push_event_request(event: &InterruptEvent) -> Command {
    let mut payload = hex::encode_int(event.topic.len() as u64, 4, Endian::Big);
    payload.push_str(&hex::encode_str(&event.topic));
    payload.push_str(&hex::encode_int(event.payload.len() as u64, 4, Endian::Big));
    payload.push_str(&hex::encode_str(&event.payload));
    Command::with_payload(Opcode::PushEvent, payload)
}

/// Build a module update carrying a fresh WASM binary.
#[must_use]
pub fn update_module_request(module: &[u8]) -> Command {
    let mut payload = hex::encode_int(module.len() as u64, 4, Endian::Big);
    payload.push_str(&hex::bytes_to_hex(module));
    Command::with_payload(Opcode::UpdateModule, payload)
}

/// Build a callback-mapping update from an encoded mapping payload.
#[must_use]
pub fn update_callback_mapping_request(encoded: &[u8]) -> Command {
    Command::with_payload(Opcode::UpdateCallbackMapping, hex::bytes_to_hex(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_carries_trailing_space() {
        assert_eq!(Command::bare(Opcode::Run).into_line(), "01 \n");
        assert_eq!(
            Command::with_payload(Opcode::AddBreakpoint, "0163").into_line(),
            "060163 \n"
        );
    }

    #[test]
    fn dump_request_sorts_and_counts_codes() {
        let command = dump_request(&[
            ExecutionStateType::OperandStack,
            ExecutionStateType::ProgramCounter,
            ExecutionStateType::Callstack,
        ]);
        assert_eq!(command.opcode, Opcode::Dump);
        assert_eq!(command.payload, "03010308");
    }

    #[test]
    fn breakpoint_request_prefixes_byte_length() {
        let command = breakpoint_request(Opcode::AddBreakpoint, 0x63);
        assert_eq!(command.payload, "163");
        let command = breakpoint_request(Opcode::RemoveBreakpoint, 0xABCD);
        assert_eq!(command.payload, "2ABCD");
    }

    #[test]
    fn breakpoint_request_pads_odd_addresses() {
        let command = breakpoint_request(Opcode::AddBreakpoint, 0x1234A);
        assert_eq!(command.payload, "301234A");
    }
}
