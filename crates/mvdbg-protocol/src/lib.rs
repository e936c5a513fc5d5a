//! Wire protocol for remote WebAssembly VM debugging.
//!
//! Pure protocol logic with no I/O: hexadecimal codecs, the interrupt
//! command vocabulary, execution-state snapshots (parsing dump replies and
//! re-serializing captured state for transfer into another VM), and the
//! static source map consulted by the session layer.

mod error;
pub mod hex;
mod opcode;
pub mod snapshot;
mod sourcemap;

pub use error::{EncodeError, ProtocolError};
pub use opcode::{
    ack, breakpoint_request, dump_request, invoke_request, monitor_proxies_request,
    push_event_request, update_callback_mapping_request, update_module_request, Command, Opcode,
};
pub use snapshot::parse::{classify_line, parse_dump, AckKind, LineOutcome};
pub use snapshot::state::{
    BranchTable, CallbackMapping, ExceptionInfo, ExecutionStateType, Frame, FrameType,
    InterruptEvent, Memory, RuntimeState, Table, WasmValue,
};
pub use snapshot::wire::{
    chunk_messages, decode_chunk, decode_state, encode_callback_mapping, encode_state,
    encode_state_fragments, Chunk,
};
pub use sourcemap::{FunctionInfo, GlobalInfo, ImportInfo, LineMapping, LocalInfo, SourceMap};
