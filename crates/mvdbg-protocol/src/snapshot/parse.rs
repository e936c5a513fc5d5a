//! Dump reply parsing and line classification.
//!
//! Replies arrive as newline-terminated text. JSON-shaped lines are state
//! dumps; everything else is a short acknowledgement or notification
//! matched by literal substring. A malformed line is reported as an
//! outcome, never raised: one bad line must not stop the stream.

use serde_json::Value;
use smol_str::SmolStr;

use crate::error::ProtocolError;
use crate::hex;
use crate::opcode::ack;
use crate::snapshot::state::{
    BranchTable, CallbackMapping, ExceptionInfo, Frame, FrameType, InterruptEvent, Memory,
    RuntimeState, Table, WasmValue,
};

/// Acknowledgement kinds that require no further action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Run,
    Halt,
    Pause,
    Reset,
    Breakpoint,
    ModuleChanged,
    CallbacksChanged,
    DumpMarker,
    ChunkOk,
    ChunkDone,
}

/// What one reply line means.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// An acknowledgement; nothing to do.
    Ack(AckKind),
    /// The VM finished a single step; callers refresh their view.
    StepCompleted,
    /// Execution stopped at a breakpoint.
    BreakpointHit(u32),
    /// The VM queued a new external event.
    NewEvent,
    /// A state dump, possibly partial.
    Snapshot(Box<RuntimeState>),
    /// A recognizable line with an invalid payload.
    Malformed(SmolStr),
    /// Not part of the reply vocabulary.
    Unknown,
}

/// Classify one framed line.
#[must_use]
pub fn classify_line(line: &str) -> LineOutcome {
    let text = line.trim();
    if text.starts_with('{') {
        return match parse_dump(text) {
            Ok(state) => LineOutcome::Snapshot(Box::new(state)),
            Err(err) => LineOutcome::Malformed(SmolStr::new(err.to_string())),
        };
    }
    if let Some(rest) = text.strip_prefix(ack::BREAKPOINT_HIT_PREFIX) {
        let addr = rest.trim_end_matches('!').trim();
        return match parse_address_text(addr) {
            Some(addr) => LineOutcome::BreakpointHit(addr),
            None => LineOutcome::Malformed(SmolStr::new(format!(
                "breakpoint hit with invalid address '{addr}'"
            ))),
        };
    }
    if text.contains(ack::STEP) {
        return LineOutcome::StepCompleted;
    }
    if text.contains(ack::NEW_EVENT) {
        return LineOutcome::NewEvent;
    }
    let ack_kind = [
        (ack::RUN, AckKind::Run),
        (ack::HALT, AckKind::Halt),
        (ack::PAUSE, AckKind::Pause),
        (ack::RESET, AckKind::Reset),
        (ack::CHANGE_MODULE, AckKind::ModuleChanged),
        (ack::CHANGE_CALLBACKS, AckKind::CallbacksChanged),
        (ack::DUMP_MARKER, AckKind::DumpMarker),
        (ack::CHUNK_DONE, AckKind::ChunkDone),
        (ack::CHUNK_OK, AckKind::ChunkOk),
    ]
    .into_iter()
    .find(|(needle, _)| text.contains(needle))
    .map(|(_, kind)| kind);
    if let Some(kind) = ack_kind {
        return LineOutcome::Ack(kind);
    }
    if text.starts_with("BP ") && text.ends_with('!') {
        return LineOutcome::Ack(AckKind::Breakpoint);
    }
    LineOutcome::Unknown
}

/// Parse a JSON-shaped dump reply into a partial [`RuntimeState`].
///
/// Every field is optional; a category absent from the reply stays `None`.
pub fn parse_dump(text: &str) -> Result<RuntimeState, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| ProtocolError::MalformedDump(SmolStr::new(err.to_string())))?;
    let mut state = RuntimeState::default();

    state.pc = value.get("pc").and_then(address);
    state.start_address = match value.get("start") {
        Some(Value::Array(entries)) => entries.first().and_then(address),
        Some(other) => address(other),
        None => None,
    };
    if let Some(entries) = value.get("breakpoints").and_then(Value::as_array) {
        state.breakpoints = Some(entries.iter().filter_map(address).collect());
    }
    if let Some(entries) = value.get("callstack").and_then(Value::as_array) {
        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            frames.push(parse_frame(entry)?);
        }
        state.callstack = Some(frames);
    }
    if let Some(entries) = value.get("globals").and_then(Value::as_array) {
        let mut globals = Vec::with_capacity(entries.len());
        for entry in entries {
            globals.push(parse_value(entry)?);
        }
        state.globals = Some(globals);
    }
    if let Some(table) = value.get("table") {
        state.table = Some(Table {
            max: table.get("max").and_then(address).unwrap_or(0),
            init: table.get("init").and_then(address).unwrap_or(0),
            elements: table
                .get("elements")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(address).collect())
                .unwrap_or_default(),
        });
    }
    if let Some(memory) = value.get("memory") {
        let bytes = match memory.get("bytes").and_then(Value::as_str) {
            Some(text) => hex::hex_to_bytes(text)?,
            None => Vec::new(),
        };
        state.memory = Some(Memory {
            pages: memory.get("pages").and_then(address).unwrap_or(0),
            max_pages: memory.get("max").and_then(address).unwrap_or(0),
            init_pages: memory.get("init").and_then(address).unwrap_or(0),
            bytes,
        });
    }
    if let Some(table) = value.get("br_table") {
        state.branch_table = Some(BranchTable {
            size: table.get("size").and_then(address).unwrap_or(0),
            labels: table
                .get("labels")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(address).collect())
                .unwrap_or_default(),
        });
    }
    if let Some(entries) = value.get("stack").and_then(Value::as_array) {
        let mut stack = Vec::with_capacity(entries.len());
        for entry in entries {
            stack.push(parse_value(entry)?);
        }
        state.stack = Some(stack);
    }
    if let Some(entries) = value.get("callbacks").and_then(Value::as_array) {
        let mut mapping = CallbackMapping::new();
        for entry in entries {
            let Some(topic) = entry.get("topic").and_then(Value::as_str) else {
                tracing::warn!(?entry, "callback mapping entry without a topic, skipped");
                continue;
            };
            let targets = entry
                .get("targets")
                .and_then(Value::as_array)
                .map(|fidxs| fidxs.iter().filter_map(address).collect())
                .unwrap_or_default();
            mapping.set_targets(topic, targets);
        }
        state.callbacks = Some(mapping);
    }
    if let Some(entries) = value.get("events").and_then(Value::as_array) {
        state.events = Some(
            entries
                .iter()
                .filter_map(|entry| {
                    Some(InterruptEvent {
                        topic: SmolStr::new(entry.get("topic")?.as_str()?),
                        payload: SmolStr::new(
                            entry.get("payload").and_then(Value::as_str).unwrap_or(""),
                        ),
                    })
                })
                .collect(),
        );
    }
    if let Some(error) = value.get("error") {
        state.error = Some(ExceptionInfo {
            pc: error.get("pc").and_then(address).unwrap_or(0),
            message: SmolStr::new(error.get("message").and_then(Value::as_str).unwrap_or("")),
        });
    }
    Ok(state)
}

fn parse_frame(entry: &Value) -> Result<Frame, ProtocolError> {
    let code = entry
        .get("type")
        .and_then(address)
        .ok_or_else(|| ProtocolError::MalformedDump("frame without a type tag".into()))?;
    let code = u8::try_from(code).map_err(|_| {
        ProtocolError::MalformedDump(SmolStr::new(format!("frame type tag {code} out of range")))
    })?;
    let kind = FrameType::from_code(code).ok_or(ProtocolError::InvalidFrameType(code))?;
    let sp = entry.get("sp").and_then(signed).unwrap_or(-1);
    let fp = entry.get("fp").and_then(signed).unwrap_or(-1);
    let ra = entry.get("ra").and_then(address).unwrap_or(0);
    let frame = match kind {
        FrameType::Function => {
            let fidx = entry.get("fidx").and_then(address).ok_or_else(|| {
                ProtocolError::MalformedDump("function frame without fidx".into())
            })?;
            Frame::function(fidx, sp, fp, ra)
        }
        FrameType::ProxyGuard | FrameType::CallbackGuard => Frame::guard(kind, sp, fp, ra),
        _ => {
            let key = entry.get("block_key").and_then(address).ok_or_else(|| {
                ProtocolError::MalformedDump("block frame without block_key".into())
            })?;
            Frame::block(kind, key, sp, fp, ra)
        }
    };
    Ok(frame)
}

fn parse_value(entry: &Value) -> Result<WasmValue, ProtocolError> {
    let ty = entry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedDump("value without a type".into()))?;
    let value = entry
        .get("value")
        .ok_or_else(|| ProtocolError::MalformedDump("value without a value".into()))?;
    let parsed = match ty {
        "i32" => WasmValue::I32(
            signed(value)
                .ok_or_else(|| ProtocolError::MalformedDump("non-numeric i32 value".into()))?,
        ),
        // i64 travels as a decimal string so JSON number precision cannot
        // corrupt it.
        "i64" => {
            let wide = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
                .ok_or_else(|| ProtocolError::MalformedDump("non-numeric i64 value".into()))?;
            WasmValue::I64(wide)
        }
        "f32" => WasmValue::F32(
            value
                .as_f64()
                .ok_or_else(|| ProtocolError::MalformedDump("non-numeric f32 value".into()))?
                as f32,
        ),
        "f64" => WasmValue::F64(
            value
                .as_f64()
                .ok_or_else(|| ProtocolError::MalformedDump("non-numeric f64 value".into()))?,
        ),
        other => {
            return Err(ProtocolError::MalformedDump(SmolStr::new(format!(
                "unknown value type '{other}'"
            ))))
        }
    };
    Ok(parsed)
}

/// Accept addresses as JSON numbers, `0x`-prefixed hex strings or decimal
/// strings.
fn address(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => parse_address_text(text),
        _ => None,
    }
}

fn signed(value: &Value) -> Option<i32> {
    match value {
        Value::Number(number) => number.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn parse_address_text(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_plain_acks() {
        assert_eq!(classify_line("GO!"), LineOutcome::Ack(AckKind::Run));
        assert_eq!(classify_line("PAUSE!"), LineOutcome::Ack(AckKind::Pause));
        assert_eq!(classify_line("STEP!"), LineOutcome::StepCompleted);
        assert_eq!(
            classify_line("BP 0x63!"),
            LineOutcome::Ack(AckKind::Breakpoint)
        );
        assert_eq!(
            classify_line("CHANGE Module!"),
            LineOutcome::Ack(AckKind::ModuleChanged)
        );
        assert_eq!(classify_line("whatever else"), LineOutcome::Unknown);
    }

    #[test]
    fn breakpoint_hit_requires_a_numeric_address() {
        assert_eq!(classify_line("AT 0x42!"), LineOutcome::BreakpointHit(0x42));
        assert_eq!(classify_line("AT 66!"), LineOutcome::BreakpointHit(66));
        assert!(matches!(
            classify_line("AT !"),
            LineOutcome::Malformed(_)
        ));
        assert!(matches!(
            classify_line("AT nowhere!"),
            LineOutcome::Malformed(_)
        ));
    }

    #[test]
    fn new_event_notification() {
        assert_eq!(classify_line("new pushed event"), LineOutcome::NewEvent);
    }

    #[test]
    fn dump_with_pc_only() {
        let LineOutcome::Snapshot(state) = classify_line(r#"{"pc":5}"#) else {
            panic!("expected a snapshot");
        };
        assert_eq!(state.pc, Some(5));
        assert!(state.callstack.is_none());
        assert!(state.breakpoints.is_none());
    }

    #[test]
    fn dump_parses_all_sections() {
        let text = r#"{
            "pc": "0x2a",
            "start": ["0x1000"],
            "breakpoints": ["0x1010", "0x1020"],
            "callstack": [
                {"type": 0, "fidx": 3, "sp": -1, "fp": -1, "ra": "0x0"},
                {"type": 3, "block_key": "0x44", "sp": 4, "fp": 2, "ra": "0x1008"},
                {"type": 255, "sp": 6, "fp": 5, "ra": "0x100c"}
            ],
            "globals": [{"type": "i32", "value": 7}, {"type": "i64", "value": "9007199254740993"}],
            "table": {"max": 8, "init": 2, "elements": [0, 1]},
            "memory": {"pages": 1, "max": 2, "init": 1, "bytes": "00ff10"},
            "br_table": {"size": "0x100", "labels": [0, 4]},
            "stack": [{"type": "f32", "value": 1.5}],
            "callbacks": [{"topic": "irq0", "targets": [3]}],
            "events": [{"topic": "irq0", "payload": "12"}],
            "error": {"pc": "0x2a", "message": "unreachable"}
        }"#;
        let state = parse_dump(text).unwrap();
        assert_eq!(state.pc, Some(0x2a));
        assert_eq!(state.start_address, Some(0x1000));
        assert_eq!(state.breakpoints.as_ref().unwrap().len(), 2);
        let frames = state.callstack.as_ref().unwrap();
        assert_eq!(frames[0].fidx, Some(3));
        assert_eq!(frames[1].block_key, Some(0x44));
        assert_eq!(frames[2].kind, FrameType::CallbackGuard);
        assert_eq!(
            state.globals.as_ref().unwrap()[1],
            WasmValue::I64(9_007_199_254_740_993)
        );
        assert_eq!(state.memory.as_ref().unwrap().bytes, vec![0x00, 0xff, 0x10]);
        assert_eq!(state.callbacks.as_ref().unwrap().targets("irq0"), &[3]);
        assert_eq!(state.error.as_ref().unwrap().message, "unreachable");
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let text = r#"{"callstack":[{"type": 9, "sp": 0, "fp": 0, "ra": 0}]}"#;
        assert_eq!(
            parse_dump(text).unwrap_err(),
            ProtocolError::InvalidFrameType(9)
        );
    }

    #[test]
    fn out_of_range_frame_type_names_the_tag() {
        let text = r#"{"callstack":[{"type": 300, "sp": 0, "fp": 0, "ra": 0}]}"#;
        let ProtocolError::MalformedDump(reason) = parse_dump(text).unwrap_err() else {
            panic!("expected a malformed dump");
        };
        assert!(reason.contains("300"), "diagnostic names the tag: {reason}");
    }

    #[test]
    fn bad_json_is_malformed_not_fatal() {
        assert!(matches!(
            classify_line("{not json"),
            LineOutcome::Malformed(_)
        ));
    }
}
