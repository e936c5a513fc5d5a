//! Binary state encoding and chunked transfer.
//!
//! A captured [`RuntimeState`] is serialized as tagged sections in
//! ascending state-code order, hex-encoded and packed greedily into wire
//! messages of the form
//! `<opcode><payload byte length as 4-byte BE hex><payload hex><flag> \n`,
//! where the flag is `00` for "more to come" and `01` on the final message.
//! Every message must fit the configured size ceiling; violating it is an
//! encoding fault, never a silent truncation.

use smol_str::SmolStr;

use crate::error::{EncodeError, ProtocolError};
use crate::hex::{self, Endian};
use crate::opcode::Opcode;
use crate::snapshot::state::{
    BranchTable, CallbackMapping, ExceptionInfo, ExecutionStateType, Frame, FrameType,
    InterruptEvent, Memory, RuntimeState, Table, WasmValue,
};

/// Section tag for the load offset, outside the requestable vocabulary.
const START_SECTION: u8 = 0x0c;

/// Chars of header (2 opcode + 8 length) and footer (2 flag + 2 terminator)
/// in one wire message.
const HEADER_CHARS: usize = 10;
const FOOTER_CHARS: usize = 4;

/// Memory contents travel in bounded runs so large memories can spread
/// over many messages.
const MEMORY_RUN_BYTES: usize = 32;

/// Encode a state into its canonical contiguous binary form.
pub fn encode_state(state: &RuntimeState) -> Result<Vec<u8>, EncodeError> {
    Ok(encode_state_fragments(state)?.concat())
}

/// Encode a state as indivisible fragments for greedy message packing.
///
/// Concatenating the fragments yields exactly [`encode_state`].
pub fn encode_state_fragments(state: &RuntimeState) -> Result<Vec<Vec<u8>>, EncodeError> {
    let mut fragments = Vec::new();
    if let Some(pc) = state.pc {
        fragments.push(section_u32(ExecutionStateType::ProgramCounter.code(), pc));
    }
    if let Some(breakpoints) = &state.breakpoints {
        let mut body = section_header(
            ExecutionStateType::Breakpoints.code(),
            breakpoints.len() as u32,
        );
        for addr in breakpoints {
            push_u32(&mut body, *addr);
        }
        fragments.push(body);
    }
    if let Some(frames) = &state.callstack {
        fragments.push(section_header(
            ExecutionStateType::Callstack.code(),
            frames.len() as u32,
        ));
        for frame in frames {
            fragments.push(encode_frame(frame)?);
        }
    }
    if let Some(globals) = &state.globals {
        fragments.push(section_header(
            ExecutionStateType::Globals.code(),
            globals.len() as u32,
        ));
        for value in globals {
            fragments.push(encode_value(*value));
        }
    }
    if let Some(table) = &state.table {
        let mut body = vec![ExecutionStateType::Table.code()];
        push_u32(&mut body, table.max);
        push_u32(&mut body, table.init);
        push_u32(&mut body, table.elements.len() as u32);
        for element in &table.elements {
            push_u32(&mut body, *element);
        }
        fragments.push(body);
    }
    if let Some(memory) = &state.memory {
        let mut body = vec![ExecutionStateType::Memory.code()];
        push_u32(&mut body, memory.pages);
        push_u32(&mut body, memory.max_pages);
        push_u32(&mut body, memory.init_pages);
        push_u32(&mut body, memory.bytes.len() as u32);
        fragments.push(body);
        for run in memory.bytes.chunks(MEMORY_RUN_BYTES) {
            fragments.push(run.to_vec());
        }
    }
    if let Some(table) = &state.branch_table {
        let mut body = vec![ExecutionStateType::BranchTable.code()];
        push_u32(&mut body, table.size);
        push_u32(&mut body, table.labels.len() as u32);
        for label in &table.labels {
            push_u32(&mut body, *label);
        }
        fragments.push(body);
    }
    if let Some(stack) = &state.stack {
        fragments.push(section_header(
            ExecutionStateType::OperandStack.code(),
            stack.len() as u32,
        ));
        for value in stack {
            fragments.push(encode_value(*value));
        }
    }
    if let Some(callbacks) = &state.callbacks {
        fragments.push(encode_callback_mapping(callbacks));
    }
    if let Some(events) = &state.events {
        let mut body = section_header(ExecutionStateType::Events.code(), events.len() as u32);
        for event in events {
            push_bytes(&mut body, event.topic.as_bytes());
            push_bytes(&mut body, event.payload.as_bytes());
        }
        fragments.push(body);
    }
    if let Some(error) = &state.error {
        let mut body = vec![ExecutionStateType::Error.code()];
        push_u32(&mut body, error.pc);
        push_bytes(&mut body, error.message.as_bytes());
        fragments.push(body);
    }
    if let Some(start) = state.start_address {
        fragments.push(section_u32(START_SECTION, start));
    }
    Ok(fragments)
}

/// Encode a callback mapping as a standalone section, used both inside
/// full-state transfer and for callback-mapping updates on their own.
#[must_use]
pub fn encode_callback_mapping(mapping: &CallbackMapping) -> Vec<u8> {
    let mut body = section_header(ExecutionStateType::Callbacks.code(), mapping.len() as u32);
    for (topic, targets) in mapping.iter() {
        push_bytes(&mut body, topic.as_bytes());
        push_u32(&mut body, targets.len() as u32);
        for fidx in targets {
            push_u32(&mut body, *fidx);
        }
    }
    body
}

/// Decode a contiguous binary state payload, the inverse of
/// [`encode_state`]. Absent sections stay absent.
pub fn decode_state(bytes: &[u8]) -> Result<RuntimeState, ProtocolError> {
    let mut reader = Reader::new(bytes);
    let mut state = RuntimeState::default();
    while let Some(tag) = reader.next_tag() {
        match ExecutionStateType::from_code(tag) {
            Some(ExecutionStateType::ProgramCounter) => state.pc = Some(reader.u32()?),
            Some(ExecutionStateType::Breakpoints) => {
                let count = reader.u32()?;
                let mut set = std::collections::BTreeSet::new();
                for _ in 0..count {
                    set.insert(reader.u32()?);
                }
                state.breakpoints = Some(set);
            }
            Some(ExecutionStateType::Callstack) => {
                let count = reader.u32()?;
                let mut frames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frames.push(decode_frame(&mut reader)?);
                }
                state.callstack = Some(frames);
            }
            Some(ExecutionStateType::Globals) => {
                let count = reader.u32()?;
                let mut globals = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    globals.push(decode_value(&mut reader)?);
                }
                state.globals = Some(globals);
            }
            Some(ExecutionStateType::Table) => {
                let max = reader.u32()?;
                let init = reader.u32()?;
                let count = reader.u32()?;
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elements.push(reader.u32()?);
                }
                state.table = Some(Table { max, init, elements });
            }
            Some(ExecutionStateType::Memory) => {
                let pages = reader.u32()?;
                let max_pages = reader.u32()?;
                let init_pages = reader.u32()?;
                let len = reader.u32()?;
                let bytes = reader.take(len as usize)?.to_vec();
                state.memory = Some(Memory {
                    pages,
                    max_pages,
                    init_pages,
                    bytes,
                });
            }
            Some(ExecutionStateType::BranchTable) => {
                let size = reader.u32()?;
                let count = reader.u32()?;
                let mut labels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    labels.push(reader.u32()?);
                }
                state.branch_table = Some(BranchTable { size, labels });
            }
            Some(ExecutionStateType::OperandStack) => {
                let count = reader.u32()?;
                let mut stack = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    stack.push(decode_value(&mut reader)?);
                }
                state.stack = Some(stack);
            }
            Some(ExecutionStateType::Callbacks) => {
                let count = reader.u32()?;
                let mut mapping = CallbackMapping::new();
                for _ in 0..count {
                    let topic = reader.string()?;
                    let target_count = reader.u32()?;
                    let mut targets = Vec::with_capacity(target_count as usize);
                    for _ in 0..target_count {
                        targets.push(reader.u32()?);
                    }
                    mapping.set_targets(topic, targets);
                }
                state.callbacks = Some(mapping);
            }
            Some(ExecutionStateType::Events) => {
                let count = reader.u32()?;
                let mut events = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let topic = reader.string()?;
                    let payload = reader.string()?;
                    events.push(InterruptEvent {
                        topic: topic.into(),
                        payload: payload.into(),
                    });
                }
                state.events = Some(events);
            }
            Some(ExecutionStateType::Error) => {
                let pc = reader.u32()?;
                let message = reader.string()?;
                state.error = Some(ExceptionInfo {
                    pc,
                    message: message.into(),
                });
            }
            None if tag == START_SECTION => state.start_address = Some(reader.u32()?),
            None => return Err(ProtocolError::UnknownStateSection(tag)),
        }
    }
    Ok(state)
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub done: bool,
}

/// Pack encoded fragments into wire messages under a hard size ceiling.
///
/// Fragments are indivisible: each is appended to the current message when
/// it fits, otherwise the message is sealed and a fresh one started. The
/// final message carries the `01` done flag.
pub fn chunk_messages(
    opcode: Opcode,
    fragments: &[Vec<u8>],
    max_message_size: usize,
) -> Result<Vec<String>, EncodeError> {
    let overhead = HEADER_CHARS + FOOTER_CHARS;
    if max_message_size <= overhead + 1 {
        return Err(EncodeError::MessageTooLarge {
            needed: overhead + 2,
            max: max_message_size,
        });
    }
    let capacity = (max_message_size - overhead) / 2;
    let mut messages = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for fragment in fragments {
        if fragment.len() > capacity {
            return Err(EncodeError::FragmentTooLarge {
                fragment: fragment.len(),
                capacity,
                max: max_message_size,
            });
        }
        if current.len() + fragment.len() > capacity {
            messages.push(seal(opcode, &current, false, max_message_size)?);
            current.clear();
        }
        current.extend_from_slice(fragment);
    }
    messages.push(seal(opcode, &current, true, max_message_size)?);
    Ok(messages)
}

/// Parse one wire message back into its payload bytes.
pub fn decode_chunk(line: &str) -> Result<Chunk, ProtocolError> {
    let text = line.strip_suffix('\n').unwrap_or(line);
    let text = text.strip_suffix(' ').unwrap_or(text);
    // The envelope is sliced by byte index below; anything outside ASCII is
    // not a chunk line.
    if !text.is_ascii() {
        return Err(ProtocolError::InvalidChunk(SmolStr::new(
            "non-ASCII bytes in chunk line",
        )));
    }
    if text.len() < HEADER_CHARS + 2 {
        return Err(ProtocolError::InvalidChunk(SmolStr::new(format!(
            "chunk of {} chars is shorter than the fixed envelope",
            text.len()
        ))));
    }
    let opcode = hex::decode_int(&text[0..2], Endian::Big)? as u8;
    let declared = hex::decode_int(&text[2..HEADER_CHARS], Endian::Big)? as usize;
    let flag = &text[text.len() - 2..];
    let done = match flag {
        "00" => false,
        "01" => true,
        other => {
            return Err(ProtocolError::InvalidChunk(SmolStr::new(format!(
                "unknown continuation flag '{other}'"
            ))))
        }
    };
    let payload = hex::hex_to_bytes(&text[HEADER_CHARS..text.len() - 2])?;
    if payload.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(Chunk {
        opcode,
        payload,
        done,
    })
}

fn seal(
    opcode: Opcode,
    payload: &[u8],
    done: bool,
    max_message_size: usize,
) -> Result<String, EncodeError> {
    let mut line = opcode.wire();
    line.push_str(&hex::encode_int(payload.len() as u64, 4, Endian::Big));
    line.push_str(&hex::bytes_to_hex(payload));
    line.push_str(if done { "01" } else { "00" });
    line.push_str(" \n");
    // The packer keeps payloads under capacity; this guards the invariant.
    if line.len() > max_message_size {
        return Err(EncodeError::MessageTooLarge {
            needed: line.len(),
            max: max_message_size,
        });
    }
    Ok(line)
}

fn encode_frame(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let mut out = vec![frame.kind.code()];
    push_u32(&mut out, frame.sp as u32);
    push_u32(&mut out, frame.fp as u32);
    push_u32(&mut out, frame.ra);
    match frame.kind {
        FrameType::Function => {
            let fidx = frame.fidx.ok_or_else(|| {
                EncodeError::FrameFieldMismatch("function frame without fidx".into())
            })?;
            push_u32(&mut out, fidx);
        }
        FrameType::ProxyGuard | FrameType::CallbackGuard => {
            if frame.fidx.is_some() || frame.block_key.is_some() {
                return Err(EncodeError::FrameFieldMismatch(
                    "guard frame carrying an index".into(),
                ));
            }
        }
        _ => {
            let key = frame.block_key.ok_or_else(|| {
                EncodeError::FrameFieldMismatch("block frame without block_key".into())
            })?;
            push_u32(&mut out, key);
        }
    }
    Ok(out)
}

fn decode_frame(reader: &mut Reader<'_>) -> Result<Frame, ProtocolError> {
    let code = reader.u8()?;
    let kind = FrameType::from_code(code).ok_or(ProtocolError::InvalidFrameType(code))?;
    let sp = reader.u32()? as i32;
    let fp = reader.u32()? as i32;
    let ra = reader.u32()?;
    let frame = match kind {
        FrameType::Function => Frame::function(reader.u32()?, sp, fp, ra),
        FrameType::ProxyGuard | FrameType::CallbackGuard => Frame::guard(kind, sp, fp, ra),
        _ => Frame::block(kind, reader.u32()?, sp, fp, ra),
    };
    Ok(frame)
}

fn encode_value(value: WasmValue) -> Vec<u8> {
    let mut out = vec![value.tag()];
    match value {
        WasmValue::I32(v) => out.extend(hex::encode_sleb128(i64::from(v))),
        WasmValue::I64(v) => out.extend(hex::encode_sleb128(v)),
        WasmValue::F32(v) => out.extend(v.to_bits().to_le_bytes()),
        WasmValue::F64(v) => out.extend(v.to_bits().to_le_bytes()),
    }
    out
}

fn decode_value(reader: &mut Reader<'_>) -> Result<WasmValue, ProtocolError> {
    match reader.u8()? {
        0 => {
            let (value, _) = reader.sleb128()?;
            let value =
                i32::try_from(value).map_err(|_| ProtocolError::MalformedDump("i32 range".into()))?;
            Ok(WasmValue::I32(value))
        }
        1 => {
            let (value, _) = reader.sleb128()?;
            Ok(WasmValue::I64(value))
        }
        2 => {
            let bytes: [u8; 4] = reader.take(4)?.try_into().map_err(|_| ProtocolError::UnexpectedEof)?;
            Ok(WasmValue::F32(f32::from_bits(u32::from_le_bytes(bytes))))
        }
        3 => {
            let bytes: [u8; 8] = reader.take(8)?.try_into().map_err(|_| ProtocolError::UnexpectedEof)?;
            Ok(WasmValue::F64(f64::from_bits(u64::from_le_bytes(bytes))))
        }
        tag => Err(ProtocolError::MalformedDump(SmolStr::new(format!(
            "unknown value tag 0x{tag:02x}"
        )))),
    }
}

fn section_header(tag: u8, count: u32) -> Vec<u8> {
    let mut out = vec![tag];
    push_u32(&mut out, count);
    out
}

fn section_u32(tag: u8, value: u32) -> Vec<u8> {
    let mut out = vec![tag];
    push_u32(&mut out, value);
    out
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    push_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next_tag(&mut self) -> Option<u8> {
        let tag = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(tag)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.bytes.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| ProtocolError::UnexpectedEof)?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(ProtocolError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::MalformedDump("non-UTF-8 string".into()))
    }

    fn sleb128(&mut self) -> Result<(i64, usize), ProtocolError> {
        let (value, used) = hex::decode_sleb128(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok((value, used))
    }
}
