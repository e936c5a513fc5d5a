//! Fixed-width hexadecimal codecs and signed LEB128.
//! - integers and floats to/from hex text, big or little endian
//! - UTF-8 strings to/from hex
//! - signed LEB128 for WASM value payloads

use crate::error::ProtocolError;

/// Byte order for fixed-width fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Encode the low `width` bytes of `value` as lowercase hex.
#[must_use]
pub fn encode_int(value: u64, width: usize, endian: Endian) -> String {
    let mut out = String::with_capacity(width * 2);
    for i in 0..width {
        let shift = match endian {
            Endian::Big => (width - 1 - i) * 8,
            Endian::Little => i * 8,
        };
        let byte = ((value >> shift) & 0xff) as u8;
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decode a fixed-width hex integer. The full text is consumed; at most
/// eight bytes (sixteen digits) are accepted.
pub fn decode_int(hex: &str, endian: Endian) -> Result<u64, ProtocolError> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.len() > 8 {
        return Err(ProtocolError::ValueTooWide(bytes.len()));
    }
    let mut value = 0u64;
    match endian {
        Endian::Big => {
            for byte in &bytes {
                value = (value << 8) | u64::from(*byte);
            }
        }
        Endian::Little => {
            for byte in bytes.iter().rev() {
                value = (value << 8) | u64::from(*byte);
            }
        }
    }
    Ok(value)
}

/// Encode an `f32` through its bit pattern.
#[must_use]
pub fn encode_f32(value: f32, endian: Endian) -> String {
    encode_int(u64::from(value.to_bits()), 4, endian)
}

/// Encode an `f64` through its bit pattern.
#[must_use]
pub fn encode_f64(value: f64, endian: Endian) -> String {
    encode_int(value.to_bits(), 8, endian)
}

pub fn decode_f32(hex: &str, endian: Endian) -> Result<f32, ProtocolError> {
    let bits = decode_int(hex, endian)?;
    let bits = u32::try_from(bits).map_err(|_| ProtocolError::ValueTooWide(hex.len() / 2))?;
    Ok(f32::from_bits(bits))
}

pub fn decode_f64(hex: &str, endian: Endian) -> Result<f64, ProtocolError> {
    Ok(f64::from_bits(decode_int(hex, endian)?))
}

/// Encode a string's UTF-8 bytes as hex.
#[must_use]
pub fn encode_str(text: &str) -> String {
    bytes_to_hex(text.as_bytes())
}

/// Decode hex back into a UTF-8 string.
pub fn decode_str(hex: &str) -> Result<String, ProtocolError> {
    let bytes = hex_to_bytes(hex)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::MalformedDump("non-UTF-8 string".into()))
}

/// Signed LEB128 encoding, as used for WASM integer values.
#[must_use]
pub fn encode_sleb128(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        let done = (value == 0 && sign_clear) || (value == -1 && !sign_clear);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a signed LEB128 value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_sleb128(bytes: &[u8]) -> Result<(i64, usize), ProtocolError> {
    let mut value = 0i64;
    let mut shift = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(ProtocolError::Leb128Overflow);
        }
        value |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                value |= -1i64 << shift;
            }
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::UnexpectedEof)
}

/// Render raw bytes as lowercase hex.
#[must_use]
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parse hex text into raw bytes. Odd length and stray characters are
/// protocol faults.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, ProtocolError> {
    if hex.len() % 2 != 0 {
        return Err(ProtocolError::OddHexLength(hex.len()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut chars = hex.chars();
    while let (Some(hi), Some(lo)) = (chars.next(), chars.next()) {
        let hi = hex_digit(hi)?;
        let lo = hex_digit(lo)?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_digit(ch: char) -> Result<u8, ProtocolError> {
    ch.to_digit(16)
        .map(|d| d as u8)
        .ok_or(ProtocolError::InvalidHexDigit(ch))
}
