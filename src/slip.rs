//! SLIP (RFC 1055) framing used for every packet exchanged with the
//! on-chip boot ROM and the flash bootloader.
//!
//! `0xC0` delimits frames; `0xDB` escapes the two bytes that would
//! otherwise be ambiguous on the wire.

use std::io::Read;

use crate::{Error, Result};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode `data` into a complete SLIP frame, appending to `out`.
///
/// Streams directly into the caller's buffer rather than building an
/// intermediate iterator, per the redesign note on lazy sequence building.
pub fn encode_into(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len() + 2);
    out.push(END);
    for &b in data {
        match b {
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            _ => out.push(b),
        }
    }
    out.push(END);
}

/// Encode `data` into a new SLIP frame.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    encode_into(data, &mut out);
    out
}

/// Read one SLIP frame from `reader`, discarding any bytes before the
/// opening delimiter, and return the inner (unescaped) payload.
pub fn decode<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut byte = [0u8; 1];

    // Discard bytes until we see the opening delimiter.
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == END {
            break;
        }
    }

    reader.read_exact(&mut byte)?;
    let mut out = Vec::new();
    loop {
        match byte[0] {
            END => return Ok(out),
            ESC => {
                reader.read_exact(&mut byte)?;
                match byte[0] {
                    ESC_END => out.push(END),
                    ESC_ESC => out.push(ESC),
                    _ => return Err(Error::InvalidEscape),
                }
            }
            b => out.push(b),
        }
        reader.read_exact(&mut byte)?;
    }
}
