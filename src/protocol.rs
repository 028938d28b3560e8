// Copyright 2022 Stephen Checkoway
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire format: packet header layout, greeting constants, op codes, and
//! the ISP/flash-mode response taxonomy.
//!
//! A packet is SLIP-framed (see [`crate::slip`]) around a 16-byte header
//! followed by an optional payload. The header's checksum field covers
//! everything from byte 8 onward — it must read as zero while being
//! computed and is then patched in.

use std::io::Cursor;

use binrw::{binrw, BinWrite, WriteOptions};

use crate::Result;

/// Write `ISP_MEMORY_WRITE` commands to install the flash bootloader.
pub const ISP_MEMORY_WRITE: u16 = 0xC3;
/// Jump to the just-installed flash bootloader.
pub const ISP_MEMORY_BOOT: u16 = 0xC5;
/// Write one chunk of a flash firmware envelope.
pub const ISP_FLASH_WRITE: u16 = 0xD4;
/// Renegotiate the UART baud rate.
pub const ISP_UARTHS_BAUDRATE_SET: u16 = 0xD6;
/// Initialize the target flash chip (flash-mode only).
pub const FLASHMODE_FLASH_INIT: u16 = 0xD7;

/// Raw, already SLIP-framed ISP greeting: probes the boot ROM.
pub const ISP_GREETING: [u8; 15] = [
    0xC0, 0xC2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xC0,
];
/// Raw, already SLIP-framed flash-mode greeting: probes the installed
/// flash bootloader.
pub const FLASH_GREETING: [u8; 15] = [
    0xC0, 0xD2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xC0,
];

#[binrw]
#[brw(little)]
struct PacketHeader {
    op: u16,
    zero: u16,
    checksum: u32,
    address: u32,
    length: u32,
}

/// Assemble a packet's payload bytes (pre-SLIP-encoding): a 16-byte
/// header followed by `payload`, with the CRC32 over bytes `[8..]`
/// patched into the checksum field at offset 4.
pub fn build_packet(op: u16, address: u32, payload: Option<&[u8]>) -> Vec<u8> {
    let payload = payload.unwrap_or(&[]);
    let mut out = Vec::with_capacity(16 + payload.len());
    {
        let mut cursor = Cursor::new(&mut out);
        let header = PacketHeader {
            op,
            zero: 0,
            checksum: 0,
            address,
            length: payload.len() as u32,
        };
        let options = WriteOptions::new(binrw::Endian::Little);
        header
            .write_options(&mut cursor, &options, ())
            .expect("writing a fixed-size header into a Vec cannot fail");
    }
    out.extend_from_slice(payload);

    let checksum = crc32fast::hash(&out[8..]);
    out[4..8].copy_from_slice(&checksum.to_le_bytes());
    out
}

/// ISP/flash-mode response status, shared between both protocol phases.
///
/// Unknown values decode to [`IspStatus::Unknown`] rather than panicking,
/// per the "enum-as-u8 parsing" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspStatus {
    Default,
    Ok,
    BadDataLen,
    BadDataChecksum,
    InvalidCommand,
    Unknown(u8),
}

impl From<u8> for IspStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => IspStatus::Default,
            0xE0 => IspStatus::Ok,
            0xE1 => IspStatus::BadDataLen,
            0xE2 => IspStatus::BadDataChecksum,
            0xE3 => IspStatus::InvalidCommand,
            other => IspStatus::Unknown(other),
        }
    }
}

impl IspStatus {
    /// Whether this status counts as success. Everywhere except the
    /// greeting, `Default` and `Ok` both count; the greeting only
    /// accepts `Ok`.
    pub fn is_success(self, strict_ok_only: bool) -> bool {
        match self {
            IspStatus::Ok => true,
            IspStatus::Default => !strict_ok_only,
            _ => false,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            IspStatus::Default => 0x00,
            IspStatus::Ok => 0xE0,
            IspStatus::BadDataLen => 0xE1,
            IspStatus::BadDataChecksum => 0xE2,
            IspStatus::InvalidCommand => 0xE3,
            IspStatus::Unknown(v) => v,
        }
    }
}

/// A decoded `(op, status)` response: bytes 0 and 1 of
/// the SLIP payload.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub op: u8,
    pub status: IspStatus,
}

/// Parse an already SLIP-decoded inbound message into its `(op, status)`
/// tuple.
pub fn parse_response(payload: &[u8]) -> Result<Response> {
    if payload.len() < 2 {
        // Too short to carry an op/status pair; treat as an unknown,
        // always-failing response so callers retry/escalate normally.
        return Ok(Response {
            op: 0,
            status: IspStatus::Unknown(0xFF),
        });
    }
    Ok(Response {
        op: payload[0],
        status: IspStatus::from(payload[1]),
    })
}
