/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Kernel dump header (KDH) parsing.
//!
//! The KDH is a fixed 512-byte block carried in the first non-herald
//! datagram. Three layout versions exist; all are 512 bytes, share their
//! leading fields, and close with a parity word. String fields arrive from a
//! panicking kernel and are forcibly NUL-terminated before any use. The
//! parity word is advisory: the XOR of all 32-bit words of the header must
//! come to zero, and a mismatch is reported but never fatal.

use thiserror::Error;

/// Total size of a kernel dump header, identical across layout versions.
pub const KDH_SIZE: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdhError {
    #[error("packet too small ({got} bytes, header is {KDH_SIZE})")]
    TooShort { got: usize },
}

#[derive(Debug)]
pub struct KernelDumpHeader {
    pub version: u32,
    pub architecture: String,
    pub architecture_version: u32,
    pub dump_length: u64,
    /// v3 only.
    pub dump_extent: Option<u64>,
    pub dump_time: i64,
    /// v2 and v3 only.
    pub dump_key_size: Option<u32>,
    pub block_size: u32,
    /// v3 only.
    pub compression: Option<u8>,
    pub hostname: String,
    pub version_string: String,
    pub panic_string: String,
    pub parity_ok: bool,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Read a fixed-size string field, forcing a terminating NUL into the last
/// byte before scanning for the end of the string.
fn read_string(bytes: &[u8], at: usize, len: usize) -> String {
    let field = &bytes[at..at + len - 1];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parity_ok(bytes: &[u8]) -> bool {
    let mut acc = 0u32;
    for word in bytes[..KDH_SIZE].chunks_exact(4) {
        acc ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }
    acc == 0
}

impl KernelDumpHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, KdhError> {
        if payload.len() < KDH_SIZE {
            return Err(KdhError::TooShort { got: payload.len() });
        }

        let version = read_u32(payload, 32);
        let architecture = read_string(payload, 20, 12);
        let architecture_version = read_u32(payload, 36);
        let dump_length = read_u64(payload, 40);

        // The layouts diverge after the dump length. Unknown versions are
        // read with the newest known layout.
        let (dump_extent, dump_time, dump_key_size, block_size, compression, strings_at) =
            match version {
                1 => (None, read_u64(payload, 48), None, read_u32(payload, 56), None, 60),
                2 => (
                    None,
                    read_u64(payload, 48),
                    Some(read_u32(payload, 56)),
                    read_u32(payload, 60),
                    None,
                    64,
                ),
                _ => (
                    Some(read_u64(payload, 48)),
                    read_u64(payload, 56),
                    Some(read_u32(payload, 64)),
                    read_u32(payload, 68),
                    Some(payload[72]),
                    73,
                ),
            };

        let hostname = read_string(payload, strings_at, 64);
        let version_string = read_string(payload, strings_at + 64, 192);
        let panic_len = KDH_SIZE - 4 - (strings_at + 64 + 192);
        let panic_string = read_string(payload, strings_at + 64 + 192, panic_len);

        Ok(KernelDumpHeader {
            version,
            architecture,
            architecture_version,
            dump_length,
            dump_extent,
            dump_time: dump_time as i64,
            dump_key_size,
            block_size,
            compression,
            hostname,
            version_string,
            panic_string,
            parity_ok: parity_ok(payload),
        })
    }
}
