/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! On-wire protocol spoken by a panicking kernel.
//!
//! A dump is a sequence of UDP datagrams: a herald announcing the dump, a
//! kernel dump header describing it, a stream of vmcore chunks carrying the
//! memory image at absolute offsets, and a finished marker. Every datagram
//! is acknowledged by sequence number on a connected reply socket.

pub mod kdh;
pub mod wire;

/// UDP port the daemon listens on and replies from.
pub const NETDUMP_PORT: u16 = 20023;

/// Maximum payload bytes per datagram. Sized so a full chunk plus headers
/// fits a standard 1500-byte MTU.
pub const NETDUMP_DATASIZE: usize = 1456;

/// Size of the fixed datagram header on the wire.
pub const HEADER_SIZE: usize = 20;
