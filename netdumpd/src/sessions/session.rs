/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Per-client dump session.
//!
//! A session is the sole owner of its connected reply socket, its info and
//! core files and its coalescing buffer; removing it from the session table
//! is the only way to destroy it and releases everything. Construction is
//! the fallible path with rollback (anything acquired before a failing step
//! is simply dropped); teardown of a live session additionally writes the
//! one-line outcome to the info file and fires the notification hook.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::time::Instant;

use nix::sys::socket::{setsockopt, sockopt};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use super::coalescer::VmcoreBuffer;
use super::error::{Result, SessionError};
use super::hostname;
use crate::protocol::kdh::{KdhError, KernelDumpHeader};
use crate::protocol::wire::{self, Datagram, MessageType, ParseError};
use crate::protocol::NETDUMP_DATASIZE;
use crate::server::{herald, ServerContext};

/// Receive-buffer hint for the session socket: enough for roughly twice the
/// coalescing window of in-flight chunks.
const SOCKET_RCVBUF: usize = 128 * 1024;

/// Log a progress line roughly every 16 MiB of core stream.
const PROGRESS_INTERVAL: u32 = (16 * 1024 * 1024 / NETDUMP_DATASIZE) as u32;

/// What the event loop should do with the session after a datagram.
#[derive(Debug)]
pub enum Outcome {
    /// Keep going.
    Continue,
    /// FINISHED handled; the dump is durable and the hook has run.
    Completed,
    /// The output became unusable; the hook has run.
    Failed,
    /// The client announced a fresh dump mid-stream; time this session out
    /// and start a new one.
    Superseded { seqno: u32, prefix: String },
}

#[derive(Debug)]
pub struct Session {
    peer: SocketAddrV4,
    local: SocketAddrV4,
    hostname: String,
    socket: UdpSocket,
    info: BufWriter<File>,
    core: File,
    info_name: String,
    core_name: String,
    prefix: String,
    vmcore: VmcoreBuffer,
    any_data_rcvd: bool,
    last_msg: Instant,
}

impl Session {
    /// Build a session for `peer`, replying from `dst`. Each step's failure
    /// releases everything acquired by the steps before it.
    pub(crate) async fn establish(
        ctx: &ServerContext,
        peer: SocketAddrV4,
        dst: Ipv4Addr,
        prefix: String,
    ) -> Result<Session> {
        let ip = *peer.ip();
        let hostname = hostname::resolve_short(ctx.resolver.as_ref(), ip).await;

        let socket = herald::session_socket(SocketAddrV4::new(dst, ctx.port), peer)
            .map_err(|source| SessionError::Socket { ip, source })?;

        if let Err(e) = setsockopt(socket.as_raw_fd(), sockopt::RcvBuf, &SOCKET_RCVBUF) {
            error!("setsockopt(SO_RCVBUF): {e}");
            warn!("may drop packets from {hostname} due to small receive buffer");
        }

        let socket = UdpSocket::from_std(socket)
            .map_err(|source| SessionError::Socket { ip, source })?;
        // The configured port may be 0 (tests); record what was actually
        // bound so the reply address is always real.
        let local = match socket.local_addr() {
            Ok(std::net::SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(dst, ctx.port),
        };

        let output = ctx
            .spool
            .reserve(&prefix, &hostname)
            .map_err(|source| SessionError::Output { host: hostname.clone(), ip, source })?;

        Ok(Session {
            peer,
            local,
            hostname,
            socket,
            info: BufWriter::new(output.info),
            core: output.core,
            info_name: output.info_name,
            core_name: output.core_name,
            prefix,
            vmcore: VmcoreBuffer::new(),
            any_data_rcvd: false,
            last_msg: Instant::now(),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.peer.ip()
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn any_data_rcvd(&self) -> bool {
        self.any_data_rcvd
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub(crate) fn last_msg(&self) -> Instant {
        self.last_msg
    }

    /// First words of a new session: info-file header line and the ack for
    /// the herald that created it.
    pub(crate) fn hello(&mut self, seqno: u32) {
        let _ = writeln!(self.info, "Dump from {} [{}]", self.hostname, self.ip());
        info!("new dump from client {} [{}] (to {})", self.hostname, self.ip(), self.core_name);
        self.send_ack(seqno);
    }

    /// Dispatch one datagram received on the session socket.
    pub(crate) fn handle_datagram(&mut self, ctx: &ServerContext, bytes: &[u8]) -> Outcome {
        let pkt = match Datagram::parse(bytes) {
            Ok(pkt) => pkt,
            Err(ParseError::UnknownType(t)) => {
                // Structurally sound, so the client is alive; the type is
                // just one we do not speak. No ack.
                self.last_msg = Instant::now();
                warn!(
                    "unexpected message type {t} from {} [{}]",
                    self.hostname,
                    self.ip()
                );
                return Outcome::Continue;
            }
            Err(e) => {
                warn!("ignoring datagram from {} [{}]: {e}", self.hostname, self.ip());
                return Outcome::Continue;
            }
        };

        self.last_msg = Instant::now();

        match pkt.msg_type {
            MessageType::Herald => self.handle_herald(&pkt),
            MessageType::Kdh => {
                self.handle_kdh(&pkt);
                Outcome::Continue
            }
            MessageType::Vmcore => self.handle_vmcore(ctx, &pkt),
            MessageType::Finished => self.handle_finish(ctx, &pkt),
        }
    }

    /// A herald on the session socket is the client retransmitting after a
    /// lost ack (same source port, so it lands on the connected socket), or
    /// a rebooted client that happened to reuse its port.
    fn handle_herald(&mut self, pkt: &Datagram<'_>) -> Outcome {
        if !self.any_data_rcvd {
            self.send_ack(pkt.seqno);
            return Outcome::Continue;
        }
        match super::spool::herald_path(pkt.payload) {
            Some(prefix) => Outcome::Superseded { seqno: pkt.seqno, prefix },
            None => {
                warn!("ignoring herald with bad path from {} [{}]", self.hostname, self.ip());
                Outcome::Continue
            }
        }
    }

    fn handle_kdh(&mut self, pkt: &Datagram<'_>) {
        self.any_data_rcvd = true;

        let header = match KernelDumpHeader::parse(pkt.payload) {
            Ok(header) => header,
            Err(KdhError::TooShort { .. }) => {
                error!("bad KDH from {} [{}]: packet too small", self.hostname, self.ip());
                let _ = writeln!(self.info, "Bad KDH: packet too small");
                let _ = self.info.flush();
                return;
            }
        };

        if !(1..=3).contains(&header.version) {
            warn!(
                "KDH from {} [{}] has unrecognized version {}, read with the newest layout",
                self.hostname,
                self.ip(),
                header.version
            );
        }
        self.write_kdh_summary(&header);
        let _ = self.info.flush();

        info!("KDH from {} [{}]", self.hostname, self.ip());
        self.send_ack(pkt.seqno);
    }

    fn write_kdh_summary(&mut self, h: &KernelDumpHeader) {
        let info = &mut self.info;
        let _ = writeln!(info, "  Architecture: {}", h.architecture);
        let _ = writeln!(info, "  Architecture version: {}", h.architecture_version);
        let _ = writeln!(
            info,
            "  Dump length: {}B ({} MB)",
            h.dump_length,
            h.dump_length >> 20
        );
        if let Some(extent) = h.dump_extent {
            let _ = writeln!(info, "  Dump extent: {extent}B");
        }
        let _ = writeln!(info, "  blocksize: {}", h.block_size);
        if let Some(key_size) = h.dump_key_size {
            let _ = writeln!(info, "  Dump key size: {key_size}");
        }
        if let Some(compression) = h.compression {
            let _ = writeln!(info, "  Compression: {compression}");
        }
        let _ = writeln!(info, "  Dumptime: {}", ctime(h.dump_time));
        let _ = writeln!(info, "  Hostname: {}", h.hostname);
        let _ = writeln!(info, "  Versionstring: {}", h.version_string.trim_end());
        let _ = writeln!(info, "  Panicstring: {}", h.panic_string);
        let _ = writeln!(
            info,
            "  Header parity check: {}",
            if h.parity_ok { "Pass" } else { "Fail" }
        );
    }

    fn handle_vmcore(&mut self, ctx: &ServerContext, pkt: &Datagram<'_>) -> Outcome {
        self.any_data_rcvd = true;

        if pkt.seqno % PROGRESS_INTERVAL == 0 {
            info!(
                "dump from {} [{}]: {} MiB buffered or written",
                self.hostname,
                self.ip(),
                pkt.offset >> 20
            );
        }

        match self.vmcore.append(&self.core, pkt.offset, pkt.payload) {
            Ok(()) => {
                self.send_ack(pkt.seqno);
                Outcome::Continue
            }
            Err(e) => self.write_failed(ctx, e),
        }
    }

    fn handle_finish(&mut self, ctx: &ServerContext, pkt: &Datagram<'_>) -> Outcome {
        // Commit any buffered core data before acknowledging anything.
        if let Err(e) = self.vmcore.flush(&self.core) {
            return self.write_failed(ctx, e);
        }
        if let Err(e) = self.core.sync_all() {
            return self.write_failed(ctx, e);
        }

        if let Err(e) =
            ctx.spool.commit_last_links(&self.prefix, &self.hostname, &self.info_name, &self.core_name)
        {
            // The dump itself is durable; stale .last links are tolerable.
            error!("updating .last links for {}: {e}", self.hostname);
        }

        info!(
            "completed dump from client {} [{}] ({} core writes)",
            self.hostname,
            self.ip(),
            self.vmcore.flushes()
        );
        let _ = writeln!(self.info, "Dump complete");
        let _ = self.info.flush();
        self.send_ack(pkt.seqno);
        self.notify(ctx, "success");
        Outcome::Completed
    }

    fn write_failed(&mut self, ctx: &ServerContext, e: io::Error) -> Outcome {
        error!(
            "write to {} for client {} [{}] failed: {e}",
            self.core_name,
            self.hostname,
            self.ip()
        );
        let _ = writeln!(
            self.info,
            "Dump unsuccessful: write error @ offset {:08x}: {e}",
            self.vmcore.run_offset()
        );
        let _ = self.info.flush();
        self.notify(ctx, "error");
        Outcome::Failed
    }

    /// Record the timeout outcome in the info file. The caller owns removal
    /// and the hook.
    pub(crate) fn note_timeout(&mut self) {
        info!("client {} [{}] timed out", self.hostname, self.ip());
        let _ = writeln!(self.info, "Dump incomplete: client timed out");
        let _ = self.info.flush();
    }

    pub(crate) fn notify(&self, ctx: &ServerContext, reason: &str) {
        ctx.notifier.notify(
            reason,
            self.ip(),
            &self.hostname,
            &ctx.spool.locate(&self.info_name),
            &ctx.spool.locate(&self.core_name),
        );
    }

    pub(crate) fn send_ack(&self, seqno: u32) {
        match self.socket.try_send(&wire::encode_ack(seqno)) {
            Ok(_) => {}
            // The client retransmits; dropping an ack is harmless.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("ack to {} [{}] failed: {e}", self.hostname, self.ip()),
        }
    }
}

fn ctime(timestamp: i64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0) {
        Some(t) => t.format("%a %b %e %H:%M:%S %Y").to_string(),
        None => format!("@{timestamp}"),
    }
}
