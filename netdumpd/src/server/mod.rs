/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The readiness-driven event loop.
//!
//! One `select!` is the daemon's only suspension point: the listening
//! socket (heralds), every session's connected socket, SIGINT/SIGTERM and
//! the sweep tick. Every dispatched handler runs to completion before the
//! next datagram is observed, so session state never needs locking.

pub mod herald;

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::time::Instant;

use anyhow::Context;
use hickory_resolver::TokioAsyncResolver;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::protocol::wire::{Datagram, MessageType};
use crate::sessions::spool::{herald_path, SpoolDir};
use crate::sessions::{Outcome, Session, Sessions, CLIENT_TPASS};

use self::herald::HeraldSocket;

/// Receive-buffer size for one datagram. Larger than the wire maximum so an
/// oversized datagram arrives untruncated and fails the length check
/// instead of masquerading as a full-sized one.
const DGRAM_BUFSZ: usize = 2048;

/// Everything the per-session handlers need besides the session itself.
pub struct ServerContext {
    pub spool: SpoolDir,
    pub notifier: Notifier,
    pub resolver: Option<TokioAsyncResolver>,
    /// Port the listener is bound to; session sockets bind it too.
    pub port: u16,
}

#[derive(Debug)]
enum Wake {
    Herald,
    Client(Ipv4Addr, std::io::Result<usize>),
    Sweep,
    Shutdown,
}

pub struct DumpServer {
    listener: HeraldSocket,
    sessions: Sessions,
    ctx: ServerContext,
}

impl DumpServer {
    pub fn new(listener: StdUdpSocket, ctx: ServerContext) -> anyhow::Result<Self> {
        let listener = HeraldSocket::new(listener)
            .context("could not register the listening socket")?;
        Ok(Self { listener, sessions: Sessions::new(), ctx })
    }

    /// Actual bound address of the listening socket.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until SIGINT or SIGTERM, then drain every live session through
    /// the timeout path.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut sigint =
            signal(SignalKind::interrupt()).context("could not listen for SIGINT")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("could not listen for SIGTERM")?;

        let mut sweep = tokio::time::interval(CLIENT_TPASS);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = [0u8; DGRAM_BUFSZ];

        info!("waiting for clients");
        loop {
            let wake = {
                let sessions = &self.sessions;
                let listener = &self.listener;
                tokio::select! {
                    _ = sigint.recv() => Wake::Shutdown,
                    _ = sigterm.recv() => Wake::Shutdown,
                    _ = listener.readable() => Wake::Herald,
                    (ip, result) = sessions.next_event(&mut buf) => Wake::Client(ip, result),
                    _ = sweep.tick() => Wake::Sweep,
                }
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Herald => self.server_event(&mut buf).await,
                Wake::Client(ip, Ok(len)) => {
                    let outcome = match self.sessions.get_mut(&ip) {
                        Some(session) => session.handle_datagram(&self.ctx, &buf[..len]),
                        None => continue,
                    };
                    self.conclude(ip, outcome).await;
                }
                Wake::Client(ip, Err(e)) => {
                    error!("recv from {ip}: {e}");
                    self.sessions.timeout(&self.ctx, ip);
                }
                Wake::Sweep => self.sessions.sweep(&self.ctx, Instant::now()),
            }
        }

        info!("shutting down");
        self.sessions.shutdown(&self.ctx);
        Ok(())
    }

    /// Handle a read event on the listening socket: a herald from a new
    /// client, a retransmitted herald, or a herald superseding a live dump.
    async fn server_event(&mut self, buf: &mut [u8]) {
        let (len, src, dst) = match self.listener.try_recv_with_dst(buf) {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                error!("recvmsg on server socket: {e}");
                return;
            }
        };

        let pkt = match Datagram::parse(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("ignoring datagram on server socket from {}: {e}", src.ip());
                return;
            }
        };
        if pkt.msg_type != MessageType::Herald {
            warn!(
                "ignoring unexpected {:?} on server socket from {}",
                pkt.msg_type,
                src.ip()
            );
            return;
        }
        let Some(prefix) = herald_path(pkt.payload) else {
            warn!("ignoring herald with bad path from {}", src.ip());
            return;
        };
        let seqno = pkt.seqno;

        if let Some(session) = self.sessions.get_mut(src.ip()) {
            if !session.any_data_rcvd() {
                // Retransmit of the herald packet.
                session.send_ack(seqno);
                return;
            }
            // The client is starting over; its previous dump is dead.
            self.sessions.timeout(&self.ctx, *src.ip());
        }

        self.open_session(src, dst, prefix, seqno).await;
    }

    async fn open_session(
        &mut self,
        peer: SocketAddrV4,
        dst: Ipv4Addr,
        prefix: String,
        seqno: u32,
    ) {
        match Session::establish(&self.ctx, peer, dst, prefix).await {
            Ok(mut session) => {
                session.hello(seqno);
                self.sessions.insert(session);
            }
            // The herald stays unacked; the client retries and gives up.
            Err(e) => error!("new client allocation failure: {e}"),
        }
    }

    async fn conclude(&mut self, ip: Ipv4Addr, outcome: Outcome) {
        match outcome {
            Outcome::Continue => {}
            Outcome::Completed | Outcome::Failed => {
                let _ = self.sessions.remove(&ip);
            }
            Outcome::Superseded { seqno, prefix } => {
                let Some(session) = self.sessions.get_mut(&ip) else {
                    return;
                };
                let peer = session.peer();
                let dst = *session.local().ip();
                self.sessions.timeout(&self.ctx, ip);
                self.open_session(peer, dst, prefix, seqno).await;
            }
        }
    }
}
