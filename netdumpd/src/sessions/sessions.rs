/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The in-memory table of live dump sessions.
//!
//! At most one session exists per remote IPv4 address. The table owns its
//! entries exclusively; removal is the only way a session dies, and every
//! terminal path goes through here so the hook always runs.

use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::Ipv4Addr;
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::io::ReadBuf;

use super::session::Session;
use crate::server::ServerContext;

/// Netdump timeout period: a client silent this long is dead.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Scan for timed-out clients this often.
pub const CLIENT_TPASS: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Sessions {
    table: HashMap<Ipv4Addr, Session>,
    last_sweep: Instant,
}

impl Sessions {
    pub fn new() -> Self {
        Self { table: HashMap::new(), last_sweep: Instant::now() }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get_mut(&mut self, ip: &Ipv4Addr) -> Option<&mut Session> {
        self.table.get_mut(ip)
    }

    pub fn insert(&mut self, session: Session) {
        let _ = self.table.insert(session.ip(), session);
    }

    pub fn remove(&mut self, ip: &Ipv4Addr) -> Option<Session> {
        self.table.remove(ip)
    }

    /// Wait for a datagram on any session socket. Pending while the table is
    /// empty. Returns the owning address and the receive result; the
    /// datagram itself lands in `buf`.
    pub async fn next_event(&self, buf: &mut [u8]) -> (Ipv4Addr, io::Result<usize>) {
        poll_fn(|cx| {
            for (ip, session) in &self.table {
                let mut read_buf = ReadBuf::new(&mut buf[..]);
                match session.socket().poll_recv(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        return Poll::Ready((*ip, Ok(read_buf.filled().len())));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready((*ip, Err(e))),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Drive the Timeout terminal transition for one session: outcome line,
    /// hook, removal.
    pub fn timeout(&mut self, ctx: &ServerContext, ip: Ipv4Addr) {
        if let Some(mut session) = self.table.remove(&ip) {
            session.note_timeout();
            session.notify(ctx, "timeout");
        }
    }

    /// Time out every session idle beyond [CLIENT_TIMEOUT]. Runs at most
    /// once per [CLIENT_TPASS] no matter how often it is called.
    pub fn sweep(&mut self, ctx: &ServerContext, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < CLIENT_TPASS {
            return;
        }
        self.last_sweep = now;

        let stale: Vec<Ipv4Addr> = self
            .table
            .iter()
            .filter(|(_, session)| {
                now.saturating_duration_since(session.last_msg()) > CLIENT_TIMEOUT
            })
            .map(|(ip, _)| *ip)
            .collect();
        for ip in stale {
            self.timeout(ctx, ip);
        }
    }

    /// Cooperative shutdown: every remaining session goes through the
    /// Timeout transition so the hook runs for each.
    pub fn shutdown(&mut self, ctx: &ServerContext) {
        let all: Vec<Ipv4Addr> = self.table.keys().copied().collect();
        for ip in all {
            self.timeout(ctx, ip);
        }
    }
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::sessions::spool::SpoolDir;
    use std::net::SocketAddrV4;

    fn context(dir: &tempfile::TempDir) -> ServerContext {
        ServerContext {
            spool: SpoolDir::open(dir.path()).expect("spool"),
            notifier: Notifier::new(None),
            resolver: None,
            port: 0,
        }
    }

    async fn fake_client(ctx: &ServerContext, port: u16) -> Session {
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        Session::establish(ctx, peer, Ipv4Addr::LOCALHOST, String::new())
            .await
            .expect("establish")
    }

    #[tokio::test]
    async fn one_session_per_address() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);
        let mut sessions = Sessions::new();

        sessions.insert(fake_client(&ctx, 4000).await);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get_mut(&Ipv4Addr::LOCALHOST).is_some());

        // Same address replaces, never duplicates.
        sessions.insert(fake_client(&ctx, 4001).await);
        assert_eq!(sessions.len(), 1);

        assert!(sessions.remove(&Ipv4Addr::LOCALHOST).is_some());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);
        let mut sessions = Sessions::new();
        sessions.insert(fake_client(&ctx, 4000).await);

        // Just under the timeout: survives.
        let now = Instant::now() + CLIENT_TIMEOUT;
        sessions.sweep(&ctx, now);
        assert_eq!(sessions.len(), 1);

        // Past the timeout: evicted, and the info file records it.
        let now = now + CLIENT_TPASS + Duration::from_secs(1);
        sessions.sweep(&ctx, now);
        assert!(sessions.is_empty());

        let info =
            std::fs::read_to_string(dir.path().join("info.127.0.0.1.0")).expect("info");
        assert!(info.ends_with("Dump incomplete: client timed out\n"));
    }

    #[tokio::test]
    async fn sweep_rate_limits_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);
        let mut sessions = Sessions::new();
        sessions.insert(fake_client(&ctx, 4000).await);

        let first = Instant::now() + CLIENT_TIMEOUT;
        sessions.sweep(&ctx, first);
        assert_eq!(sessions.len(), 1);
        // Five seconds later the session is stale, but the pass is inside
        // the rate-limit window and must not run.
        sessions.sweep(&ctx, first + Duration::from_secs(5));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_everything_through_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);
        let mut sessions = Sessions::new();
        sessions.insert(fake_client(&ctx, 4000).await);

        sessions.shutdown(&ctx);
        assert!(sessions.is_empty());
        let info =
            std::fs::read_to_string(dir.path().join("info.127.0.0.1.0")).expect("info");
        assert!(info.ends_with("Dump incomplete: client timed out\n"));
    }
}
